//! Tokenizer for the FHIRPath subset.
//!
//! Scans an expression string into a flat token vector. String literals use
//! single quotes with backslash escapes, numbers carry their raw lexeme so
//! decimal literals survive verbatim, and `$this` / `%name` get dedicated
//! token kinds.

use crate::token::{Token, TokenKind};
use crate::{FhirPathError, Result};

pub struct Lexer {
    input: Vec<char>,
    position: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            position: 0,
        }
    }

    /// Tokenize the whole input, ending with an `Eof` token.
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn current_char(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek_char(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut result = String::new();
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        result
    }

    fn read_string(&mut self, start: usize) -> Result<Token> {
        let mut value = String::new();
        let mut raw = String::from("'");
        self.advance(); // opening quote

        while let Some(ch) = self.current_char() {
            match ch {
                '\'' => {
                    self.advance();
                    raw.push('\'');
                    return Ok(Token::new(TokenKind::String(value), raw, start));
                }
                '\\' => {
                    self.advance();
                    raw.push('\\');
                    match self.current_char() {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('r') => value.push('\r'),
                        Some('\'') => value.push('\''),
                        Some('\\') => value.push('\\'),
                        Some(other) => {
                            return Err(FhirPathError::parse(
                                format!("invalid escape sequence '\\{other}'"),
                                self.position,
                            ));
                        }
                        None => {
                            return Err(FhirPathError::parse(
                                "unterminated string literal",
                                start,
                            ));
                        }
                    }
                    if let Some(ch) = self.current_char() {
                        raw.push(ch);
                    }
                    self.advance();
                }
                _ => {
                    value.push(ch);
                    raw.push(ch);
                    self.advance();
                }
            }
        }

        Err(FhirPathError::parse("unterminated string literal", start))
    }

    fn read_number(&mut self, start: usize) -> Token {
        let mut lexeme = String::new();
        let mut decimal = false;

        while let Some(ch) = self.current_char() {
            if ch.is_ascii_digit() {
                lexeme.push(ch);
                self.advance();
            } else if ch == '.'
                && !decimal
                && self.peek_char(1).is_some_and(|c| c.is_ascii_digit())
            {
                decimal = true;
                lexeme.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        Token::new(
            TokenKind::Number {
                lexeme: lexeme.clone(),
                decimal,
            },
            lexeme,
            start,
        )
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace();
        let start = self.position;

        let Some(ch) = self.current_char() else {
            return Ok(Token::new(TokenKind::Eof, "", start));
        };

        match ch {
            '.' => {
                self.advance();
                Ok(Token::new(TokenKind::Dot, ".", start))
            }
            '(' => {
                self.advance();
                Ok(Token::new(TokenKind::LParen, "(", start))
            }
            ')' => {
                self.advance();
                Ok(Token::new(TokenKind::RParen, ")", start))
            }
            '[' => {
                self.advance();
                Ok(Token::new(TokenKind::LBracket, "[", start))
            }
            ']' => {
                self.advance();
                Ok(Token::new(TokenKind::RBracket, "]", start))
            }
            ',' => {
                self.advance();
                Ok(Token::new(TokenKind::Comma, ",", start))
            }
            '=' => {
                self.advance();
                Ok(Token::new(TokenKind::Eq, "=", start))
            }
            '!' => {
                if self.peek_char(1) == Some('=') {
                    self.advance();
                    self.advance();
                    Ok(Token::new(TokenKind::NotEq, "!=", start))
                } else {
                    Err(FhirPathError::parse("expected '=' after '!'", start))
                }
            }
            '<' => {
                if self.peek_char(1) == Some('=') {
                    self.advance();
                    self.advance();
                    Ok(Token::new(TokenKind::LtEq, "<=", start))
                } else {
                    self.advance();
                    Ok(Token::new(TokenKind::Lt, "<", start))
                }
            }
            '>' => {
                if self.peek_char(1) == Some('=') {
                    self.advance();
                    self.advance();
                    Ok(Token::new(TokenKind::GtEq, ">=", start))
                } else {
                    self.advance();
                    Ok(Token::new(TokenKind::Gt, ">", start))
                }
            }
            '+' => {
                self.advance();
                Ok(Token::new(TokenKind::Plus, "+", start))
            }
            '-' => {
                self.advance();
                Ok(Token::new(TokenKind::Minus, "-", start))
            }
            '*' => {
                self.advance();
                Ok(Token::new(TokenKind::Star, "*", start))
            }
            '/' => {
                self.advance();
                Ok(Token::new(TokenKind::Slash, "/", start))
            }
            '\'' => self.read_string(start),
            '$' => {
                self.advance();
                let name = self.read_identifier();
                if name == "this" {
                    Ok(Token::new(TokenKind::This, "$this", start))
                } else {
                    Err(FhirPathError::parse(
                        format!("unknown special identifier '${name}'"),
                        start,
                    ))
                }
            }
            '%' => {
                self.advance();
                let name = self.read_identifier();
                if name.is_empty() {
                    return Err(FhirPathError::parse(
                        "expected variable name after '%'",
                        start,
                    ));
                }
                let lexeme = format!("%{name}");
                Ok(Token::new(TokenKind::Variable(name), lexeme, start))
            }
            c if c.is_ascii_digit() => Ok(self.read_number(start)),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let name = self.read_identifier();
                let kind = match name.as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "in" => TokenKind::In,
                    "true" => TokenKind::Boolean(true),
                    "false" => TokenKind::Boolean(false),
                    "null" => TokenKind::Null,
                    _ => TokenKind::Identifier(name.clone()),
                };
                Ok(Token::new(kind, name, start))
            }
            other => Err(FhirPathError::parse(
                format!("unexpected character '{other}'"),
                start,
            )),
        }
    }
}
