//! Precedence-climbing parser for the FHIRPath subset.
//!
//! Grammar (highest binding last):
//!
//! ```text
//! expr        := or_expr
//! or_expr     := and_expr ('or' and_expr)*
//! and_expr    := cmp_expr ('and' cmp_expr)*
//! cmp_expr    := add_expr (('='|'!='|'<'|'>'|'<='|'>='|'in') add_expr)?
//! add_expr    := mul_expr (('+'|'-') mul_expr)*
//! mul_expr    := unary (('*'|'/') unary)*
//! unary       := ('-'|'not')? postfix
//! postfix     := primary ('.' invocation | '[' expr ']')*
//! invocation  := IDENT ('(' arglist? ')')?
//! primary     := literal | '$this' | '%' IDENT | IDENT | '(' expr ')'
//!               | IDENT '(' arglist? ')'
//! ```
//!
//! The parser fails on the first error and caps nesting depth so that
//! pathological inputs cannot blow the stack.

use crate::ast::{BinaryOp, Expr, LiteralValue, UnaryOp};
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};
use crate::{FhirPathError, Result};

/// Maximum expression nesting depth before parsing fails.
pub const MAX_DEPTH: usize = 256;

/// Parse a FHIRPath expression string into an AST.
///
/// # Errors
///
/// Returns [`FhirPathError::Parse`] on lexical or syntactic errors, and
/// [`FhirPathError::ExpressionTooDeep`] when nesting exceeds [`MAX_DEPTH`].
pub fn parse(source: &str) -> Result<Expr> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_expr()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn current(&self) -> &Token {
        // The token vector always ends with Eof, so pos stays in bounds.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current().kind) == std::mem::discriminant(kind)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            let current = self.current();
            Err(FhirPathError::parse(
                format!(
                    "expected {}, found {}",
                    kind.describe(),
                    current.kind.describe()
                ),
                current.offset,
            ))
        }
    }

    fn expect_eof(&self) -> Result<()> {
        let current = self.current();
        if current.kind == TokenKind::Eof {
            Ok(())
        } else {
            Err(FhirPathError::parse(
                format!("unexpected trailing {}", current.kind.describe()),
                current.offset,
            ))
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(FhirPathError::ExpressionTooDeep { limit: MAX_DEPTH });
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.enter()?;
        let result = self.parse_or();
        self.leave();
        result
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.check(&TokenKind::Or) {
            let offset = self.advance().offset;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                offset,
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_cmp()?;
        while self.check(&TokenKind::And) {
            let offset = self.advance().offset;
            let rhs = self.parse_cmp()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                offset,
            };
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_add()?;
        let op = match self.current().kind {
            TokenKind::Eq => BinaryOp::Eq,
            TokenKind::NotEq => BinaryOp::NotEq,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::LtEq => BinaryOp::LtEq,
            TokenKind::GtEq => BinaryOp::GtEq,
            TokenKind::In => BinaryOp::In,
            _ => return Ok(lhs),
        };
        let offset = self.advance().offset;
        let rhs = self.parse_add()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            offset,
        })
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            let offset = self.advance().offset;
            let rhs = self.parse_mul()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                offset,
            };
        }
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            let offset = self.advance().offset;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                offset,
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.current().kind {
            TokenKind::Minus => Some(UnaryOp::Minus),
            TokenKind::Not => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let offset = self.advance().offset;
            self.enter()?;
            let operand = self.parse_unary()?;
            self.leave();
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
                offset,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.check(&TokenKind::Dot) {
                self.advance();
                let token = self.current().clone();
                let TokenKind::Identifier(name) = token.kind else {
                    return Err(FhirPathError::parse(
                        format!("expected member name, found {}", token.kind.describe()),
                        token.offset,
                    ));
                };
                self.advance();
                if self.eat(&TokenKind::LParen) {
                    let args = self.parse_args()?;
                    expr = Expr::Invocation {
                        receiver: Some(Box::new(expr)),
                        name,
                        args,
                        offset: token.offset,
                    };
                } else {
                    expr = Expr::Path {
                        receiver: Box::new(expr),
                        name,
                        offset: token.offset,
                    };
                }
            } else if self.check(&TokenKind::LBracket) {
                let offset = self.advance().offset;
                let index = self.parse_expr()?;
                self.expect(&TokenKind::RBracket)?;
                expr = Expr::Index {
                    receiver: Box::new(expr),
                    index: Box::new(index),
                    offset,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(&TokenKind::Comma) {
                continue;
            }
            self.expect(&TokenKind::RParen)?;
            return Ok(args);
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::String(value) => {
                self.advance();
                Ok(Expr::Literal {
                    value: LiteralValue::String(value),
                    offset: token.offset,
                })
            }
            TokenKind::Number { lexeme, decimal } => {
                self.advance();
                let value = if decimal {
                    LiteralValue::Decimal(lexeme)
                } else {
                    let parsed = lexeme.parse::<i64>().map_err(|_| {
                        FhirPathError::parse(
                            format!("integer literal '{lexeme}' out of range"),
                            token.offset,
                        )
                    })?;
                    LiteralValue::Integer(parsed)
                };
                Ok(Expr::Literal {
                    value,
                    offset: token.offset,
                })
            }
            TokenKind::Boolean(value) => {
                self.advance();
                Ok(Expr::Literal {
                    value: LiteralValue::Boolean(value),
                    offset: token.offset,
                })
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Literal {
                    value: LiteralValue::Null,
                    offset: token.offset,
                })
            }
            TokenKind::This => {
                self.advance();
                Ok(Expr::This {
                    offset: token.offset,
                })
            }
            TokenKind::Variable(name) => {
                self.advance();
                Ok(Expr::Variable {
                    name,
                    offset: token.offset,
                })
            }
            TokenKind::Identifier(name) => {
                self.advance();
                if self.eat(&TokenKind::LParen) {
                    let args = self.parse_args()?;
                    Ok(Expr::Invocation {
                        receiver: None,
                        name,
                        args,
                        offset: token.offset,
                    })
                } else {
                    Ok(Expr::Identifier {
                        name,
                        offset: token.offset,
                    })
                }
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            other => Err(FhirPathError::parse(
                format!("unexpected {}", other.describe()),
                token.offset,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_member_chain() {
        let expr = parse("name.family").unwrap();
        assert!(matches!(
            expr,
            Expr::Path { ref name, .. } if name == "family"
        ));
    }

    #[test]
    fn test_parse_invocation_with_receiver() {
        let expr = parse("name.where(use = 'official')").unwrap();
        let Expr::Invocation {
            receiver,
            name,
            args,
            ..
        } = expr
        else {
            panic!("expected invocation");
        };
        assert_eq!(name, "where");
        assert!(receiver.is_some());
        assert_eq!(args.len(), 1);
        assert!(matches!(args[0], Expr::Binary { op: BinaryOp::Eq, .. }));
    }

    #[test]
    fn test_parse_top_level_invocation() {
        let expr = parse("_unionAll(address.postalCode, contact.address.postalCode)").unwrap();
        let Expr::Invocation {
            receiver,
            name,
            args,
            ..
        } = expr
        else {
            panic!("expected invocation");
        };
        assert_eq!(name, "_unionAll");
        assert!(receiver.is_none());
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_parse_indexer() {
        let expr = parse("name[0].family").unwrap();
        let Expr::Path { receiver, name, .. } = expr else {
            panic!("expected path");
        };
        assert_eq!(name, "family");
        assert!(matches!(*receiver, Expr::Index { .. }));
    }

    #[test]
    fn test_parse_negative_argument() {
        let expr = parse("reference._splitPath(-1)").unwrap();
        let Expr::Invocation { args, .. } = expr else {
            panic!("expected invocation");
        };
        assert!(matches!(
            args[0],
            Expr::Unary {
                op: UnaryOp::Minus,
                ..
            }
        ));
    }

    #[test]
    fn test_precedence_and_over_or() {
        // a or b and c => (a or (b and c))
        let expr = parse("a or b and c").unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Or, .. }));
        let Expr::Binary { rhs, .. } = expr else {
            unreachable!();
        };
        assert!(matches!(*rhs, Expr::Binary { op: BinaryOp::And, .. }));
    }

    #[test]
    fn test_precedence_arithmetic_over_comparison() {
        let expr = parse("a + 1 > 2 * b").unwrap();
        let Expr::Binary { op, lhs, rhs, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Gt);
        assert!(matches!(*lhs, Expr::Binary { op: BinaryOp::Add, .. }));
        assert!(matches!(*rhs, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_parse_error_has_offset() {
        let err = parse("name..family").unwrap_err();
        let FhirPathError::Parse { offset, .. } = err else {
            panic!("expected parse error, got {err:?}");
        };
        assert_eq!(offset, 5);
    }

    #[test]
    fn test_trailing_tokens_rejected() {
        assert!(parse("name family").is_err());
    }

    #[test]
    fn test_depth_cap() {
        let mut source = String::new();
        for _ in 0..300 {
            source.push('(');
        }
        source.push('x');
        for _ in 0..300 {
            source.push(')');
        }
        let err = parse(&source).unwrap_err();
        assert!(matches!(err, FhirPathError::ExpressionTooDeep { .. }));
    }

    #[test]
    fn test_round_trip_canonical_print() {
        // Printing the AST and re-parsing the printed form must converge.
        let sources = [
            "name.family",
            "name.where(use = 'official').first().family",
            "_unionAll(address.postalCode, contact.address.postalCode)",
            "name._forEach(_col('use', use), _col('last', family))",
            "link.other.reference._splitPath(-1)",
            "item.where(linkId = 'crpValue').answer.valueDecimal",
            "a + 1 > 2 * b and not (c.exists())",
            "telecom[0].value",
            "$this = %threshold",
            "value.ofType(decimal)",
        ];
        for source in sources {
            let first = parse(source).unwrap();
            let printed = first.to_string();
            let second = parse(&printed).unwrap();
            assert_eq!(
                printed,
                second.to_string(),
                "round-trip diverged for {source}"
            );
        }
    }
}
