//! Token types produced by the FHIRPath lexer.

/// A single token with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// What kind of token this is.
    pub kind: TokenKind,

    /// The raw text of the token as it appeared in the source.
    pub lexeme: String,

    /// Character offset of the token's first character in the expression.
    pub offset: usize,
}

impl Token {
    pub(crate) fn new(kind: TokenKind, lexeme: impl Into<String>, offset: usize) -> Self {
        Self {
            kind,
            lexeme: lexeme.into(),
            offset,
        }
    }
}

/// Token kinds of the FHIRPath subset.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Element or function name.
    Identifier(String),

    /// Numeric literal. The raw lexeme is kept so decimal literals keep
    /// their exact textual form all the way into the generated SQL.
    Number { lexeme: String, decimal: bool },

    /// Single-quoted string literal (unescaped value).
    String(String),

    /// `true` or `false`.
    Boolean(bool),

    /// `null`.
    Null,

    /// `$this`.
    This,

    /// `%name` user variable reference.
    Variable(String),

    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,

    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,

    And,
    Or,
    Not,
    In,

    Eof,
}

impl TokenKind {
    /// Short human-readable description used in parse error messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Identifier(name) => format!("identifier '{name}'"),
            TokenKind::Number { lexeme, .. } => format!("number '{lexeme}'"),
            TokenKind::String(_) => "string literal".to_string(),
            TokenKind::Boolean(b) => format!("'{b}'"),
            TokenKind::Null => "'null'".to_string(),
            TokenKind::This => "'$this'".to_string(),
            TokenKind::Variable(name) => format!("'%{name}'"),
            TokenKind::Dot => "'.'".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::LBracket => "'['".to_string(),
            TokenKind::RBracket => "']'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Eq => "'='".to_string(),
            TokenKind::NotEq => "'!='".to_string(),
            TokenKind::Lt => "'<'".to_string(),
            TokenKind::Gt => "'>'".to_string(),
            TokenKind::LtEq => "'<='".to_string(),
            TokenKind::GtEq => "'>='".to_string(),
            TokenKind::Plus => "'+'".to_string(),
            TokenKind::Minus => "'-'".to_string(),
            TokenKind::Star => "'*'".to_string(),
            TokenKind::Slash => "'/'".to_string(),
            TokenKind::And => "'and'".to_string(),
            TokenKind::Or => "'or'".to_string(),
            TokenKind::Not => "'not'".to_string(),
            TokenKind::In => "'in'".to_string(),
            TokenKind::Eof => "end of expression".to_string(),
        }
    }
}
