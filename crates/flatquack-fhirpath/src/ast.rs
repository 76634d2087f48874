//! Abstract syntax tree for the FHIRPath subset.
//!
//! The tree is built by the parser and consumed by the schema resolver.
//! `Display` renders a canonical form that re-parses to a structurally
//! equal tree, which the tests use to check parser round-tripping.

use std::fmt;

/// Scalar literal values.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    String(String),
    /// Integer literal.
    Integer(i64),
    /// Decimal literal, kept as its raw lexeme so the exact textual form
    /// (e.g. `0.0006`) reaches the generated SQL without a float round-trip.
    Decimal(String),
    Boolean(bool),
    Null,
}

impl LiteralValue {
    /// Render the literal as a DuckDB SQL literal.
    pub fn to_sql(&self) -> String {
        match self {
            LiteralValue::String(s) => format!("'{}'", s.replace('\'', "''")),
            LiteralValue::Integer(i) => i.to_string(),
            LiteralValue::Decimal(lexeme) => lexeme.clone(),
            LiteralValue::Boolean(true) => "TRUE".to_string(),
            LiteralValue::Boolean(false) => "FALSE".to_string(),
            LiteralValue::Null => "NULL".to_string(),
        }
    }
}

/// Binary operators, in SQL-compatible semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    In,
}

impl BinaryOp {
    /// The operator's surface syntax.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::LtEq => "<=",
            BinaryOp::GtEq => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::In => "in",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Minus,
    Not,
}

/// An expression node. Every variant records the character offset of the
/// token that introduced it, for error reporting.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal {
        value: LiteralValue,
        offset: usize,
    },

    /// A bare leading element step (`name` in `name.family`).
    Identifier {
        name: String,
        offset: usize,
    },

    /// `$this`, the current focus.
    This {
        offset: usize,
    },

    /// `%name`, a user-supplied variable.
    Variable {
        name: String,
        offset: usize,
    },

    /// A member step `receiver.name` without an argument list.
    Path {
        receiver: Box<Expr>,
        name: String,
        offset: usize,
    },

    /// A function call, either `receiver.name(args)` or a top-level
    /// `name(args)` (receiver absent), as used by `_forEach`, `_unionAll`.
    Invocation {
        receiver: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
        offset: usize,
    },

    /// `receiver[index]`.
    Index {
        receiver: Box<Expr>,
        index: Box<Expr>,
        offset: usize,
    },

    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        offset: usize,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        offset: usize,
    },
}

impl Expr {
    /// The source offset of the token that introduced this node.
    pub fn offset(&self) -> usize {
        match self {
            Expr::Literal { offset, .. }
            | Expr::Identifier { offset, .. }
            | Expr::This { offset }
            | Expr::Variable { offset, .. }
            | Expr::Path { offset, .. }
            | Expr::Invocation { offset, .. }
            | Expr::Index { offset, .. }
            | Expr::Binary { offset, .. }
            | Expr::Unary { offset, .. } => *offset,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal { value, .. } => match value {
                LiteralValue::String(s) => {
                    write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
                }
                LiteralValue::Integer(i) => write!(f, "{i}"),
                LiteralValue::Decimal(lexeme) => write!(f, "{lexeme}"),
                LiteralValue::Boolean(b) => write!(f, "{b}"),
                LiteralValue::Null => write!(f, "null"),
            },
            Expr::Identifier { name, .. } => write!(f, "{name}"),
            Expr::This { .. } => write!(f, "$this"),
            Expr::Variable { name, .. } => write!(f, "%{name}"),
            Expr::Path { receiver, name, .. } => write!(f, "{receiver}.{name}"),
            Expr::Invocation {
                receiver,
                name,
                args,
                ..
            } => {
                if let Some(receiver) = receiver {
                    write!(f, "{receiver}.")?;
                }
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expr::Index {
                receiver, index, ..
            } => write!(f, "{receiver}[{index}]"),
            Expr::Binary { op, lhs, rhs, .. } => {
                write!(f, "({lhs} {} {rhs})", op.symbol())
            }
            Expr::Unary { op, operand, .. } => match op {
                UnaryOp::Minus => write!(f, "-({operand})"),
                UnaryOp::Not => write!(f, "not ({operand})"),
            },
        }
    }
}
