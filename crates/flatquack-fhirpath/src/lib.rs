//! FHIRPath-to-SQL compiler core for FlatQuack.
//!
//! This crate implements the expression side of the ViewDefinition
//! compiler: a restricted FHIRPath dialect (extended with the projection
//! primitives `_forEach`, `_col`, `_col_collection`, `_unionAll`,
//! `_splitPath`, `_invoke`) is parsed, resolved against a FHIR structural
//! schema, and lowered to DuckDB SQL expression fragments.
//!
//! # Pipeline
//!
//! - [`parser`] - tokenizes and parses an expression into an AST
//! - [`resolver`] - annotates every node with a FHIR type, cardinality,
//!   and concrete physical type, expanding `value[x]` choice access
//! - [`lower`] - produces a [`SqlFragment`]: expression text plus the
//!   lateral flattening tables it requires
//!
//! The compiler is purely functional: no I/O, no shared mutable state. A
//! [`FhirSchema`] may be shared by reference across concurrent
//! compilations.
//!
//! # Example
//!
//! ```ignore
//! use flatquack_fhirpath::{ExpressionCompiler, FhirSchema, LowerMode};
//!
//! let schema = FhirSchema::parse(schema_json)?;
//! let mut compiler = ExpressionCompiler::new(&schema, vars, "Patient", "base");
//! let focus = compiler.root_focus();
//! let compiled = compiler.compile("name.family", &focus, LowerMode::Rows)?;
//! println!("{}", compiled.fragment.expr);
//! ```

pub mod ast;
pub mod lexer;
pub mod lower;
pub mod parser;
pub mod resolver;
pub mod schema;
pub mod token;
pub mod types;

pub use ast::{BinaryOp, Expr, LiteralValue, UnaryOp};
pub use lower::{
    singleton_guard, AliasGen, CompiledExpression, ExpressionCompiler, Focus, LateralTable,
    LowerMode, SqlFragment,
};
pub use parser::parse;
pub use resolver::{PathNode, PathStep, ResolveFocus, Resolver, TouchedPaths, TypedExpr};
pub use schema::{ChoiceExpansion, ElementDefinition, FhirSchema};
pub use types::{quote_ident, Cardinality, DuckType, ResolvedType};

use thiserror::Error;

/// Errors raised by the FHIRPath compiler stages.
#[derive(Debug, Error)]
pub enum FhirPathError {
    /// Lexical or syntactic error in the expression.
    #[error("parse error at offset {offset}: {message}")]
    Parse { message: String, offset: usize },

    /// An identifier step names no element of the focus type.
    #[error("unknown element '{element}' on {parent} (offset {offset})")]
    UnknownElement {
        element: String,
        parent: String,
        offset: usize,
    },

    /// A choice element was accessed without a usable type selection.
    #[error("invalid choice access at offset {offset}: {message}")]
    InvalidChoice { message: String, offset: usize },

    /// An expression's cardinality or value type does not fit where it is
    /// used.
    #[error("cardinality mismatch at offset {offset}: {message}")]
    CardinalityMismatch { message: String, offset: usize },

    /// `_invoke` received a path or identifier where a scalar literal is
    /// required.
    #[error("_invoke() arguments must be scalar literals (offset {offset})")]
    InvokeParamNotLiteral { offset: usize },

    /// The construct is valid FHIRPath but outside the supported subset.
    #[error("unsupported: {message}")]
    UnsupportedFeature { message: String },

    /// Expression nesting exceeded the recursion cap.
    #[error("expression nesting exceeds the depth limit of {limit}")]
    ExpressionTooDeep { limit: usize },
}

impl FhirPathError {
    /// Create a new parse error.
    pub fn parse(message: impl Into<String>, offset: usize) -> Self {
        Self::Parse {
            message: message.into(),
            offset,
        }
    }

    /// The source offset the error points at, when it has one.
    pub fn offset(&self) -> Option<usize> {
        match self {
            Self::Parse { offset, .. }
            | Self::UnknownElement { offset, .. }
            | Self::InvalidChoice { offset, .. }
            | Self::CardinalityMismatch { offset, .. }
            | Self::InvokeParamNotLiteral { offset } => Some(*offset),
            Self::UnsupportedFeature { .. } | Self::ExpressionTooDeep { .. } => None,
        }
    }
}

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, FhirPathError>;
