//! SQL on FHIR ViewDefinition compiler for FlatQuack.
//!
//! This crate compiles a FHIR ViewDefinition (a declarative projection of
//! deeply nested FHIR resources into a flat relational shape) into a
//! single self-contained DuckDB query.
//!
//! # Components
//!
//! - [`ViewDefinition`] - parsed representation of the ViewDefinition
//!   subset honored by the compiler
//! - [`compile`] - the compiler entry point, producing a [`CompileResult`]
//! - [`ColumnInfo`] - output column metadata
//!
//! # Example
//!
//! ```ignore
//! use flatquack_sof::{compile, ViewDefinition, UserVariables};
//! use flatquack_fhirpath::FhirSchema;
//!
//! let view = ViewDefinition::parse(view_json)?;
//! let schema = FhirSchema::parse(schema_json)?;
//! let result = compile(&view, &schema, &UserVariables::new())?;
//! println!("{}", result.sql);
//! ```
//!
//! The generated SQL contains a `{{source}}` placeholder for the base
//! relation; binding it (e.g. to `read_json(...)`) and executing the query
//! are left to the caller.
//!
//! # SQL on FHIR Specification
//!
//! See: <https://build.fhir.org/ig/FHIR/sql-on-fhir-v2/>

mod assembler;
mod column;
mod input_schema;
mod view_definition;

pub use assembler::CompileResult;
pub use column::ColumnInfo;
pub use view_definition::{Column, Constant, SelectNode, ViewDefinition, WhereClause};

use std::collections::BTreeMap;

use flatquack_fhirpath::{FhirPathError, FhirSchema};
use thiserror::Error;

/// User-supplied variables, referenced as `%name` in FHIRPath
/// expressions. Values must be JSON scalars.
pub type UserVariables = BTreeMap<String, serde_json::Value>;

/// Errors raised while compiling a ViewDefinition.
#[derive(Debug, Error)]
pub enum Error {
    /// The ViewDefinition JSON is invalid or missing required fields.
    #[error("invalid ViewDefinition: {0}")]
    InvalidViewDefinition(String),

    /// The view's root resource type is absent from the schema.
    #[error("unknown resource type '{0}'")]
    UnknownResource(String),

    /// A FHIRPath expression failed to compile.
    #[error("{view_path}: error in '{expression}': {source}")]
    Expression {
        view_path: String,
        expression: String,
        #[source]
        source: FhirPathError,
    },

    /// The ViewDefinition uses a construct outside the supported subset.
    #[error("{view_path}: {message}")]
    Unsupported { view_path: String, message: String },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Compile a ViewDefinition into a single DuckDB query.
///
/// The compilation is a pure function of its inputs (up to stable alias
/// naming); the schema may be shared by reference across concurrent
/// compilations.
///
/// # Errors
///
/// Fails on the first error; no partial SQL is returned.
pub fn compile(
    view: &ViewDefinition,
    schema: &FhirSchema,
    vars: &UserVariables,
) -> Result<CompileResult> {
    assembler::compile_view(view, schema, vars)
}
