//! Physical types, cardinalities, and resolved type annotations.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether an expression yields at most one value or a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    Singleton,
    Collection,
}

impl Cardinality {
    /// Stepping from a focus into an element: once a collection, always a
    /// collection until a reducing function is applied.
    pub fn step(self, element_is_collection: bool) -> Self {
        if element_is_collection {
            Cardinality::Collection
        } else {
            self
        }
    }

    pub fn is_collection(self) -> bool {
        matches!(self, Cardinality::Collection)
    }
}

/// Concrete DuckDB physical types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuckType {
    Varchar,
    Integer,
    BigInt,
    Decimal,
    Boolean,
    Date,
    Timestamp,
    Struct(BTreeMap<String, DuckType>),
    List(Box<DuckType>),
    Unknown,
}

impl DuckType {
    /// Map a FHIR primitive type name to its DuckDB physical type.
    /// Returns `None` for complex types.
    pub fn from_fhir_primitive(fhir_type: &str) -> Option<Self> {
        match fhir_type {
            "string" | "code" | "uri" | "url" | "canonical" | "id" | "oid" | "uuid"
            | "markdown" | "base64Binary" | "xhtml" | "time" => Some(DuckType::Varchar),
            "integer" | "positiveInt" | "unsignedInt" => Some(DuckType::Integer),
            "integer64" => Some(DuckType::BigInt),
            "decimal" => Some(DuckType::Decimal),
            "boolean" => Some(DuckType::Boolean),
            "date" => Some(DuckType::Date),
            "dateTime" | "instant" => Some(DuckType::Timestamp),
            _ => None,
        }
    }

    /// The DuckDB physical type for a FHIR type, opaque for complex types.
    pub fn from_fhir_type(fhir_type: &str) -> Self {
        Self::from_fhir_primitive(fhir_type).unwrap_or(DuckType::Unknown)
    }

    /// Render as DuckDB type syntax, suitable for `read_json(columns=...)`.
    pub fn render(&self) -> String {
        match self {
            DuckType::Varchar => "VARCHAR".to_string(),
            DuckType::Integer => "INTEGER".to_string(),
            DuckType::BigInt => "BIGINT".to_string(),
            // Wide scale so small decimals like 0.0006 keep their exact value.
            DuckType::Decimal => "DECIMAL(18,8)".to_string(),
            DuckType::Boolean => "BOOLEAN".to_string(),
            DuckType::Date => "DATE".to_string(),
            DuckType::Timestamp => "TIMESTAMP".to_string(),
            DuckType::Struct(fields) => {
                let rendered: Vec<String> = fields
                    .iter()
                    .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.render()))
                    .collect();
                format!("STRUCT({})", rendered.join(", "))
            }
            DuckType::List(inner) => format!("{}[]", inner.render()),
            DuckType::Unknown => "JSON".to_string(),
        }
    }
}

impl fmt::Display for DuckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// The annotation attached to every AST node by the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedType {
    /// FHIR type name of the expression's value.
    pub fhir_type: String,

    /// Whether the expression yields a collection.
    pub cardinality: Cardinality,

    /// Concrete DuckDB physical type of a single value.
    pub physical: DuckType,

    /// Whether the value may be NULL at runtime. FHIR elements are all
    /// optional; only literals are non-nullable.
    pub nullable: bool,
}

impl ResolvedType {
    pub fn singleton(fhir_type: impl Into<String>, physical: DuckType) -> Self {
        Self {
            fhir_type: fhir_type.into(),
            cardinality: Cardinality::Singleton,
            physical,
            nullable: true,
        }
    }

    pub fn collection(fhir_type: impl Into<String>, physical: DuckType) -> Self {
        Self {
            fhir_type: fhir_type.into(),
            cardinality: Cardinality::Collection,
            physical,
            nullable: true,
        }
    }

    pub fn is_collection(&self) -> bool {
        self.cardinality.is_collection()
    }
}

/// SQL keywords that force quoting when used as identifiers. Struct field
/// names in FHIR are camelCase or plain words; the common collisions are
/// listed here rather than a full keyword table.
const RESERVED: &[&str] = &[
    "all", "and", "as", "asc", "between", "case", "cast", "desc", "distinct", "else", "end",
    "exists", "filter", "from", "group", "having", "in", "join", "lateral", "left", "like",
    "limit", "not", "null", "on", "or", "order", "right", "select", "table", "then", "union",
    "use", "using", "when", "where",
];

/// Quote an identifier for splicing into DuckDB SQL. Lower-case
/// alphanumeric names pass through; anything else (camelCase FHIR names,
/// reserved words) gets double quotes.
pub fn quote_ident(name: &str) -> String {
    let plain = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && !RESERVED.contains(&name);
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_mapping() {
        assert_eq!(DuckType::from_fhir_type("string"), DuckType::Varchar);
        assert_eq!(DuckType::from_fhir_type("code"), DuckType::Varchar);
        assert_eq!(DuckType::from_fhir_type("integer"), DuckType::Integer);
        assert_eq!(DuckType::from_fhir_type("decimal"), DuckType::Decimal);
        assert_eq!(DuckType::from_fhir_type("boolean"), DuckType::Boolean);
        assert_eq!(DuckType::from_fhir_type("date"), DuckType::Date);
        assert_eq!(DuckType::from_fhir_type("dateTime"), DuckType::Timestamp);
        assert_eq!(DuckType::from_fhir_type("HumanName"), DuckType::Unknown);
    }

    #[test]
    fn test_decimal_render_keeps_scale() {
        assert_eq!(DuckType::Decimal.render(), "DECIMAL(18,8)");
    }

    #[test]
    fn test_struct_render() {
        let mut fields = BTreeMap::new();
        fields.insert("family".to_string(), DuckType::Varchar);
        fields.insert("use".to_string(), DuckType::Varchar);
        let ty = DuckType::List(Box::new(DuckType::Struct(fields)));
        assert_eq!(ty.render(), "STRUCT(family VARCHAR, \"use\" VARCHAR)[]");
    }

    #[test]
    fn test_cardinality_step() {
        assert_eq!(
            Cardinality::Singleton.step(true),
            Cardinality::Collection
        );
        assert_eq!(
            Cardinality::Collection.step(false),
            Cardinality::Collection
        );
        assert_eq!(
            Cardinality::Singleton.step(false),
            Cardinality::Singleton
        );
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("family"), "family");
        assert_eq!(quote_ident("birthDate"), "\"birthDate\"");
        assert_eq!(quote_ident("use"), "\"use\"");
        assert_eq!(quote_ident("linkId"), "\"linkId\"");
    }
}
