//! ViewDefinition parsing and types.
//!
//! Defines the data structures for the subset of the SQL on FHIR
//! ViewDefinition resource honored by the compiler. Unknown fields are
//! ignored with a warning rather than rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// A ViewDefinition resource describing a flat projection over FHIR data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDefinition {
    /// The FHIR resource type, "ViewDefinition" when present.
    pub resource_type: Option<String>,

    /// Canonical URL identifying this ViewDefinition.
    pub url: Option<String>,

    /// Human-readable name for the view.
    pub name: Option<String>,

    /// Publication status: draft | active | retired | unknown.
    pub status: Option<String>,

    /// The FHIR resource type this view projects (e.g. "Patient").
    pub resource: String,

    /// Description of the view's purpose.
    pub description: Option<String>,

    /// The columns and nested selects to include in the view.
    #[serde(default)]
    pub select: Vec<SelectNode>,

    /// Filter conditions applied to the view.
    /// Named `where_` because `where` is a Rust reserved keyword.
    #[serde(default, rename = "where")]
    pub where_: Vec<WhereClause>,

    /// Constants referenced as `%name` in FHIRPath expressions.
    #[serde(default)]
    pub constant: Vec<Constant>,

    /// Warnings gathered while parsing (unknown fields etc.).
    #[serde(skip)]
    pub warnings: Vec<String>,
}

/// A select clause contributing columns, row expansion, or nested selects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectNode {
    /// Column definitions at this level.
    pub column: Option<Vec<Column>>,

    /// FHIRPath expression expanded to one row per element.
    pub for_each: Option<String>,

    /// Like forEach, but yields one all-null row for an empty collection.
    pub for_each_or_null: Option<String>,

    /// Union of multiple select clauses. Parsed but rejected at compile
    /// time.
    pub union_all: Option<Vec<SelectNode>>,

    /// Nested select clauses, composed conjunctively.
    #[serde(default)]
    pub select: Vec<SelectNode>,
}

/// A single output column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    /// The column name in the output.
    pub name: String,

    /// FHIRPath expression extracting the column value.
    pub path: String,

    /// Declared FHIR type of the column value.
    #[serde(rename = "type")]
    pub col_type: Option<String>,

    /// Whether this column carries the whole collection as a list value.
    pub collection: Option<bool>,

    /// Human-readable description of the column.
    pub description: Option<String>,
}

/// A row filter; the path must evaluate to a singleton boolean.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhereClause {
    pub path: String,
}

/// A constant usable as `%name` in FHIRPath expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constant {
    pub name: String,

    pub value_string: Option<String>,
    pub value_integer: Option<i64>,
    pub value_boolean: Option<bool>,
    pub value_decimal: Option<f64>,
}

impl ViewDefinition {
    /// Parse a ViewDefinition from a JSON value, collecting warnings for
    /// unknown fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is not a valid ViewDefinition.
    pub fn from_json(value: &Value) -> Result<Self, Error> {
        let mut view: ViewDefinition = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidViewDefinition(e.to_string()))?;
        if let Some(resource_type) = &view.resource_type {
            if resource_type != "ViewDefinition" {
                return Err(Error::InvalidViewDefinition(format!(
                    "expected resourceType 'ViewDefinition', found '{resource_type}'"
                )));
            }
        }
        view.warnings = unknown_field_warnings(value);
        Ok(view)
    }

    /// Parse a ViewDefinition from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid JSON or not a valid
    /// ViewDefinition.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(s)?;
        Self::from_json(&value)
    }

    /// All column names defined in this view, in traversal order.
    pub fn column_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_column_names(&self.select, &mut names);
        names
    }
}

fn collect_column_names(selects: &[SelectNode], names: &mut Vec<String>) {
    for select in selects {
        if let Some(columns) = &select.column {
            for col in columns {
                names.push(col.name.clone());
            }
        }
        collect_column_names(&select.select, names);
        if let Some(union_selects) = &select.union_all {
            collect_column_names(union_selects, names);
        }
    }
}

impl Constant {
    /// The constant's value as a JSON scalar.
    pub fn value(&self) -> Value {
        if let Some(s) = &self.value_string {
            Value::String(s.clone())
        } else if let Some(i) = self.value_integer {
            Value::Number(i.into())
        } else if let Some(b) = self.value_boolean {
            Value::Bool(b)
        } else if let Some(d) = self.value_decimal {
            serde_json::Number::from_f64(d)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        } else {
            Value::Null
        }
    }
}

const VIEW_FIELDS: &[&str] = &[
    "resourceType",
    "url",
    "name",
    "status",
    "resource",
    "description",
    "select",
    "where",
    "constant",
];

const SELECT_FIELDS: &[&str] = &["column", "forEach", "forEachOrNull", "unionAll", "select"];

const COLUMN_FIELDS: &[&str] = &["name", "path", "type", "collection", "description"];

/// Walk the raw document and list fields the compiler does not recognize.
fn unknown_field_warnings(value: &Value) -> Vec<String> {
    let mut warnings = Vec::new();
    if let Value::Object(map) = value {
        for key in map.keys() {
            if !VIEW_FIELDS.contains(&key.as_str()) {
                warnings.push(format!("ignoring unknown field '{key}'"));
            }
        }
        if let Some(Value::Array(selects)) = map.get("select") {
            for (i, select) in selects.iter().enumerate() {
                scan_select(select, &format!("select[{i}]"), &mut warnings);
            }
        }
    }
    warnings
}

fn scan_select(value: &Value, at: &str, warnings: &mut Vec<String>) {
    let Value::Object(map) = value else {
        return;
    };
    for key in map.keys() {
        if !SELECT_FIELDS.contains(&key.as_str()) {
            warnings.push(format!("ignoring unknown field '{key}' at {at}"));
        }
    }
    if let Some(Value::Array(columns)) = map.get("column") {
        for (i, column) in columns.iter().enumerate() {
            if let Value::Object(col_map) = column {
                for key in col_map.keys() {
                    if !COLUMN_FIELDS.contains(&key.as_str()) {
                        warnings.push(format!(
                            "ignoring unknown field '{key}' at {at}.column[{i}]"
                        ));
                    }
                }
            }
        }
    }
    for (field, nested) in [("select", map.get("select")), ("unionAll", map.get("unionAll"))] {
        if let Some(Value::Array(selects)) = nested {
            for (i, select) in selects.iter().enumerate() {
                scan_select(select, &format!("{at}.{field}[{i}]"), warnings);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_simple_view_definition() {
        let json = json!({
            "resourceType": "ViewDefinition",
            "name": "patient_demographics",
            "status": "active",
            "resource": "Patient",
            "select": [{
                "column": [{
                    "name": "id",
                    "path": "id"
                }, {
                    "name": "gender",
                    "path": "gender"
                }]
            }]
        });

        let view = ViewDefinition::from_json(&json).unwrap();
        assert_eq!(view.name.as_deref(), Some("patient_demographics"));
        assert_eq!(view.resource, "Patient");
        assert_eq!(view.select.len(), 1);
        assert!(view.warnings.is_empty());

        let columns = view.select[0].column.as_ref().unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "id");
        assert_eq!(columns[1].name, "gender");
    }

    #[test]
    fn test_minimal_view_definition() {
        let view = ViewDefinition::from_json(&json!({
            "resource": "Patient",
            "select": [{"column": [{"name": "id", "path": "id"}]}]
        }))
        .unwrap();
        assert_eq!(view.resource, "Patient");
        assert!(view.status.is_none());
    }

    #[test]
    fn test_missing_resource_is_rejected() {
        let err = ViewDefinition::from_json(&json!({
            "select": [{"column": [{"name": "id", "path": "id"}]}]
        }))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidViewDefinition(_)));
    }

    #[test]
    fn test_wrong_resource_type_is_rejected() {
        let err = ViewDefinition::from_json(&json!({
            "resourceType": "Patient",
            "resource": "Patient"
        }))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidViewDefinition(_)));
    }

    #[test]
    fn test_parse_view_with_foreach() {
        let view = ViewDefinition::from_json(&json!({
            "resource": "Patient",
            "select": [{
                "forEach": "name",
                "column": [{
                    "name": "family",
                    "path": "family"
                }]
            }]
        }))
        .unwrap();
        assert_eq!(view.select[0].for_each.as_deref(), Some("name"));
    }

    #[test]
    fn test_unknown_fields_warn() {
        let view = ViewDefinition::from_json(&json!({
            "resource": "Patient",
            "frobnicate": true,
            "select": [{
                "column": [{"name": "id", "path": "id", "width": 3}],
                "sparkle": 1
            }]
        }))
        .unwrap();
        assert_eq!(view.warnings.len(), 3);
        assert!(view.warnings[0].contains("frobnicate"));
        assert!(view.warnings.iter().any(|w| w.contains("sparkle")));
        assert!(view.warnings.iter().any(|w| w.contains("width")));
    }

    #[test]
    fn test_parse_view_with_constants() {
        let view = ViewDefinition::from_json(&json!({
            "resource": "Patient",
            "constant": [{
                "name": "statusFilter",
                "valueString": "active"
            }, {
                "name": "maxAge",
                "valueInteger": 65
            }],
            "select": [{
                "column": [{"name": "id", "path": "id"}]
            }]
        }))
        .unwrap();
        assert_eq!(view.constant.len(), 2);
        assert_eq!(view.constant[0].value(), json!("active"));
        assert_eq!(view.constant[1].value(), json!(65));
    }

    #[test]
    fn test_column_names() {
        let view = ViewDefinition::from_json(&json!({
            "resource": "Patient",
            "select": [{
                "column": [
                    {"name": "id", "path": "id"},
                    {"name": "gender", "path": "gender"}
                ]
            }, {
                "forEach": "name",
                "column": [{"name": "family", "path": "family"}]
            }]
        }))
        .unwrap();
        assert_eq!(view.column_names(), vec!["id", "gender", "family"]);
    }
}
