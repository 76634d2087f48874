//! FHIR structural schema document.
//!
//! The compiler consumes a pre-built schema document mapping resource and
//! complex-type names to element dictionaries:
//!
//! ```json
//! {
//!   "Patient": {
//!     "id":   { "type": ["id"], "max": "1" },
//!     "name": { "type": ["HumanName"], "max": "*" }
//!   },
//!   "Observation": {
//!     "value": { "type": ["Quantity", "string", "decimal"], "max": "1", "choice": "value" }
//!   }
//! }
//! ```
//!
//! Choice elements appear under their group name (e.g. `value`) with `type`
//! listing the alternatives; path access uses the expanded physical name
//! (`valueDecimal`).

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::{FhirPathError, Result};

/// Definition of a single element within a resource or complex type.
#[derive(Debug, Clone, Deserialize)]
pub struct ElementDefinition {
    /// The element's type name(s). More than one entry marks a choice
    /// element.
    #[serde(rename = "type")]
    pub types: Vec<String>,

    /// Cardinality upper bound: `"1"` for singletons, `"*"` for collections.
    pub max: String,

    /// Choice-group name for `value[x]`-style elements.
    #[serde(default)]
    pub choice: Option<String>,
}

impl ElementDefinition {
    /// Whether this element may repeat.
    pub fn is_collection(&self) -> bool {
        self.max == "*"
    }

    /// Whether this element is a `value[x]`-style choice.
    pub fn is_choice(&self) -> bool {
        self.choice.is_some() || self.types.len() > 1
    }
}

/// A resolved expansion of a choice element access.
#[derive(Debug, Clone)]
pub struct ChoiceExpansion {
    /// The choice group's base name (e.g. `value`).
    pub base: String,

    /// The concrete FHIR type selected by the access.
    pub fhir_type: String,

    /// The physical element name (e.g. `valueDecimal`).
    pub physical_name: String,

    /// Cardinality of the underlying choice element.
    pub collection: bool,
}

/// The FHIR structural schema the resolver works against.
///
/// Immutable once loaded; safe to share by reference across concurrent
/// compilations.
#[derive(Debug, Clone)]
pub struct FhirSchema {
    types: BTreeMap<String, BTreeMap<String, ElementDefinition>>,
}

impl FhirSchema {
    /// Load a schema from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON does not match the schema document shape.
    pub fn from_json(value: &Value) -> Result<Self> {
        let types: BTreeMap<String, BTreeMap<String, ElementDefinition>> =
            serde_json::from_value(value.clone()).map_err(|e| {
                FhirPathError::UnsupportedFeature {
                    message: format!("invalid schema document: {e}"),
                }
            })?;
        Ok(Self { types })
    }

    /// Load a schema from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid JSON or does not match
    /// the schema document shape.
    pub fn parse(s: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(s).map_err(|e| FhirPathError::UnsupportedFeature {
            message: format!("invalid schema document: {e}"),
        })?;
        Self::from_json(&value)
    }

    /// Whether the schema defines the given resource or complex type.
    pub fn has_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Look up an element by its literal name.
    pub fn element(&self, type_name: &str, element: &str) -> Option<&ElementDefinition> {
        self.types.get(type_name).and_then(|t| t.get(element))
    }

    /// All elements of a type, in name order.
    pub fn elements(
        &self,
        type_name: &str,
    ) -> Option<impl Iterator<Item = (&String, &ElementDefinition)>> {
        self.types.get(type_name).map(|t| t.iter())
    }

    /// List the physical expansions of a choice element.
    ///
    /// `resolve_choice("Observation", "value")` yields one entry per type
    /// alternative (`valueQuantity`, `valueString`, ...).
    pub fn resolve_choice(&self, type_name: &str, base: &str) -> Vec<ChoiceExpansion> {
        let Some(def) = self.element(type_name, base) else {
            return Vec::new();
        };
        if !def.is_choice() {
            return Vec::new();
        }
        def.types
            .iter()
            .map(|ty| ChoiceExpansion {
                base: base.to_string(),
                fhir_type: ty.clone(),
                physical_name: format!("{base}{}", capitalize(ty)),
                collection: def.is_collection(),
            })
            .collect()
    }

    /// Resolve an accessed name like `valueDecimal` against the choice
    /// elements of `type_name`. Returns `None` when no choice element
    /// matches the access.
    pub fn match_choice_access(&self, type_name: &str, accessed: &str) -> Option<ChoiceExpansion> {
        let elements = self.types.get(type_name)?;
        for (name, def) in elements {
            if !def.is_choice() || !accessed.starts_with(name.as_str()) {
                continue;
            }
            for expansion in self.resolve_choice(type_name, name) {
                if expansion.physical_name == accessed {
                    return Some(expansion);
                }
            }
        }
        None
    }

    /// Whether `accessed` looks like a choice access on some group of
    /// `type_name` whose type suffix matches no alternative. Used to
    /// distinguish `InvalidChoice` from `UnknownElement`.
    pub fn choice_base_of(&self, type_name: &str, accessed: &str) -> Option<String> {
        let elements = self.types.get(type_name)?;
        elements
            .iter()
            .filter(|(name, def)| {
                def.is_choice()
                    && accessed.len() > name.len()
                    && accessed.starts_with(name.as_str())
            })
            .map(|(name, _)| name.clone())
            .next()
    }
}

/// Uppercase the first character: `decimal` -> `Decimal`.
pub(crate) fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> FhirSchema {
        FhirSchema::from_json(&json!({
            "Patient": {
                "id": { "type": ["id"], "max": "1" },
                "name": { "type": ["HumanName"], "max": "*" }
            },
            "HumanName": {
                "use": { "type": ["code"], "max": "1" },
                "family": { "type": ["string"], "max": "1" },
                "given": { "type": ["string"], "max": "*" }
            },
            "Observation": {
                "value": {
                    "type": ["Quantity", "string", "decimal"],
                    "max": "1",
                    "choice": "value"
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_element_lookup() {
        let schema = schema();
        let def = schema.element("Patient", "name").unwrap();
        assert_eq!(def.types, vec!["HumanName"]);
        assert!(def.is_collection());
        assert!(schema.element("Patient", "nope").is_none());
    }

    #[test]
    fn test_resolve_choice() {
        let schema = schema();
        let expansions = schema.resolve_choice("Observation", "value");
        assert_eq!(expansions.len(), 3);
        assert_eq!(expansions[0].physical_name, "valueQuantity");
        assert_eq!(expansions[2].physical_name, "valueDecimal");
        assert_eq!(expansions[2].fhir_type, "decimal");
    }

    #[test]
    fn test_match_choice_access() {
        let schema = schema();
        let hit = schema
            .match_choice_access("Observation", "valueDecimal")
            .unwrap();
        assert_eq!(hit.base, "value");
        assert_eq!(hit.fhir_type, "decimal");
        assert!(schema
            .match_choice_access("Observation", "valueCodeableConcept")
            .is_none());
    }

    #[test]
    fn test_choice_base_of() {
        let schema = schema();
        assert_eq!(
            schema.choice_base_of("Observation", "valueCodeableConcept"),
            Some("value".to_string())
        );
        assert_eq!(schema.choice_base_of("Patient", "nameThing"), None);
    }

    #[test]
    fn test_non_choice_is_not_expanded() {
        let schema = schema();
        assert!(schema.resolve_choice("Patient", "name").is_empty());
    }
}
