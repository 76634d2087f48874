//! Reduced input schema rendering.
//!
//! The compiler tracks every element path a view reads. This module
//! renders that path tree as the `columns = {...}` argument of DuckDB's
//! `read_json`, restricted to the touched paths so the engine never parses
//! fields the view does not use.

use flatquack_fhirpath::{quote_ident, DuckType, PathNode, TouchedPaths};

/// Render the touched-path tree as a `read_json` columns struct literal.
///
/// Keys are deterministically ordered; list-typed elements get a `[]`
/// suffix. A complex element with no deeper access renders as `JSON`.
pub fn render(touched: &TouchedPaths) -> String {
    let entries: Vec<String> = touched
        .roots()
        .iter()
        .map(|(name, node)| format!("'{}': '{}'", name, node_type(node)))
        .collect();
    format!("{{{}}}", entries.join(", "))
}

fn node_type(node: &PathNode) -> String {
    let base = if node.children.is_empty() {
        DuckType::from_fhir_type(&node.fhir_type).render()
    } else {
        let fields: Vec<String> = node
            .children
            .iter()
            .map(|(name, child)| format!("{} {}", quote_ident(name), node_type(child)))
            .collect();
        format!("STRUCT({})", fields.join(", "))
    };
    if node.collection {
        format!("{base}[]")
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flatquack_fhirpath::PathStep;

    fn step(name: &str, fhir_type: &str, collection: bool) -> PathStep {
        PathStep {
            name: name.to_string(),
            fhir_type: fhir_type.to_string(),
            collection,
        }
    }

    #[test]
    fn test_render_scalar_and_nested() {
        let mut touched = TouchedPaths::default();
        touched.record(&[step("id", "id", false)]);
        touched.record(&[
            step("name", "HumanName", true),
            step("family", "string", false),
        ]);
        touched.record(&[
            step("name", "HumanName", true),
            step("use", "code", false),
        ]);

        assert_eq!(
            render(&touched),
            "{'id': 'VARCHAR', 'name': 'STRUCT(family VARCHAR, \"use\" VARCHAR)[]'}"
        );
    }

    #[test]
    fn test_complex_leaf_renders_as_json() {
        let mut touched = TouchedPaths::default();
        touched.record(&[step("name", "HumanName", true)]);
        assert_eq!(render(&touched), "{'name': 'JSON[]'}");
    }

    #[test]
    fn test_decimal_leaf_keeps_precision_type() {
        let mut touched = TouchedPaths::default();
        touched.record(&[
            step("item", "QuestionnaireResponseItem", true),
            step("answer", "QuestionnaireResponseItemAnswer", true),
            step("valueDecimal", "decimal", false),
        ]);
        assert_eq!(
            render(&touched),
            "{'item': 'STRUCT(answer STRUCT(\"valueDecimal\" DECIMAL(18,8))[])[]'}"
        );
    }
}
