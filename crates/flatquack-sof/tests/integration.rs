//! Integration tests for the ViewDefinition compiler.
//!
//! These tests verify the full flow from ViewDefinition parsing to SQL
//! generation against a small FHIR schema fixture.

use flatquack_fhirpath::{DuckType, FhirPathError, FhirSchema};
use flatquack_sof::{compile, Error, UserVariables, ViewDefinition};
use serde_json::json;

fn schema() -> FhirSchema {
    FhirSchema::from_json(&json!({
        "Patient": {
            "id": { "type": ["id"], "max": "1" },
            "active": { "type": ["boolean"], "max": "1" },
            "gender": { "type": ["code"], "max": "1" },
            "birthDate": { "type": ["date"], "max": "1" },
            "name": { "type": ["HumanName"], "max": "*" },
            "address": { "type": ["Address"], "max": "*" },
            "contact": { "type": ["PatientContact"], "max": "*" },
            "link": { "type": ["PatientLink"], "max": "*" }
        },
        "HumanName": {
            "use": { "type": ["code"], "max": "1" },
            "family": { "type": ["string"], "max": "1" },
            "given": { "type": ["string"], "max": "*" }
        },
        "Address": {
            "city": { "type": ["string"], "max": "1" },
            "postalCode": { "type": ["string"], "max": "1" }
        },
        "PatientContact": {
            "address": { "type": ["Address"], "max": "1" }
        },
        "PatientLink": {
            "other": { "type": ["Reference"], "max": "1" }
        },
        "Reference": {
            "reference": { "type": ["string"], "max": "1" }
        },
        "QuestionnaireResponse": {
            "id": { "type": ["id"], "max": "1" },
            "item": { "type": ["QuestionnaireResponseItem"], "max": "*" }
        },
        "QuestionnaireResponseItem": {
            "linkId": { "type": ["string"], "max": "1" },
            "answer": { "type": ["QuestionnaireResponseItemAnswer"], "max": "*" }
        },
        "QuestionnaireResponseItemAnswer": {
            "value": {
                "type": ["string", "decimal", "boolean"],
                "max": "1",
                "choice": "value"
            }
        }
    }))
    .unwrap()
}

/// Helper to parse a ViewDefinition and compile it with no variables.
fn compile_view(view_json: serde_json::Value) -> flatquack_sof::CompileResult {
    let view = ViewDefinition::from_json(&view_json).expect("failed to parse ViewDefinition");
    compile(&view, &schema(), &UserVariables::new()).expect("failed to compile view")
}

/// Helper that expects compilation to fail.
fn compile_error(view_json: serde_json::Value) -> Error {
    let view = ViewDefinition::from_json(&view_json).expect("failed to parse ViewDefinition");
    compile(&view, &schema(), &UserVariables::new()).expect_err("expected compile error")
}

// =============================================================================
// Basic projections
// =============================================================================

#[test]
fn test_basic_projection_expands_array_paths() {
    // S1: a scalar column plus a path through a repeating element.
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [
                {"name": "id", "path": "id"},
                {"name": "family", "path": "name.family"}
            ]
        }]
    }));

    assert!(
        result.sql.starts_with("SELECT base.id AS \"id\", u1.item.family AS \"family\""),
        "unexpected select list: {}",
        result.sql
    );
    assert!(
        result.sql.contains("FROM {{source}} AS base, LATERAL UNNEST(base.name) AS u1(item)"),
        "expected a lateral unnest: {}",
        result.sql
    );
    assert_eq!(result.columns.len(), 2);
    assert_eq!(result.columns[0].duck_type, DuckType::Varchar);
    assert!(!result.columns[1].is_collection);
}

#[test]
fn test_shared_path_deduplicates_laterals() {
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [
                {"name": "family", "path": "name.family"},
                {"name": "use", "path": "name.use"}
            ]
        }]
    }));

    assert_eq!(
        result.sql.matches("UNNEST(base.name)").count(),
        1,
        "shared path must produce one unnest: {}",
        result.sql
    );
    assert!(result.sql.contains("u1.item.family AS \"family\""));
    assert!(result.sql.contains("u1.item.\"use\" AS \"use\""));
}

#[test]
fn test_collection_column_keeps_list_value() {
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [
                {"name": "families", "path": "name.family", "collection": true}
            ]
        }]
    }));

    assert!(
        result.sql.contains("list_transform(base.name, x1 -> x1.family) AS \"families\""),
        "collection column should stay a list: {}",
        result.sql
    );
    assert!(!result.sql.contains("LATERAL"));
    assert!(result.columns[0].is_collection);
}

#[test]
fn test_singleton_column_on_list_value_gets_guard() {
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [{"name": "name", "path": "name"}]
        }]
    }));

    assert!(
        result.sql.contains("error("),
        "list value in a singleton column needs the runtime assertion: {}",
        result.sql
    );
    assert!(result.sql.contains("(base.name)[1]"));
}

// =============================================================================
// forEach / forEachOrNull
// =============================================================================

#[test]
fn test_for_each_mounts_lateral_focus() {
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "forEach": "name",
            "column": [
                {"name": "use", "path": "use"},
                {"name": "family", "path": "family"},
                {"name": "given", "path": "given", "collection": true}
            ]
        }]
    }));

    assert!(
        result.sql.contains(", LATERAL UNNEST(base.name) AS fe1(item)"),
        "forEach should mount a lateral: {}",
        result.sql
    );
    assert!(result.sql.contains("fe1.item.\"use\" AS \"use\""));
    assert!(result.sql.contains("fe1.item.given AS \"given\""));
    assert!(result.columns[2].is_collection);
}

#[test]
fn test_for_each_or_null_uses_left_join() {
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "forEachOrNull": "address",
            "column": [{"name": "city", "path": "city"}]
        }]
    }));

    assert!(
        result
            .sql
            .contains("LEFT JOIN LATERAL UNNEST(base.address) AS fe1(item) ON true"),
        "forEachOrNull should left-join: {}",
        result.sql
    );
}

#[test]
fn test_nested_select_composes_conjunctively() {
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [{"name": "id", "path": "id"}],
            "select": [{
                "forEach": "name",
                "column": [{"name": "family", "path": "family"}]
            }]
        }]
    }));

    assert!(result.sql.contains("base.id AS \"id\""));
    assert!(result.sql.contains("UNNEST(base.name) AS fe1(item)"));
    assert!(result.sql.contains("fe1.item.family AS \"family\""));
}

#[test]
fn test_nested_for_each_chains_focus() {
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "forEach": "name",
            "select": [{
                "forEach": "given",
                "column": [{"name": "given", "path": "$this"}]
            }]
        }]
    }));

    assert!(result.sql.contains("UNNEST(base.name) AS fe1(item)"));
    assert!(result.sql.contains("UNNEST(fe1.item.given) AS fe2(item)"));
    assert!(result.sql.contains("fe2.item AS \"given\""));
}

// =============================================================================
// Extension functions
// =============================================================================

#[test]
fn test_for_each_function_builds_struct_rows() {
    // S2: _forEach over a repeating element produces a list of structs.
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [{
                "name": "names",
                "path": "name._forEach(_col('use', use), _col('last', family))",
                "collection": true
            }]
        }]
    }));

    assert!(
        result.sql.contains(
            "(SELECT list({'use': u1.item.\"use\", 'last': u1.item.family}) \
             FROM UNNEST(base.name) AS u1(item))"
        ),
        "unexpected forEach lowering: {}",
        result.sql
    );
}

#[test]
fn test_union_all_skips_null_operands() {
    // S3: a null operand contributes no elements without suppressing the
    // others.
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [{
                "name": "postal_codes",
                "path": "_unionAll(address.postalCode, contact.address.postalCode)",
                "collection": true
            }]
        }]
    }));

    assert!(result.sql.contains("array_concat("), "{}", result.sql);
    assert_eq!(
        result.sql.matches("coalesce(").count(),
        2,
        "every operand needs a null fallback: {}",
        result.sql
    );
    assert!(result.sql.contains(", [])"));
    assert!(result.columns[0].is_collection);
}

#[test]
fn test_singleton_violation_compiles_with_runtime_guard() {
    // S4: compilation succeeds; the violation surfaces at query time via
    // the emitted assertion.
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [{"name": "name", "path": "_forEach(_col('name', name))"}]
        }]
    }));

    assert!(
        result.sql.contains("error('multi-item collection in singleton column ''name''')"),
        "expected the singleton assertion: {}",
        result.sql
    );
}

#[test]
fn test_invoke_rejects_non_literal_arguments() {
    // S5: a path argument to _invoke is a compile error.
    let err = compile_error(json!({
        "resource": "Patient",
        "select": [{
            "column": [{
                "name": "c",
                "path": "name._forEach(_col('c', family._invoke('concat', use)))"
            }]
        }]
    }));

    let Error::Expression { source, .. } = err else {
        panic!("expected expression error, got {err:?}");
    };
    assert!(matches!(source, FhirPathError::InvokeParamNotLiteral { .. }));
}

#[test]
fn test_decimal_choice_keeps_precision() {
    // S6: valueDecimal resolves to DECIMAL so the engine keeps 0.0006
    // exact.
    let result = compile_view(json!({
        "resource": "QuestionnaireResponse",
        "select": [{
            "column": [{
                "name": "crp",
                "path": "item.where(linkId = 'crpValue').answer.valueDecimal"
            }]
        }]
    }));

    assert!(result.sql.contains("u3.item.\"valueDecimal\" AS \"crp\""), "{}", result.sql);
    assert!(result.sql.contains(
        "(SELECT u1.item AS item FROM UNNEST(base.item) AS u1(item) \
         WHERE (u1.item.\"linkId\" = 'crpValue')) AS u2(item)"
    ));
    assert_eq!(result.columns[0].duck_type, DuckType::Decimal);
    assert!(result
        .input_schema
        .contains("\"valueDecimal\" DECIMAL(18,8)"));
}

#[test]
fn test_split_path_with_negative_index() {
    // S7: negative indexes count from the end, in SQL.
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [{"name": "linked_id", "path": "link.other.reference._splitPath(-1)"}]
        }]
    }));

    assert!(
        result.sql.contains("string_split(u1.item.other.reference, '/')"),
        "{}",
        result.sql
    );
    assert!(result.sql.contains("(-1)"));
    assert!(result.sql.contains("len("));
}

#[test]
fn test_get_resource_key() {
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [{"name": "key", "path": "getResourceKey()"}]
        }]
    }));

    assert!(result.sql.contains("('Patient/' || base.id) AS \"key\""));
}

// =============================================================================
// where clauses
// =============================================================================

#[test]
fn test_where_clauses_are_conjoined() {
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [{"name": "id", "path": "id"}]
        }],
        "where": [
            {"path": "active"},
            {"path": "name.exists()"}
        ]
    }));

    assert!(
        result.sql.ends_with("WHERE (base.active) AND (coalesce(len(base.name), 0) > 0)"),
        "unexpected where clause: {}",
        result.sql
    );
}

#[test]
fn test_where_requires_boolean() {
    let err = compile_error(json!({
        "resource": "Patient",
        "select": [{"column": [{"name": "id", "path": "id"}]}],
        "where": [{"path": "gender"}]
    }));
    assert!(matches!(err, Error::Expression { .. }));
}

// =============================================================================
// Variables and constants
// =============================================================================

#[test]
fn test_view_constants_are_visible_as_variables() {
    let result = compile_view(json!({
        "resource": "Patient",
        "constant": [{"name": "wantedUse", "valueString": "official"}],
        "select": [{
            "column": [{"name": "id", "path": "id"}]
        }],
        "where": [{"path": "name.where(use = %wantedUse).exists()"}]
    }));

    assert!(result.sql.contains("= 'official'"), "{}", result.sql);
}

#[test]
fn test_caller_variables_override_constants() {
    let view = ViewDefinition::from_json(&json!({
        "resource": "Patient",
        "constant": [{"name": "wantedUse", "valueString": "official"}],
        "select": [{"column": [{"name": "id", "path": "id"}]}],
        "where": [{"path": "name.where(use = %wantedUse).exists()"}]
    }))
    .unwrap();

    let mut vars = UserVariables::new();
    vars.insert("wantedUse".to_string(), json!("nickname"));
    let result = compile(&view, &schema(), &vars).unwrap();
    assert!(result.sql.contains("= 'nickname'"), "{}", result.sql);
}

#[test]
fn test_unknown_variable_fails() {
    let err = compile_error(json!({
        "resource": "Patient",
        "select": [{"column": [{"name": "id", "path": "id"}]}],
        "where": [{"path": "name.where(use = %missing).exists()"}]
    }));
    let Error::Expression { source, .. } = err else {
        panic!("expected expression error, got {err:?}");
    };
    assert!(matches!(source, FhirPathError::UnknownElement { .. }));
}

// =============================================================================
// Rejections and diagnostics
// =============================================================================

#[test]
fn test_union_all_select_nodes_rejected() {
    let err = compile_error(json!({
        "resource": "Patient",
        "select": [{
            "unionAll": [
                {"column": [{"name": "id", "path": "id"}]},
                {"column": [{"name": "id", "path": "id"}]}
            ]
        }]
    }));
    assert!(matches!(err, Error::Unsupported { .. }));
}

#[test]
fn test_unknown_resource_rejected() {
    let err = compile_error(json!({
        "resource": "Spaceship",
        "select": [{"column": [{"name": "id", "path": "id"}]}]
    }));
    assert!(matches!(err, Error::UnknownResource(_)));
}

#[test]
fn test_unknown_element_rejected() {
    let err = compile_error(json!({
        "resource": "Patient",
        "select": [{"column": [{"name": "x", "path": "name.frequency"}]}]
    }));
    let Error::Expression { source, .. } = err else {
        panic!("expected expression error, got {err:?}");
    };
    assert!(matches!(source, FhirPathError::UnknownElement { .. }));
}

#[test]
fn test_unknown_fields_become_diagnostics() {
    let result = compile_view(json!({
        "resource": "Patient",
        "materializeAs": "table",
        "select": [{"column": [{"name": "id", "path": "id"}]}]
    }));
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.contains("materializeAs")));
}

#[test]
fn test_declared_type_mismatch_warns() {
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [{"name": "id", "path": "id", "type": "integer"}]
        }]
    }));
    assert!(result.diagnostics.iter().any(|d| d.contains("declares type")));
}

// =============================================================================
// Input schema and idempotence
// =============================================================================

#[test]
fn test_input_schema_restricts_to_touched_paths() {
    let result = compile_view(json!({
        "resource": "Patient",
        "select": [{
            "column": [
                {"name": "id", "path": "id"},
                {"name": "family", "path": "name.family"}
            ]
        }]
    }));

    assert_eq!(
        result.input_schema,
        "{'id': 'VARCHAR', 'name': 'STRUCT(family VARCHAR)[]'}"
    );
}

#[test]
fn test_compilation_is_idempotent() {
    let view_json = json!({
        "resource": "Patient",
        "select": [{
            "forEach": "name",
            "column": [
                {"name": "family", "path": "family"},
                {"name": "given", "path": "given", "collection": true}
            ]
        }],
        "where": [{"path": "active"}]
    });

    let first = compile_view(view_json.clone());
    let second = compile_view(view_json);
    assert_eq!(first.sql, second.sql);
    assert_eq!(first.input_schema, second.input_schema);
}
