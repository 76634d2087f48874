//! View assembly (stage 4).
//!
//! Walks a ViewDefinition, compiles every FHIRPath expression through the
//! expression compiler, and stitches the resulting fragments into a single
//! `SELECT ... FROM {{source}} AS base [, LATERAL ...] WHERE ...` query.
//! The `{{source}}` placeholder is bound by the enclosing template to
//! `read_json(...)`, a dbt source, or any other relation.

use std::collections::BTreeMap;

use serde_json::Value;

use flatquack_fhirpath::{
    singleton_guard, DuckType, ExpressionCompiler, FhirPathError, Focus, LateralTable, LowerMode,
    SqlFragment,
};

use crate::column::ColumnInfo;
use crate::input_schema;
use crate::view_definition::{Column, SelectNode, ViewDefinition};
use crate::{Error, Result, UserVariables};

/// The output of compiling one ViewDefinition.
#[derive(Debug, Clone)]
pub struct CompileResult {
    /// The generated DuckDB query, with a `{{source}}` placeholder for the
    /// base relation.
    pub sql: String,

    /// `read_json(columns = ...)` struct literal restricted to the element
    /// paths the view reads.
    pub input_schema: String,

    /// Metadata for the output columns, in SELECT order.
    pub columns: Vec<ColumnInfo>,

    /// Non-fatal warnings gathered during compilation.
    pub diagnostics: Vec<String>,
}

/// Compile a ViewDefinition into a single SQL query.
pub(crate) fn compile_view(
    view: &ViewDefinition,
    schema: &flatquack_fhirpath::FhirSchema,
    vars: &UserVariables,
) -> Result<CompileResult> {
    if !schema.has_type(&view.resource) {
        return Err(Error::UnknownResource(view.resource.clone()));
    }

    // ViewDefinition constants are visible as %name, with caller-supplied
    // variables taking precedence.
    let mut merged: BTreeMap<String, Value> = view
        .constant
        .iter()
        .map(|c| (c.name.clone(), c.value()))
        .collect();
    merged.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut assembler = Assembler {
        compiler: ExpressionCompiler::new(schema, merged, view.resource.clone(), "base"),
        columns: Vec::new(),
        laterals: Vec::new(),
        renames: Vec::new(),
        wheres: Vec::new(),
        diagnostics: view.warnings.clone(),
    };
    for warning in &view.warnings {
        tracing::warn!(detail = %warning, "ViewDefinition warning");
    }

    let root = assembler.compiler.root_focus();
    for (i, node) in view.select.iter().enumerate() {
        assembler.walk_select(node, &root, &format!("select[{i}]"))?;
    }
    for (i, clause) in view.where_.iter().enumerate() {
        assembler.add_where(&clause.path, &root, &format!("where[{i}]"))?;
    }

    Ok(assembler.finish())
}

struct Assembler<'a> {
    compiler: ExpressionCompiler<'a>,
    columns: Vec<(ColumnInfo, String)>,
    laterals: Vec<LateralTable>,
    /// Alias rewrites produced by lateral deduplication.
    renames: Vec<(String, String)>,
    wheres: Vec<String>,
    diagnostics: Vec<String>,
}

impl Assembler<'_> {
    fn walk_select(&mut self, node: &SelectNode, focus: &Focus, at: &str) -> Result<()> {
        if node.union_all.is_some() {
            return Err(Error::Unsupported {
                view_path: at.to_string(),
                message: "unionAll of select nodes is not supported".to_string(),
            });
        }
        if node.for_each.is_some() && node.for_each_or_null.is_some() {
            return Err(Error::InvalidViewDefinition(format!(
                "{at}: forEach and forEachOrNull are mutually exclusive"
            )));
        }

        let for_each = node
            .for_each
            .as_deref()
            .map(|path| (path, false))
            .or_else(|| node.for_each_or_null.as_deref().map(|path| (path, true)));

        let child_focus;
        let focus = match for_each {
            Some((path, or_null)) => {
                child_focus = self.enter_for_each(path, or_null, focus, at)?;
                &child_focus
            }
            None => focus,
        };

        if let Some(columns) = &node.column {
            for col in columns {
                self.add_column(col, focus, at)?;
            }
        }
        for (i, nested) in node.select.iter().enumerate() {
            self.walk_select(nested, focus, &format!("{at}.select[{i}]"))?;
        }
        Ok(())
    }

    /// Lower a forEach path to a list expression and mount it as a lateral
    /// unnest whose row becomes the focus of contained selects.
    fn enter_for_each(
        &mut self,
        path: &str,
        or_null: bool,
        focus: &Focus,
        at: &str,
    ) -> Result<Focus> {
        let compiled = self.compile_expr(path, focus, LowerMode::Value, at)?;
        let expr = self.absorb(&compiled.fragment);
        let list_expr = if compiled.fragment.is_array {
            expr
        } else {
            // forEach over a singleton iterates the single element.
            format!("[{expr}]")
        };

        // A nested forEach depends on the lateral whose row is its focus.
        let dependencies: Vec<String> = focus
            .sql
            .split('.')
            .next()
            .filter(|head| *head != "base")
            .map(|head| vec![head.to_string()])
            .unwrap_or_default();

        let alias = self.compiler.for_each_alias();
        let alias = self.merge_table(LateralTable {
            alias: alias.clone(),
            sql_text: format!("UNNEST({list_expr}) AS {alias}(item)"),
            dependencies,
            left_join: or_null,
        });

        Ok(Focus {
            fhir_type: compiled.fhir_type.clone(),
            sql: format!("{alias}.item"),
            path: compiled.path.clone(),
        })
    }

    fn add_column(&mut self, col: &Column, focus: &Focus, at: &str) -> Result<()> {
        let collection = col.collection.unwrap_or(false);
        // Collection columns keep list values intact; scalar columns let
        // arrays expand into rows.
        let mode = if collection {
            LowerMode::Value
        } else {
            LowerMode::Rows
        };
        let compiled = self.compile_expr(&col.path, focus, mode, at)?;
        let expr = self.absorb(&compiled.fragment);

        let mut duck_type = compiled.fragment.result_type.clone();
        if let Some(declared) = &col.col_type {
            let declared_duck = DuckType::from_fhir_type(declared);
            if duck_type == DuckType::Unknown && declared_duck != DuckType::Unknown {
                duck_type = declared_duck;
            } else if declared_duck != DuckType::Unknown && declared_duck != duck_type {
                let warning = format!(
                    "{at}: column '{}' declares type '{declared}' but its path resolves to {}",
                    col.name, duck_type
                );
                tracing::warn!(detail = %warning, "column type mismatch");
                self.diagnostics.push(warning);
            }
        }

        let sql_expr = if collection {
            if compiled.fragment.is_array {
                expr
            } else {
                format!("[{expr}]")
            }
        } else if compiled.fragment.is_array {
            // Runtime singleton assertion for a value that is still a list.
            singleton_guard(&expr, &col.name)
        } else {
            expr
        };

        self.columns.push((
            ColumnInfo {
                name: col.name.clone(),
                duck_type,
                is_collection: collection,
            },
            sql_expr,
        ));
        Ok(())
    }

    fn add_where(&mut self, path: &str, focus: &Focus, at: &str) -> Result<()> {
        let compiled = self.compile_expr(path, focus, LowerMode::Rows, at)?;
        let boolean_like = matches!(
            compiled.fragment.result_type,
            DuckType::Boolean | DuckType::Unknown
        );
        if compiled.fragment.is_array || compiled.cardinality.is_collection() || !boolean_like {
            return Err(Error::Expression {
                view_path: at.to_string(),
                expression: path.to_string(),
                source: FhirPathError::CardinalityMismatch {
                    message: "where path must evaluate to a singleton boolean".to_string(),
                    offset: 0,
                },
            });
        }
        let expr = self.absorb(&compiled.fragment);
        self.wheres.push(expr);
        Ok(())
    }

    fn compile_expr(
        &mut self,
        source: &str,
        focus: &Focus,
        mode: LowerMode,
        at: &str,
    ) -> Result<flatquack_fhirpath::CompiledExpression> {
        self.compiler
            .compile(source, focus, mode)
            .map_err(|e| Error::Expression {
                view_path: at.to_string(),
                expression: source.to_string(),
                source: e,
            })
    }

    /// Merge a fragment's lateral tables into the query (deduplicating)
    /// and return its expression with alias renames applied.
    fn absorb(&mut self, fragment: &SqlFragment) -> String {
        for table in &fragment.tables {
            self.merge_table(table.clone());
        }
        self.apply_renames(&fragment.expr)
    }

    /// Add a lateral table, deduplicating by structural equality of its
    /// text after alias normalization. Returns the surviving alias.
    fn merge_table(&mut self, mut table: LateralTable) -> String {
        table.sql_text = self.apply_renames(&table.sql_text);
        let key = normalized_key(&table);
        if let Some(existing) = self
            .laterals
            .iter()
            .find(|t| t.left_join == table.left_join && normalized_key(t) == key)
        {
            let surviving = existing.alias.clone();
            if surviving != table.alias {
                self.renames.push((table.alias, surviving.clone()));
            }
            surviving
        } else {
            table.dependencies = table
                .dependencies
                .iter()
                .map(|d| self.rename_of(d))
                .collect();
            let alias = table.alias.clone();
            self.laterals.push(table);
            alias
        }
    }

    fn rename_of(&self, alias: &str) -> String {
        self.renames
            .iter()
            .find(|(from, _)| from == alias)
            .map(|(_, to)| to.clone())
            .unwrap_or_else(|| alias.to_string())
    }

    fn apply_renames(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (from, to) in &self.renames {
            result = replace_alias(&result, from, to);
        }
        result
    }

    fn finish(self) -> CompileResult {
        let column_sql = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|(info, expr)| format!("{} AS \"{}\"", expr, info.name))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!("SELECT {column_sql} FROM {{{{source}}}} AS base");
        for table in &self.laterals {
            if table.left_join {
                sql.push_str(&format!(" LEFT JOIN LATERAL {} ON true", table.sql_text));
            } else {
                sql.push_str(&format!(", LATERAL {}", table.sql_text));
            }
        }
        if !self.wheres.is_empty() {
            let conjunction = self
                .wheres
                .iter()
                .map(|w| format!("({w})"))
                .collect::<Vec<_>>()
                .join(" AND ");
            sql.push_str(&format!(" WHERE {conjunction}"));
        }

        let input_schema = input_schema::render(self.compiler.touched());
        tracing::debug!(sql = %sql, "generated view SQL");

        CompileResult {
            sql,
            input_schema,
            columns: self.columns.into_iter().map(|(info, _)| info).collect(),
            diagnostics: self.diagnostics,
        }
    }
}

/// The dedup key for a lateral: its text with every alias the table
/// itself defines (`AS xN(item)`, including inner subquery scans)
/// replaced by positional placeholders. References to upstream laterals
/// are left intact so tables reading different rows never collide.
fn normalized_key(table: &LateralTable) -> String {
    let text = &table.sql_text;
    let bytes = text.as_bytes();
    let mut internal: Vec<String> = Vec::new();
    let mut search = 0;
    while let Some(pos) = text[search..].find("(item)") {
        let abs = search + pos;
        let mut start = abs;
        while start > 0
            && (bytes[start - 1].is_ascii_alphanumeric() || bytes[start - 1] == b'_')
        {
            start -= 1;
        }
        let alias = &text[start..abs];
        if !alias.is_empty()
            && text[..start].ends_with(" AS ")
            && !internal.iter().any(|a| a == alias)
        {
            internal.push(alias.to_string());
        }
        search = abs + 1;
    }

    let mut key = text.clone();
    for (i, alias) in internal.iter().enumerate() {
        let placeholder = format!("_{}", i + 1);
        key = replace_alias(&key, alias, &placeholder);
        key = key.replace(
            &format!(" AS {alias}(item)"),
            &format!(" AS {placeholder}(item)"),
        );
    }
    key
}

/// Replace references `from.` with `to.`, respecting identifier
/// boundaries.
fn replace_alias(text: &str, from: &str, to: &str) -> String {
    let needle = format!("{from}.");
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(&needle) {
        let boundary = pos == 0
            || rest[..pos]
                .chars()
                .next_back()
                .is_some_and(|c| !c.is_ascii_alphanumeric() && c != '_');
        result.push_str(&rest[..pos]);
        if boundary {
            result.push_str(to);
            result.push('.');
        } else {
            result.push_str(&needle);
        }
        rest = &rest[pos + needle.len()..];
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_alias_respects_boundaries() {
        assert_eq!(replace_alias("u2.item.family", "u2", "u1"), "u1.item.family");
        assert_eq!(replace_alias("u21.item", "u2", "u1"), "u21.item");
        assert_eq!(replace_alias("feu2.item", "u2", "u1"), "feu2.item");
        assert_eq!(
            replace_alias("len(u2.item) + u2.item", "u2", "u1"),
            "len(u1.item) + u1.item"
        );
    }

    #[test]
    fn test_normalized_key_replaces_own_alias() {
        let table = LateralTable {
            alias: "u3".to_string(),
            sql_text: "UNNEST(base.name) AS u3(item)".to_string(),
            dependencies: vec![],
            left_join: false,
        };
        assert_eq!(normalized_key(&table), "UNNEST(base.name) AS _1(item)");
    }

    #[test]
    fn test_normalized_key_ignores_inner_alias_numbering() {
        let first = LateralTable {
            alias: "u2".to_string(),
            sql_text: "(SELECT u1.item AS item FROM UNNEST(base.name) AS u1(item) \
                       WHERE (u1.item.active)) AS u2(item)"
                .to_string(),
            dependencies: vec![],
            left_join: false,
        };
        let second = LateralTable {
            alias: "u4".to_string(),
            sql_text: "(SELECT u3.item AS item FROM UNNEST(base.name) AS u3(item) \
                       WHERE (u3.item.active)) AS u4(item)"
                .to_string(),
            dependencies: vec![],
            left_join: false,
        };
        assert_eq!(normalized_key(&first), normalized_key(&second));
    }

    #[test]
    fn test_normalized_key_keeps_upstream_references() {
        let from_fe1 = LateralTable {
            alias: "u1".to_string(),
            sql_text: "UNNEST(fe1.item.given) AS u1(item)".to_string(),
            dependencies: vec!["fe1".to_string()],
            left_join: false,
        };
        let from_fe2 = LateralTable {
            alias: "u2".to_string(),
            sql_text: "UNNEST(fe2.item.given) AS u2(item)".to_string(),
            dependencies: vec!["fe2".to_string()],
            left_join: false,
        };
        assert_ne!(normalized_key(&from_fe1), normalized_key(&from_fe2));
    }
}
