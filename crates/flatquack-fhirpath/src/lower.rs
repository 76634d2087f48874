//! SQL lowering (stage 3).
//!
//! Post-order walk over the typed AST producing a [`SqlFragment`] per
//! expression: DuckDB expression text plus the lateral flattening tables it
//! needs. Two modes exist:
//!
//! - **row mode**: stepping through an array element introduces a lazy
//!   `UNNEST` lateral, multiplying rows. Used for scalar output columns and
//!   where clauses.
//! - **value mode**: arrays stay list expressions; traversal through them
//!   lowers to `list_transform`/`flatten`, filters to `list_filter`. Used
//!   for reducer receivers, `_unionAll` operands, `_forEach` bodies, and
//!   collection-typed output columns.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::ast::{BinaryOp, LiteralValue, UnaryOp};
use crate::parser;
use crate::resolver::{
    Builtin, PathStep, ResolveFocus, Resolver, TouchedPaths, TypedCol, TypedExpr, TypedExprKind,
};
use crate::schema::FhirSchema;
use crate::types::{quote_ident, Cardinality, DuckType};
use crate::Result;

/// A lowered SQL expression and the lateral tables it depends on.
#[derive(Debug, Clone)]
pub struct SqlFragment {
    /// DuckDB expression text.
    pub expr: String,

    /// Lateral flattening tables required by `expr`, in emission order.
    pub tables: Vec<LateralTable>,

    /// Physical type of a single value of the expression.
    pub result_type: DuckType,

    /// Whether `expr` denotes a LIST value.
    pub is_array: bool,

    /// Alias of the lateral row this fragment reads from, when any.
    pub alias: Option<String>,
}

/// One lateral flattening table, typically `UNNEST(expr) AS uN(item)`.
#[derive(Debug, Clone)]
pub struct LateralTable {
    pub alias: String,

    /// Full table text including the `AS alias(item)` clause.
    pub sql_text: String,

    /// Aliases of earlier lateral tables this one references.
    pub dependencies: Vec<String>,

    /// Emit as `LEFT JOIN LATERAL ... ON true` instead of a cross join.
    pub left_join: bool,
}

/// How a column path should treat arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerMode {
    /// Arrays become lateral unnests; rows multiply.
    Rows,
    /// Arrays stay list values; no laterals are introduced.
    Value,
}

/// The focus a FHIRPath expression is compiled against: a FHIR type plus
/// the SQL expression addressing the focus value.
#[derive(Debug, Clone)]
pub struct Focus {
    pub fhir_type: String,
    pub sql: String,
    /// Root-relative element path of the focus, for input-schema tracking.
    /// `None` when the focus does not correspond to a schema element chain.
    pub path: Option<Vec<PathStep>>,
}

/// A fully compiled FHIRPath expression.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    pub fragment: SqlFragment,
    pub fhir_type: String,
    pub cardinality: Cardinality,
    pub path: Option<Vec<PathStep>>,
}

/// Per-compilation alias generator. Aliases are local to one compilation
/// and deterministic given traversal order.
#[derive(Debug, Default)]
pub struct AliasGen {
    unnest: usize,
    for_each: usize,
    lambda: usize,
}

impl AliasGen {
    pub fn next_unnest(&mut self) -> String {
        self.unnest += 1;
        format!("u{}", self.unnest)
    }

    pub fn next_for_each(&mut self) -> String {
        self.for_each += 1;
        format!("fe{}", self.for_each)
    }

    fn next_lambda(&mut self) -> String {
        self.lambda += 1;
        format!("x{}", self.lambda)
    }
}

/// Compiles FHIRPath expression strings into SQL fragments, threading the
/// alias counter and touched-path collection across all expressions of one
/// view compilation.
pub struct ExpressionCompiler<'a> {
    schema: &'a FhirSchema,
    vars: BTreeMap<String, Value>,
    root_type: String,
    root_sql: String,
    aliases: AliasGen,
    touched: TouchedPaths,
}

impl<'a> ExpressionCompiler<'a> {
    pub fn new(
        schema: &'a FhirSchema,
        vars: BTreeMap<String, Value>,
        root_type: impl Into<String>,
        root_sql: impl Into<String>,
    ) -> Self {
        Self {
            schema,
            vars,
            root_type: root_type.into(),
            root_sql: root_sql.into(),
            aliases: AliasGen::default(),
            touched: TouchedPaths::default(),
        }
    }

    /// The focus addressing the root resource row.
    pub fn root_focus(&self) -> Focus {
        Focus {
            fhir_type: self.root_type.clone(),
            sql: self.root_sql.clone(),
            path: Some(Vec::new()),
        }
    }

    /// Allocate a forEach lateral alias.
    pub fn for_each_alias(&mut self) -> String {
        self.aliases.next_for_each()
    }

    /// Parse, resolve, and lower one FHIRPath expression.
    ///
    /// # Errors
    ///
    /// Propagates parse, resolution, and lowering errors.
    pub fn compile(
        &mut self,
        source: &str,
        focus: &Focus,
        mode: LowerMode,
    ) -> Result<CompiledExpression> {
        let ast = parser::parse(source)?;
        let resolve_focus = ResolveFocus {
            fhir_type: focus.fhir_type.clone(),
            cardinality: Cardinality::Singleton,
            path: focus.path.clone(),
        };
        let mut resolver = Resolver::new(self.schema, &self.vars, &mut self.touched);
        let typed = resolver.resolve_expression(&ast, &resolve_focus)?;

        let ctx = LowerCtx {
            focus_sql: focus.sql.clone(),
            root_sql: self.root_sql.clone(),
            root_type: self.root_type.clone(),
        };
        let mut lowerer = Lowerer {
            aliases: &mut self.aliases,
        };
        let fragment = lowerer.lower(&typed, &ctx, mode)?;
        tracing::debug!(expression = %source, sql = %fragment.expr, "lowered FHIRPath expression");

        Ok(CompiledExpression {
            fragment,
            fhir_type: typed.rtype.fhir_type.clone(),
            cardinality: typed.rtype.cardinality,
            path: typed.path.clone(),
        })
    }

    /// The element paths read so far, for the reduced input schema.
    pub fn touched(&self) -> &TouchedPaths {
        &self.touched
    }
}

#[derive(Debug, Clone)]
struct LowerCtx {
    focus_sql: String,
    root_sql: String,
    root_type: String,
}

impl LowerCtx {
    fn with_focus(&self, focus_sql: impl Into<String>) -> Self {
        Self {
            focus_sql: focus_sql.into(),
            root_sql: self.root_sql.clone(),
            root_type: self.root_type.clone(),
        }
    }
}

struct Lowerer<'a> {
    aliases: &'a mut AliasGen,
}

impl Lowerer<'_> {
    fn lower(&mut self, expr: &TypedExpr, ctx: &LowerCtx, mode: LowerMode) -> Result<SqlFragment> {
        match &expr.kind {
            TypedExprKind::Literal(value) => Ok(scalar(
                value.to_sql(),
                expr.rtype.physical.clone(),
            )),

            TypedExprKind::Variable { value, .. } => Ok(scalar(
                value.to_sql(),
                expr.rtype.physical.clone(),
            )),

            TypedExprKind::This => Ok(scalar(
                ctx.focus_sql.clone(),
                expr.rtype.physical.clone(),
            )),

            TypedExprKind::ResourceKey => Ok(scalar(
                format!("('{}/' || {}.id)", ctx.root_type, ctx.root_sql),
                DuckType::Varchar,
            )),

            TypedExprKind::Element {
                receiver,
                name,
                collection,
            } => self.lower_element(expr, receiver.as_deref(), name, *collection, ctx, mode),

            TypedExprKind::Index { receiver, index } => {
                let rf = self.lower(receiver, ctx, LowerMode::Value)?;
                let idx = self.lower(index, ctx, LowerMode::Value)?;
                let mut out = scalar(
                    format!("({})[({}) + 1]", rf.expr, idx.expr),
                    expr.rtype.physical.clone(),
                );
                out.tables = merge_tables(vec![rf.tables, idx.tables]);
                Ok(out)
            }

            TypedExprKind::Where {
                receiver,
                predicate,
            } => self.lower_where(receiver, predicate, ctx, mode),

            TypedExprKind::Builtin {
                func,
                receiver,
                args,
            } => self.lower_builtin(*func, receiver, args, ctx),

            TypedExprKind::ForEach {
                receiver,
                cols,
                or_null,
            } => self.lower_for_each(expr, receiver.as_deref(), cols, *or_null, ctx),

            TypedExprKind::UnionAll { operands } => self.lower_union_all(expr, operands, ctx),

            TypedExprKind::SplitPath { receiver, index } => {
                self.lower_split_path(receiver, index, ctx, mode)
            }

            TypedExprKind::Invoke {
                receiver,
                function,
                args,
            } => self.lower_invoke(receiver, function, args, ctx, mode),

            TypedExprKind::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs, ctx),

            TypedExprKind::Unary { op, operand } => {
                let inner = self.lower(operand, ctx, LowerMode::Value)?;
                let text = match op {
                    UnaryOp::Minus => format!("(-{})", inner.expr),
                    UnaryOp::Not => format!("(NOT {})", inner.expr),
                };
                let mut out = scalar(text, expr.rtype.physical.clone());
                out.tables = inner.tables;
                Ok(out)
            }

            TypedExprKind::ChoiceGroup { .. } => unreachable!(
                "choice groups are rejected during resolution before lowering"
            ),
        }
    }

    fn lower_element(
        &mut self,
        expr: &TypedExpr,
        receiver: Option<&TypedExpr>,
        name: &str,
        collection: bool,
        ctx: &LowerCtx,
        mode: LowerMode,
    ) -> Result<SqlFragment> {
        let Some(receiver) = receiver else {
            return Ok(SqlFragment {
                expr: format!("{}.{}", ctx.focus_sql, quote_ident(name)),
                tables: Vec::new(),
                result_type: expr.rtype.physical.clone(),
                is_array: collection,
                alias: None,
            });
        };

        let rf = self.lower(receiver, ctx, mode)?;
        if !rf.is_array {
            return Ok(SqlFragment {
                expr: format!("{}.{}", rf.expr, quote_ident(name)),
                tables: rf.tables,
                result_type: expr.rtype.physical.clone(),
                is_array: collection,
                alias: rf.alias,
            });
        }

        match mode {
            LowerMode::Rows => {
                // Project through the array via a fresh lateral unnest.
                let alias = self.aliases.next_unnest();
                let dependencies = table_aliases(&rf.tables);
                let mut tables = rf.tables;
                tables.push(LateralTable {
                    alias: alias.clone(),
                    sql_text: format!("UNNEST({}) AS {}(item)", rf.expr, alias),
                    dependencies,
                    left_join: false,
                });
                Ok(SqlFragment {
                    expr: format!("{}.item.{}", alias, quote_ident(name)),
                    tables,
                    result_type: expr.rtype.physical.clone(),
                    is_array: collection,
                    alias: Some(alias),
                })
            }
            LowerMode::Value => {
                let var = self.aliases.next_lambda();
                let body = format!("{}.{}", var, quote_ident(name));
                let mapped = format!("list_transform({}, {} -> {})", rf.expr, var, body);
                let text = if collection {
                    format!("flatten({mapped})")
                } else {
                    mapped
                };
                Ok(SqlFragment {
                    expr: text,
                    tables: rf.tables,
                    result_type: expr.rtype.physical.clone(),
                    is_array: true,
                    alias: None,
                })
            }
        }
    }

    fn lower_where(
        &mut self,
        receiver: &TypedExpr,
        predicate: &TypedExpr,
        ctx: &LowerCtx,
        mode: LowerMode,
    ) -> Result<SqlFragment> {
        let rf = self.lower(receiver, ctx, mode)?;

        if !rf.is_array {
            // Singleton receiver: keep the value when the predicate holds.
            let pred = self.lower(predicate, &ctx.with_focus(rf.expr.clone()), LowerMode::Value)?;
            let mut out = scalar(
                format!("CASE WHEN {} THEN {} ELSE NULL END", pred.expr, rf.expr),
                rf.result_type.clone(),
            );
            out.tables = merge_tables(vec![rf.tables, pred.tables]);
            return Ok(out);
        }

        match mode {
            LowerMode::Rows => {
                // Turn the lateral into a filtered subquery scan.
                let scan = self.aliases.next_unnest();
                let alias = self.aliases.next_unnest();
                let pred = self.lower(
                    predicate,
                    &ctx.with_focus(format!("{scan}.item")),
                    LowerMode::Value,
                )?;
                let dependencies = table_aliases(&rf.tables);
                let mut tables = rf.tables;
                tables.push(LateralTable {
                    alias: alias.clone(),
                    sql_text: format!(
                        "(SELECT {scan}.item AS item FROM UNNEST({}) AS {scan}(item) \
                         WHERE {}) AS {alias}(item)",
                        rf.expr, pred.expr
                    ),
                    dependencies,
                    left_join: false,
                });
                Ok(SqlFragment {
                    expr: format!("{alias}.item"),
                    tables,
                    result_type: rf.result_type,
                    is_array: false,
                    alias: Some(alias),
                })
            }
            LowerMode::Value => {
                let var = self.aliases.next_lambda();
                let pred = self.lower(predicate, &ctx.with_focus(var.clone()), LowerMode::Value)?;
                Ok(SqlFragment {
                    expr: format!("list_filter({}, {} -> {})", rf.expr, var, pred.expr),
                    tables: merge_tables(vec![rf.tables, pred.tables]),
                    result_type: rf.result_type,
                    is_array: true,
                    alias: None,
                })
            }
        }
    }

    fn lower_builtin(
        &mut self,
        func: Builtin,
        receiver: &TypedExpr,
        args: &[TypedExpr],
        ctx: &LowerCtx,
    ) -> Result<SqlFragment> {
        let rf = self.lower(receiver, ctx, LowerMode::Value)?;
        let mut arg_frags = Vec::with_capacity(args.len());
        for arg in args {
            arg_frags.push(self.lower(arg, ctx, LowerMode::Value)?);
        }

        let x = rf.expr.clone();
        let (text, result_type) = match func {
            Builtin::First => {
                if rf.is_array {
                    (format!("({x})[1]"), rf.result_type.clone())
                } else {
                    (x, rf.result_type.clone())
                }
            }
            Builtin::Single => {
                if rf.is_array {
                    (
                        format!(
                            "CASE WHEN coalesce(len({x}), 0) > 1 \
                             THEN error('single() called on a collection with multiple items') \
                             ELSE ({x})[1] END"
                        ),
                        rf.result_type.clone(),
                    )
                } else {
                    (x, rf.result_type.clone())
                }
            }
            Builtin::Count => {
                if rf.is_array {
                    (format!("coalesce(len({x}), 0)"), DuckType::Integer)
                } else {
                    (
                        format!("CASE WHEN ({x}) IS NULL THEN 0 ELSE 1 END"),
                        DuckType::Integer,
                    )
                }
            }
            Builtin::Exists => {
                if rf.is_array {
                    (format!("coalesce(len({x}), 0) > 0"), DuckType::Boolean)
                } else {
                    (format!("({x}) IS NOT NULL"), DuckType::Boolean)
                }
            }
            Builtin::Empty => {
                if rf.is_array {
                    (format!("coalesce(len({x}), 0) = 0"), DuckType::Boolean)
                } else {
                    (format!("({x}) IS NULL"), DuckType::Boolean)
                }
            }
            Builtin::Join => {
                let sep = arg_frags
                    .first()
                    .map(|f| f.expr.clone())
                    .unwrap_or_else(|| "''".to_string());
                if rf.is_array {
                    (format!("array_to_string({x}, {sep})"), DuckType::Varchar)
                } else {
                    (format!("CAST({x} AS VARCHAR)"), DuckType::Varchar)
                }
            }
            Builtin::Substring => {
                // FHIRPath substring is zero-based; SQL is one-based.
                let start = &arg_frags[0].expr;
                match arg_frags.get(1) {
                    Some(length) => (
                        format!("substring({x}, ({start}) + 1, {})", length.expr),
                        DuckType::Varchar,
                    ),
                    None => (
                        format!("substring({x}, ({start}) + 1)"),
                        DuckType::Varchar,
                    ),
                }
            }
            Builtin::StartsWith => (
                format!("starts_with({x}, {})", arg_frags[0].expr),
                DuckType::Boolean,
            ),
            Builtin::EndsWith => (
                format!("ends_with({x}, {})", arg_frags[0].expr),
                DuckType::Boolean,
            ),
            Builtin::Contains => (
                format!("contains({x}, {})", arg_frags[0].expr),
                DuckType::Boolean,
            ),
            Builtin::Matches => (
                format!("regexp_matches({x}, {})", arg_frags[0].expr),
                DuckType::Boolean,
            ),
            Builtin::Length => (format!("length({x})"), DuckType::Integer),
            Builtin::ToString => (format!("CAST({x} AS VARCHAR)"), DuckType::Varchar),
            Builtin::ToInteger => (format!("TRY_CAST({x} AS INTEGER)"), DuckType::Integer),
        };

        let mut table_sets = vec![rf.tables];
        table_sets.extend(arg_frags.into_iter().map(|f| f.tables));
        Ok(SqlFragment {
            expr: text,
            tables: merge_tables(table_sets),
            result_type,
            is_array: false,
            alias: None,
        })
    }

    fn lower_for_each(
        &mut self,
        expr: &TypedExpr,
        receiver: Option<&TypedExpr>,
        cols: &[TypedCol],
        or_null: bool,
        ctx: &LowerCtx,
    ) -> Result<SqlFragment> {
        let rf = match receiver {
            Some(receiver) => self.lower(receiver, ctx, LowerMode::Value)?,
            None => scalar(ctx.focus_sql.clone(), DuckType::Unknown),
        };

        if rf.is_array {
            let scan = self.aliases.next_unnest();
            let item_ctx = ctx.with_focus(format!("{scan}.item"));
            let fields = self.lower_cols(cols, &item_ctx)?;
            let subquery = format!(
                "(SELECT list({{{fields}}}) FROM UNNEST({}) AS {scan}(item))",
                rf.expr
            );
            let text = if or_null {
                // NULL or empty receiver contributes a single all-NULL row.
                format!("coalesce({subquery}, [NULL])")
            } else {
                subquery
            };
            Ok(SqlFragment {
                expr: text,
                tables: rf.tables,
                result_type: expr.rtype.physical.clone(),
                is_array: true,
                alias: None,
            })
        } else {
            let item_ctx = ctx.with_focus(rf.expr.clone());
            let fields = self.lower_cols(cols, &item_ctx)?;
            Ok(SqlFragment {
                expr: format!("{{{fields}}}"),
                tables: rf.tables,
                result_type: expr.rtype.physical.clone(),
                is_array: false,
                alias: None,
            })
        }
    }

    /// Render `_col` / `_col_collection` projections as struct literal
    /// fields.
    fn lower_cols(&mut self, cols: &[TypedCol], item_ctx: &LowerCtx) -> Result<String> {
        let mut fields = Vec::with_capacity(cols.len());
        for col in cols {
            let frag = self.lower(&col.expr, item_ctx, LowerMode::Value)?;
            let value = if col.collection {
                if frag.is_array {
                    frag.expr
                } else {
                    format!("[{}]", frag.expr)
                }
            } else if frag.is_array {
                singleton_guard(&frag.expr, &col.name)
            } else {
                frag.expr
            };
            fields.push(format!("'{}': {}", col.name.replace('\'', "''"), value));
        }
        Ok(fields.join(", "))
    }

    fn lower_union_all(
        &mut self,
        expr: &TypedExpr,
        operands: &[TypedExpr],
        ctx: &LowerCtx,
    ) -> Result<SqlFragment> {
        let mut parts = Vec::with_capacity(operands.len());
        let mut table_sets = Vec::with_capacity(operands.len());
        for operand in operands {
            let frag = self.lower(operand, ctx, LowerMode::Value)?;
            // A NULL operand contributes no elements; other operands are
            // preserved.
            let realized = if frag.is_array {
                format!("coalesce({}, [])", frag.expr)
            } else {
                format!(
                    "CASE WHEN ({}) IS NULL THEN [] ELSE [{}] END",
                    frag.expr, frag.expr
                )
            };
            parts.push(realized);
            table_sets.push(frag.tables);
        }
        Ok(SqlFragment {
            expr: format!("array_concat({})", parts.join(", ")),
            tables: merge_tables(table_sets),
            result_type: expr.rtype.physical.clone(),
            is_array: true,
            alias: None,
        })
    }

    fn lower_split_path(
        &mut self,
        receiver: &TypedExpr,
        index: &TypedExpr,
        ctx: &LowerCtx,
        mode: LowerMode,
    ) -> Result<SqlFragment> {
        // _splitPath maps element-wise, so the receiver keeps the caller's
        // array treatment.
        let rf = self.lower(receiver, ctx, mode)?;
        let idx = self.lower(index, ctx, LowerMode::Value)?;

        let text = if rf.is_array {
            let var = self.aliases.next_lambda();
            format!(
                "list_transform({}, {} -> {})",
                rf.expr,
                var,
                split_index(&var, &idx.expr)
            )
        } else {
            split_index(&rf.expr, &idx.expr)
        };

        Ok(SqlFragment {
            expr: text,
            tables: merge_tables(vec![rf.tables, idx.tables]),
            result_type: DuckType::Varchar,
            is_array: rf.is_array,
            alias: None,
        })
    }

    fn lower_invoke(
        &mut self,
        receiver: &TypedExpr,
        function: &str,
        args: &[LiteralValue],
        ctx: &LowerCtx,
        mode: LowerMode,
    ) -> Result<SqlFragment> {
        // _invoke applies per element; the receiver keeps the caller's
        // array treatment.
        let rf = self.lower(receiver, ctx, mode)?;
        let literals: Vec<String> = args.iter().map(|a| a.to_sql()).collect();

        let call = |value: &str| {
            if literals.is_empty() {
                format!("{function}({value})")
            } else {
                format!("{function}({value}, {})", literals.join(", "))
            }
        };

        let text = if rf.is_array {
            let var = self.aliases.next_lambda();
            format!("list_transform({}, {} -> {})", rf.expr, var, call(&var))
        } else {
            call(&rf.expr)
        };

        Ok(SqlFragment {
            expr: text,
            tables: rf.tables,
            result_type: DuckType::Unknown,
            is_array: rf.is_array,
            alias: None,
        })
    }

    fn lower_binary(
        &mut self,
        op: BinaryOp,
        lhs: &TypedExpr,
        rhs: &TypedExpr,
        ctx: &LowerCtx,
    ) -> Result<SqlFragment> {
        let l = self.lower(lhs, ctx, LowerMode::Value)?;
        let r = self.lower(rhs, ctx, LowerMode::Value)?;

        let text = match op {
            BinaryOp::In => {
                if r.is_array {
                    format!("list_contains({}, {})", r.expr, l.expr)
                } else {
                    format!("({} = {})", l.expr, r.expr)
                }
            }
            _ => {
                let sql_op = match op {
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
                    BinaryOp::And => "AND",
                    BinaryOp::Or => "OR",
                    BinaryOp::In => unreachable!(),
                };
                format!("({} {} {})", l.expr, sql_op, r.expr)
            }
        };

        let result_type = match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                if l.result_type == DuckType::Decimal || r.result_type == DuckType::Decimal {
                    DuckType::Decimal
                } else {
                    DuckType::Integer
                }
            }
            _ => DuckType::Boolean,
        };

        Ok(SqlFragment {
            expr: text,
            tables: merge_tables(vec![l.tables, r.tables]),
            result_type,
            is_array: false,
            alias: None,
        })
    }
}

/// The singleton assertion emitted for `_col` and non-collection columns
/// whose value is still a list at query time.
pub fn singleton_guard(list_expr: &str, label: &str) -> String {
    let message = format!("multi-item collection in singleton column '{label}'").replace('\'', "''");
    format!(
        "CASE WHEN coalesce(len({list_expr}), 0) > 1 THEN error('{message}') \
         ELSE ({list_expr})[1] END"
    )
}

fn split_index(value: &str, index: &str) -> String {
    let parts = format!("string_split({value}, '/')");
    format!(
        "CASE WHEN ({index}) < 0 THEN {parts}[len({parts}) + ({index}) + 1] \
         ELSE {parts}[({index}) + 1] END"
    )
}

fn scalar(expr: String, result_type: DuckType) -> SqlFragment {
    SqlFragment {
        expr,
        tables: Vec::new(),
        result_type,
        is_array: false,
        alias: None,
    }
}

fn table_aliases(tables: &[LateralTable]) -> Vec<String> {
    tables.iter().map(|t| t.alias.clone()).collect()
}

/// Concatenate table lists preserving first-seen order and dropping
/// duplicate aliases.
fn merge_tables(sets: Vec<Vec<LateralTable>>) -> Vec<LateralTable> {
    let mut merged: Vec<LateralTable> = Vec::new();
    for set in sets {
        for table in set {
            if !merged.iter().any(|t| t.alias == table.alias) {
                merged.push(table);
            }
        }
    }
    merged
}
