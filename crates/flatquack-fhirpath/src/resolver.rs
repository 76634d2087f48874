//! Schema-driven resolution (stage 2).
//!
//! Walks the parsed AST threading a focus type, annotates every node with a
//! [`ResolvedType`], expands polymorphic choice access, checks function
//! signatures, and records every element path it touches for the reduced
//! input schema.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::ast::{BinaryOp, Expr, LiteralValue, UnaryOp};
use crate::schema::FhirSchema;
use crate::types::{Cardinality, DuckType, ResolvedType};
use crate::{FhirPathError, Result};

/// One element step on a root-relative path, used to rebuild the reduced
/// input schema.
#[derive(Debug, Clone, PartialEq)]
pub struct PathStep {
    /// Physical element name (`valueDecimal`, not `value`).
    pub name: String,

    /// FHIR type of the element.
    pub fhir_type: String,

    /// Whether the element repeats.
    pub collection: bool,
}

/// Accumulates the set of root-relative element paths a compilation reads.
#[derive(Debug, Default, Clone)]
pub struct TouchedPaths {
    root: BTreeMap<String, PathNode>,
}

/// A node in the touched-path tree.
#[derive(Debug, Clone)]
pub struct PathNode {
    pub fhir_type: String,
    pub collection: bool,
    pub children: BTreeMap<String, PathNode>,
}

impl TouchedPaths {
    /// Record a full root-relative path.
    pub fn record(&mut self, steps: &[PathStep]) {
        let mut level = &mut self.root;
        for step in steps {
            let node = level
                .entry(step.name.clone())
                .or_insert_with(|| PathNode {
                    fhir_type: step.fhir_type.clone(),
                    collection: step.collection,
                    children: BTreeMap::new(),
                });
            level = &mut node.children;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Top-level entries, in name order.
    pub fn roots(&self) -> &BTreeMap<String, PathNode> {
        &self.root
    }
}

/// The focus an expression is resolved against.
#[derive(Debug, Clone)]
pub struct ResolveFocus {
    /// FHIR type of the focus value.
    pub fhir_type: String,

    /// Cardinality of the focus itself.
    pub cardinality: Cardinality,

    /// Root-relative element path of the focus, when it still corresponds
    /// to a schema element chain.
    pub path: Option<Vec<PathStep>>,
}

impl ResolveFocus {
    /// A singleton focus rooted at a resource type.
    pub fn root(resource: impl Into<String>) -> Self {
        Self {
            fhir_type: resource.into(),
            cardinality: Cardinality::Singleton,
            path: Some(Vec::new()),
        }
    }
}

/// Built-in FHIRPath functions with fixed signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Exists,
    Empty,
    First,
    Single,
    Count,
    Join,
    Substring,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    Length,
    ToString,
    ToInteger,
}

impl Builtin {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "exists" => Builtin::Exists,
            "empty" => Builtin::Empty,
            "first" => Builtin::First,
            "single" => Builtin::Single,
            "count" => Builtin::Count,
            "join" => Builtin::Join,
            "substring" => Builtin::Substring,
            "startsWith" => Builtin::StartsWith,
            "endsWith" => Builtin::EndsWith,
            "contains" => Builtin::Contains,
            "matches" => Builtin::Matches,
            "length" => Builtin::Length,
            "toString" => Builtin::ToString,
            "toInteger" => Builtin::ToInteger,
            _ => return None,
        })
    }
}

/// A `_col` / `_col_collection` projection inside `_forEach`.
#[derive(Debug, Clone)]
pub struct TypedCol {
    pub name: String,
    pub expr: TypedExpr,
    pub collection: bool,
}

/// An AST node annotated with its resolved type.
#[derive(Debug, Clone)]
pub struct TypedExpr {
    pub kind: TypedExprKind,
    pub rtype: ResolvedType,
    pub offset: usize,

    /// Root-relative element path identity of the value, when preserved.
    pub path: Option<Vec<PathStep>>,
}

#[derive(Debug, Clone)]
pub enum TypedExprKind {
    Literal(LiteralValue),

    /// The focus value itself (`$this`, or a leading resource-type step).
    This,

    /// A user variable, already substituted with its scalar value.
    Variable { name: String, value: LiteralValue },

    /// An element access. `receiver: None` steps from the focus.
    Element {
        receiver: Option<Box<TypedExpr>>,
        name: String,
        /// Whether the element itself repeats (as opposed to the cumulative
        /// cardinality in `rtype`).
        collection: bool,
    },

    /// A bare choice-group access awaiting `ofType()`. Never survives
    /// resolution of a complete expression.
    ChoiceGroup {
        receiver: Option<Box<TypedExpr>>,
        parent_type: String,
        base: String,
        parent_path: Option<Vec<PathStep>>,
    },

    /// `getResourceKey()` on the view's root resource.
    ResourceKey,

    Index {
        receiver: Box<TypedExpr>,
        index: Box<TypedExpr>,
    },

    Where {
        receiver: Box<TypedExpr>,
        predicate: Box<TypedExpr>,
    },

    Builtin {
        func: Builtin,
        receiver: Box<TypedExpr>,
        args: Vec<TypedExpr>,
    },

    ForEach {
        receiver: Option<Box<TypedExpr>>,
        cols: Vec<TypedCol>,
        or_null: bool,
    },

    UnionAll {
        operands: Vec<TypedExpr>,
    },

    SplitPath {
        receiver: Box<TypedExpr>,
        index: Box<TypedExpr>,
    },

    Invoke {
        receiver: Box<TypedExpr>,
        function: String,
        args: Vec<LiteralValue>,
    },

    Binary {
        op: BinaryOp,
        lhs: Box<TypedExpr>,
        rhs: Box<TypedExpr>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<TypedExpr>,
    },
}

pub struct Resolver<'a> {
    schema: &'a FhirSchema,
    vars: &'a BTreeMap<String, Value>,
    touched: &'a mut TouchedPaths,
}

impl<'a> Resolver<'a> {
    pub fn new(
        schema: &'a FhirSchema,
        vars: &'a BTreeMap<String, Value>,
        touched: &'a mut TouchedPaths,
    ) -> Self {
        Self {
            schema,
            vars,
            touched,
        }
    }

    /// Resolve a complete expression. The result is guaranteed not to be a
    /// dangling choice-group access.
    pub fn resolve_expression(&mut self, expr: &Expr, focus: &ResolveFocus) -> Result<TypedExpr> {
        let typed = self.resolve(expr, focus)?;
        self.require_concrete(&typed)?;
        Ok(typed)
    }

    fn resolve(&mut self, expr: &Expr, focus: &ResolveFocus) -> Result<TypedExpr> {
        match expr {
            Expr::Literal { value, offset } => Ok(literal_node(value.clone(), *offset)),

            Expr::This { offset } => Ok(self.focus_node(focus, *offset)),

            Expr::Identifier { name, offset } => {
                // A leading step naming the focus type itself (e.g. the
                // `Patient` in `Patient.name.family`) anchors at the focus.
                if *name == focus.fhir_type
                    && name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
                {
                    return Ok(self.focus_node(focus, *offset));
                }
                self.element_step(
                    None,
                    &focus.fhir_type,
                    focus.cardinality,
                    focus.path.clone(),
                    name,
                    *offset,
                )
            }

            Expr::Variable { name, offset } => self.resolve_variable(name, *offset),

            Expr::Path {
                receiver,
                name,
                offset,
            } => {
                let r = self.resolve(receiver, focus)?;
                self.require_concrete(&r)?;
                let parent_type = r.rtype.fhir_type.clone();
                let parent_card = r.rtype.cardinality;
                let parent_path = r.path.clone();
                self.element_step(
                    Some(Box::new(r)),
                    &parent_type,
                    parent_card,
                    parent_path,
                    name,
                    *offset,
                )
            }

            Expr::Index {
                receiver,
                index,
                offset,
            } => self.resolve_index(receiver, index, focus, *offset),

            Expr::Invocation {
                receiver,
                name,
                args,
                offset,
            } => self.resolve_invocation(receiver.as_deref(), name, args, focus, *offset),

            Expr::Binary {
                op,
                lhs,
                rhs,
                offset,
            } => self.resolve_binary(*op, lhs, rhs, focus, *offset),

            Expr::Unary {
                op,
                operand,
                offset,
            } => self.resolve_unary(*op, operand, focus, *offset),
        }
    }

    fn focus_node(&self, focus: &ResolveFocus, offset: usize) -> TypedExpr {
        TypedExpr {
            kind: TypedExprKind::This,
            rtype: ResolvedType {
                fhir_type: focus.fhir_type.clone(),
                cardinality: focus.cardinality,
                physical: DuckType::from_fhir_type(&focus.fhir_type),
                nullable: true,
            },
            offset,
            path: focus.path.clone(),
        }
    }

    fn resolve_variable(&mut self, name: &str, offset: usize) -> Result<TypedExpr> {
        let Some(value) = self.vars.get(name) else {
            return Err(FhirPathError::UnknownElement {
                element: format!("%{name}"),
                parent: "user variables".to_string(),
                offset,
            });
        };
        let literal = match value {
            Value::String(s) => LiteralValue::String(s.clone()),
            Value::Bool(b) => LiteralValue::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    LiteralValue::Integer(i)
                } else {
                    LiteralValue::Decimal(n.to_string())
                }
            }
            Value::Null => LiteralValue::Null,
            _ => {
                return Err(FhirPathError::UnsupportedFeature {
                    message: format!("variable '%{name}' must be a scalar value"),
                });
            }
        };
        let mut node = literal_node(literal.clone(), offset);
        node.kind = TypedExprKind::Variable {
            name: name.to_string(),
            value: literal,
        };
        Ok(node)
    }

    fn element_step(
        &mut self,
        receiver: Option<Box<TypedExpr>>,
        parent_type: &str,
        parent_card: Cardinality,
        parent_path: Option<Vec<PathStep>>,
        name: &str,
        offset: usize,
    ) -> Result<TypedExpr> {
        if let Some(def) = self.schema.element(parent_type, name) {
            if def.is_choice() {
                return Ok(TypedExpr {
                    kind: TypedExprKind::ChoiceGroup {
                        receiver,
                        parent_type: parent_type.to_string(),
                        base: name.to_string(),
                        parent_path,
                    },
                    rtype: ResolvedType {
                        fhir_type: String::new(),
                        cardinality: parent_card.step(def.is_collection()),
                        physical: DuckType::Unknown,
                        nullable: true,
                    },
                    offset,
                    path: None,
                });
            }

            let fhir_type = def.types[0].clone();
            let collection = def.is_collection();
            return Ok(self.make_element(
                receiver,
                parent_card,
                parent_path,
                name,
                &fhir_type,
                collection,
                offset,
            ));
        }

        if let Some(expansion) = self.schema.match_choice_access(parent_type, name) {
            return Ok(self.make_element(
                receiver,
                parent_card,
                parent_path,
                &expansion.physical_name,
                &expansion.fhir_type,
                expansion.collection,
                offset,
            ));
        }

        if let Some(base) = self.schema.choice_base_of(parent_type, name) {
            return Err(FhirPathError::InvalidChoice {
                message: format!(
                    "'{name}' does not match any type choice of '{base}' on {parent_type}"
                ),
                offset,
            });
        }

        Err(FhirPathError::UnknownElement {
            element: name.to_string(),
            parent: parent_type.to_string(),
            offset,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn make_element(
        &mut self,
        receiver: Option<Box<TypedExpr>>,
        parent_card: Cardinality,
        parent_path: Option<Vec<PathStep>>,
        physical_name: &str,
        fhir_type: &str,
        collection: bool,
        offset: usize,
    ) -> TypedExpr {
        let path = parent_path.map(|mut steps| {
            steps.push(PathStep {
                name: physical_name.to_string(),
                fhir_type: fhir_type.to_string(),
                collection,
            });
            steps
        });
        if let Some(steps) = &path {
            self.touched.record(steps);
        }
        TypedExpr {
            kind: TypedExprKind::Element {
                receiver,
                name: physical_name.to_string(),
                collection,
            },
            rtype: ResolvedType {
                fhir_type: fhir_type.to_string(),
                cardinality: parent_card.step(collection),
                physical: DuckType::from_fhir_type(fhir_type),
                nullable: true,
            },
            offset,
            path,
        }
    }

    fn resolve_index(
        &mut self,
        receiver: &Expr,
        index: &Expr,
        focus: &ResolveFocus,
        offset: usize,
    ) -> Result<TypedExpr> {
        let r = self.resolve(receiver, focus)?;
        self.require_concrete(&r)?;
        if !r.rtype.is_collection() {
            return Err(FhirPathError::CardinalityMismatch {
                message: "indexing requires a collection receiver".to_string(),
                offset,
            });
        }
        let idx = self.resolve(index, focus)?;
        self.require_concrete(&idx)?;
        self.require_integer(&idx, "index")?;

        let rtype = ResolvedType::singleton(r.rtype.fhir_type.clone(), r.rtype.physical.clone());
        let path = r.path.clone();
        Ok(TypedExpr {
            kind: TypedExprKind::Index {
                receiver: Box::new(r),
                index: Box::new(idx),
            },
            rtype,
            offset,
            path,
        })
    }

    fn resolve_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        focus: &ResolveFocus,
        offset: usize,
    ) -> Result<TypedExpr> {
        let l = self.resolve(lhs, focus)?;
        self.require_concrete(&l)?;
        let r = self.resolve(rhs, focus)?;
        self.require_concrete(&r)?;

        self.require_singleton(&l, op.symbol(), offset)?;
        if op != BinaryOp::In {
            self.require_singleton(&r, op.symbol(), offset)?;
        }

        let rtype = match op {
            BinaryOp::And | BinaryOp::Or => {
                self.require_boolean(&l, op.symbol())?;
                self.require_boolean(&r, op.symbol())?;
                ResolvedType::singleton("boolean", DuckType::Boolean)
            }
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Lt
            | BinaryOp::Gt
            | BinaryOp::LtEq
            | BinaryOp::GtEq
            | BinaryOp::In => ResolvedType::singleton("boolean", DuckType::Boolean),
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                self.require_numeric(&l, op.symbol())?;
                self.require_numeric(&r, op.symbol())?;
                if l.rtype.physical == DuckType::Decimal || r.rtype.physical == DuckType::Decimal {
                    ResolvedType::singleton("decimal", DuckType::Decimal)
                } else {
                    ResolvedType::singleton("integer", DuckType::Integer)
                }
            }
        };

        Ok(TypedExpr {
            kind: TypedExprKind::Binary {
                op,
                lhs: Box::new(l),
                rhs: Box::new(r),
            },
            rtype,
            offset,
            path: None,
        })
    }

    fn resolve_unary(
        &mut self,
        op: UnaryOp,
        operand: &Expr,
        focus: &ResolveFocus,
        offset: usize,
    ) -> Result<TypedExpr> {
        let inner = self.resolve(operand, focus)?;
        self.require_concrete(&inner)?;
        let rtype = match op {
            UnaryOp::Minus => {
                self.require_numeric(&inner, "-")?;
                ResolvedType::singleton(inner.rtype.fhir_type.clone(), inner.rtype.physical.clone())
            }
            UnaryOp::Not => {
                self.require_boolean(&inner, "not")?;
                ResolvedType::singleton("boolean", DuckType::Boolean)
            }
        };
        Ok(TypedExpr {
            kind: TypedExprKind::Unary {
                op,
                operand: Box::new(inner),
            },
            rtype,
            offset,
            path: None,
        })
    }

    fn resolve_invocation(
        &mut self,
        receiver: Option<&Expr>,
        name: &str,
        args: &[Expr],
        focus: &ResolveFocus,
        offset: usize,
    ) -> Result<TypedExpr> {
        match name {
            "where" => self.resolve_where(receiver, args, focus, offset),
            "ofType" => self.resolve_of_type(receiver, args, focus, offset),
            "getResourceKey" => {
                if receiver.is_some() || !args.is_empty() {
                    return Err(FhirPathError::UnsupportedFeature {
                        message: "getResourceKey() takes no receiver and no arguments"
                            .to_string(),
                    });
                }
                self.touched.record(&[PathStep {
                    name: "id".to_string(),
                    fhir_type: "id".to_string(),
                    collection: false,
                }]);
                Ok(TypedExpr {
                    kind: TypedExprKind::ResourceKey,
                    rtype: ResolvedType::singleton("string", DuckType::Varchar),
                    offset,
                    path: None,
                })
            }
            "_forEach" => self.resolve_for_each(receiver, args, focus, offset, false),
            "_forEachOrNull" => self.resolve_for_each(receiver, args, focus, offset, true),
            "_col" | "_col_collection" => Err(FhirPathError::UnsupportedFeature {
                message: format!("{name}() is only valid as an argument of _forEach"),
            }),
            "_unionAll" => self.resolve_union_all(receiver, args, focus, offset),
            "_splitPath" => self.resolve_split_path(receiver, args, focus, offset),
            "_invoke" => self.resolve_invoke(receiver, args, focus, offset),
            _ => {
                if let Some(func) = Builtin::from_name(name) {
                    self.resolve_builtin(func, name, receiver, args, focus, offset)
                } else {
                    Err(FhirPathError::UnsupportedFeature {
                        message: format!("unknown function '{name}'"),
                    })
                }
            }
        }
    }

    fn resolve_where(
        &mut self,
        receiver: Option<&Expr>,
        args: &[Expr],
        focus: &ResolveFocus,
        offset: usize,
    ) -> Result<TypedExpr> {
        let receiver = self.required_receiver(receiver, "where", focus, offset)?;
        if args.len() != 1 {
            return Err(FhirPathError::parse(
                "where() takes exactly one argument",
                offset,
            ));
        }
        let element_focus = ResolveFocus {
            fhir_type: receiver.rtype.fhir_type.clone(),
            cardinality: Cardinality::Singleton,
            path: receiver.path.clone(),
        };
        let predicate = self.resolve(&args[0], &element_focus)?;
        self.require_concrete(&predicate)?;
        let boolean_like = matches!(
            predicate.rtype.physical,
            DuckType::Boolean | DuckType::Unknown
        );
        if predicate.rtype.is_collection() || !boolean_like {
            return Err(FhirPathError::CardinalityMismatch {
                message: "where() predicate must be a singleton boolean".to_string(),
                offset: predicate.offset,
            });
        }
        let rtype = receiver.rtype.clone();
        let path = receiver.path.clone();
        Ok(TypedExpr {
            kind: TypedExprKind::Where {
                receiver: Box::new(receiver),
                predicate: Box::new(predicate),
            },
            rtype,
            offset,
            path,
        })
    }

    fn resolve_of_type(
        &mut self,
        receiver: Option<&Expr>,
        args: &[Expr],
        focus: &ResolveFocus,
        offset: usize,
    ) -> Result<TypedExpr> {
        let Some(receiver) = receiver else {
            return Err(FhirPathError::UnsupportedFeature {
                message: "ofType() requires a receiver".to_string(),
            });
        };
        let [arg] = args else {
            return Err(FhirPathError::parse(
                "ofType() takes exactly one type argument",
                offset,
            ));
        };
        let Expr::Identifier { name: type_name, .. } = arg else {
            return Err(FhirPathError::parse(
                "ofType() argument must be a type name",
                arg.offset(),
            ));
        };

        let r = self.resolve(receiver, focus)?;
        match r.kind {
            TypedExprKind::ChoiceGroup {
                receiver: inner,
                parent_type,
                base,
                parent_path,
            } => {
                let expansion = self
                    .schema
                    .resolve_choice(&parent_type, &base)
                    .into_iter()
                    .find(|e| e.fhir_type == *type_name);
                let Some(expansion) = expansion else {
                    return Err(FhirPathError::InvalidChoice {
                        message: format!(
                            "'{type_name}' is not a type choice of '{base}' on {parent_type}"
                        ),
                        offset,
                    });
                };
                // Cardinality of the group access was computed when the
                // group was stepped into; reuse it via the parent card the
                // expansion carries.
                let parent_card = r.rtype.cardinality;
                let mut node = self.make_element(
                    inner,
                    Cardinality::Singleton,
                    parent_path,
                    &expansion.physical_name,
                    &expansion.fhir_type,
                    expansion.collection,
                    offset,
                );
                node.rtype.cardinality = parent_card;
                Ok(node)
            }
            _ => {
                if r.rtype.fhir_type == *type_name {
                    Ok(r)
                } else {
                    Err(FhirPathError::InvalidChoice {
                        message: format!(
                            "ofType({type_name}) does not apply to a value of type {}",
                            r.rtype.fhir_type
                        ),
                        offset,
                    })
                }
            }
        }
    }

    fn resolve_builtin(
        &mut self,
        func: Builtin,
        name: &str,
        receiver: Option<&Expr>,
        args: &[Expr],
        focus: &ResolveFocus,
        offset: usize,
    ) -> Result<TypedExpr> {
        let receiver = self.required_receiver(receiver, name, focus, offset)?;

        let (min_args, max_args) = match func {
            Builtin::Join => (0, 1),
            Builtin::Substring => (1, 2),
            Builtin::StartsWith | Builtin::EndsWith | Builtin::Contains | Builtin::Matches => {
                (1, 1)
            }
            _ => (0, 0),
        };
        if args.len() < min_args || args.len() > max_args {
            return Err(FhirPathError::parse(
                format!("{name}() takes {min_args}..{max_args} arguments"),
                offset,
            ));
        }

        let mut typed_args = Vec::with_capacity(args.len());
        for arg in args {
            let typed = self.resolve(arg, focus)?;
            self.require_concrete(&typed)?;
            self.require_singleton(&typed, name, typed.offset)?;
            typed_args.push(typed);
        }

        // String functions operate on a singleton string receiver.
        let string_receiver = matches!(
            func,
            Builtin::Substring
                | Builtin::StartsWith
                | Builtin::EndsWith
                | Builtin::Contains
                | Builtin::Matches
                | Builtin::Length
        );
        if string_receiver {
            self.require_singleton(&receiver, name, offset)?;
            self.require_string(&receiver, name)?;
        }
        match func {
            Builtin::ToString | Builtin::ToInteger => {
                self.require_singleton(&receiver, name, offset)?;
            }
            Builtin::Join => {
                self.require_string(&receiver, name)?;
                if let Some(sep) = typed_args.first() {
                    self.require_string(sep, name)?;
                }
            }
            _ => {}
        }

        let rtype = match func {
            Builtin::Exists | Builtin::Empty => {
                ResolvedType::singleton("boolean", DuckType::Boolean)
            }
            Builtin::Count | Builtin::Length | Builtin::ToInteger => {
                ResolvedType::singleton("integer", DuckType::Integer)
            }
            Builtin::First | Builtin::Single => ResolvedType::singleton(
                receiver.rtype.fhir_type.clone(),
                receiver.rtype.physical.clone(),
            ),
            Builtin::Join | Builtin::Substring | Builtin::ToString => {
                ResolvedType::singleton("string", DuckType::Varchar)
            }
            Builtin::StartsWith | Builtin::EndsWith | Builtin::Contains | Builtin::Matches => {
                ResolvedType::singleton("boolean", DuckType::Boolean)
            }
        };

        // first()/single() keep the element identity of their receiver.
        let path = match func {
            Builtin::First | Builtin::Single => receiver.path.clone(),
            _ => None,
        };

        Ok(TypedExpr {
            kind: TypedExprKind::Builtin {
                func,
                receiver: Box::new(receiver),
                args: typed_args,
            },
            rtype,
            offset,
            path,
        })
    }

    fn resolve_for_each(
        &mut self,
        receiver: Option<&Expr>,
        args: &[Expr],
        focus: &ResolveFocus,
        offset: usize,
        or_null: bool,
    ) -> Result<TypedExpr> {
        let name = if or_null { "_forEachOrNull" } else { "_forEach" };
        if args.is_empty() {
            return Err(FhirPathError::parse(
                format!("{name}() requires at least one column"),
                offset,
            ));
        }

        let receiver = match receiver {
            Some(expr) => {
                let r = self.resolve(expr, focus)?;
                self.require_concrete(&r)?;
                Some(r)
            }
            None => None,
        };

        let element_focus = match &receiver {
            Some(r) => ResolveFocus {
                fhir_type: r.rtype.fhir_type.clone(),
                cardinality: Cardinality::Singleton,
                path: r.path.clone(),
            },
            None => ResolveFocus {
                fhir_type: focus.fhir_type.clone(),
                cardinality: Cardinality::Singleton,
                path: focus.path.clone(),
            },
        };

        let mut cols: Vec<TypedCol> = Vec::with_capacity(args.len());
        for arg in args {
            let Expr::Invocation {
                receiver: col_receiver,
                name: col_name,
                args: col_args,
                offset: col_offset,
            } = arg
            else {
                return Err(FhirPathError::UnsupportedFeature {
                    message: format!(
                        "{name}() arguments must be _col(...) or _col_collection(...)"
                    ),
                });
            };
            let collection = match col_name.as_str() {
                "_col" => false,
                "_col_collection" => true,
                _ => {
                    return Err(FhirPathError::UnsupportedFeature {
                        message: format!(
                            "{name}() arguments must be _col(...) or _col_collection(...)"
                        ),
                    });
                }
            };
            if col_receiver.is_some() {
                return Err(FhirPathError::UnsupportedFeature {
                    message: format!("{col_name}() does not take a receiver"),
                });
            }
            let [name_arg, value_arg] = col_args.as_slice() else {
                return Err(FhirPathError::parse(
                    format!("{col_name}() takes a name and an expression"),
                    *col_offset,
                ));
            };
            let Expr::Literal {
                value: LiteralValue::String(field_name),
                ..
            } = name_arg
            else {
                return Err(FhirPathError::UnsupportedFeature {
                    message: format!("the first argument of {col_name}() must be a string literal"),
                });
            };
            if cols.iter().any(|c| c.name == *field_name) {
                return Err(FhirPathError::UnsupportedFeature {
                    message: format!("duplicate column name '{field_name}' in {name}()"),
                });
            }
            let value = self.resolve(value_arg, &element_focus)?;
            self.require_concrete(&value)?;
            cols.push(TypedCol {
                name: field_name.clone(),
                expr: value,
                collection,
            });
        }

        let mut fields = BTreeMap::new();
        for col in &cols {
            let physical = if col.collection || col.expr.rtype.is_collection() {
                DuckType::List(Box::new(col.expr.rtype.physical.clone()))
            } else {
                col.expr.rtype.physical.clone()
            };
            fields.insert(col.name.clone(), physical);
        }

        let cardinality = match &receiver {
            Some(r) => r.rtype.cardinality,
            None => focus.cardinality,
        };

        Ok(TypedExpr {
            kind: TypedExprKind::ForEach {
                receiver: receiver.map(Box::new),
                cols,
                or_null,
            },
            rtype: ResolvedType {
                fhir_type: String::new(),
                cardinality,
                physical: DuckType::Struct(fields),
                nullable: true,
            },
            offset,
            path: None,
        })
    }

    fn resolve_union_all(
        &mut self,
        receiver: Option<&Expr>,
        args: &[Expr],
        focus: &ResolveFocus,
        offset: usize,
    ) -> Result<TypedExpr> {
        if receiver.is_some() {
            return Err(FhirPathError::UnsupportedFeature {
                message: "_unionAll() does not take a receiver".to_string(),
            });
        }
        if args.len() < 2 {
            return Err(FhirPathError::parse(
                "_unionAll() requires at least two operands",
                offset,
            ));
        }

        let mut operands = Vec::with_capacity(args.len());
        for arg in args {
            let typed = self.resolve(arg, focus)?;
            self.require_concrete(&typed)?;
            operands.push(typed);
        }

        let first = &operands[0];
        for other in &operands[1..] {
            let compatible = first.rtype.fhir_type == other.rtype.fhir_type
                || first.rtype.physical == other.rtype.physical
                || first.rtype.physical == DuckType::Unknown
                || other.rtype.physical == DuckType::Unknown;
            if !compatible {
                return Err(FhirPathError::UnsupportedFeature {
                    message: format!(
                        "_unionAll() operands must share a type ({} vs {})",
                        first.rtype.fhir_type, other.rtype.fhir_type
                    ),
                });
            }
        }

        let rtype =
            ResolvedType::collection(first.rtype.fhir_type.clone(), first.rtype.physical.clone());
        Ok(TypedExpr {
            kind: TypedExprKind::UnionAll { operands },
            rtype,
            offset,
            path: None,
        })
    }

    fn resolve_split_path(
        &mut self,
        receiver: Option<&Expr>,
        args: &[Expr],
        focus: &ResolveFocus,
        offset: usize,
    ) -> Result<TypedExpr> {
        let receiver = self.required_receiver(receiver, "_splitPath", focus, offset)?;
        self.require_string(&receiver, "_splitPath")?;
        let [index] = args else {
            return Err(FhirPathError::parse(
                "_splitPath() takes exactly one index argument",
                offset,
            ));
        };
        let idx = self.resolve(index, focus)?;
        self.require_concrete(&idx)?;
        self.require_integer(&idx, "_splitPath")?;

        let rtype = ResolvedType {
            fhir_type: "string".to_string(),
            cardinality: receiver.rtype.cardinality,
            physical: DuckType::Varchar,
            nullable: true,
        };
        Ok(TypedExpr {
            kind: TypedExprKind::SplitPath {
                receiver: Box::new(receiver),
                index: Box::new(idx),
            },
            rtype,
            offset,
            path: None,
        })
    }

    fn resolve_invoke(
        &mut self,
        receiver: Option<&Expr>,
        args: &[Expr],
        focus: &ResolveFocus,
        offset: usize,
    ) -> Result<TypedExpr> {
        let receiver = self.required_receiver(receiver, "_invoke", focus, offset)?;
        let Some((name_arg, rest)) = args.split_first() else {
            return Err(FhirPathError::parse(
                "_invoke() requires a function name",
                offset,
            ));
        };
        let Some(LiteralValue::String(function)) = literal_of(name_arg) else {
            return Err(FhirPathError::UnsupportedFeature {
                message: "the first argument of _invoke() must be a string literal".to_string(),
            });
        };
        if !is_sql_identifier(&function) {
            return Err(FhirPathError::UnsupportedFeature {
                message: format!("'{function}' is not a valid function name"),
            });
        }

        let mut literals = Vec::with_capacity(rest.len());
        for arg in rest {
            match literal_of(arg) {
                Some(value @ (LiteralValue::String(_)
                | LiteralValue::Integer(_)
                | LiteralValue::Decimal(_)
                | LiteralValue::Boolean(_))) => literals.push(value),
                _ => {
                    return Err(FhirPathError::InvokeParamNotLiteral {
                        offset: arg.offset(),
                    });
                }
            }
        }

        let rtype = ResolvedType {
            fhir_type: "unknown".to_string(),
            cardinality: receiver.rtype.cardinality,
            physical: DuckType::Unknown,
            nullable: true,
        };
        Ok(TypedExpr {
            kind: TypedExprKind::Invoke {
                receiver: Box::new(receiver),
                function,
                args: literals,
            },
            rtype,
            offset,
            path: None,
        })
    }

    fn required_receiver(
        &mut self,
        receiver: Option<&Expr>,
        name: &str,
        focus: &ResolveFocus,
        offset: usize,
    ) -> Result<TypedExpr> {
        let Some(receiver) = receiver else {
            return Err(FhirPathError::parse(
                format!("{name}() requires a receiver expression"),
                offset,
            ));
        };
        let typed = self.resolve(receiver, focus)?;
        self.require_concrete(&typed)?;
        Ok(typed)
    }

    fn require_concrete(&self, expr: &TypedExpr) -> Result<()> {
        if let TypedExprKind::ChoiceGroup {
            parent_type, base, ..
        } = &expr.kind
        {
            return Err(FhirPathError::InvalidChoice {
                message: format!(
                    "choice element '{base}' on {parent_type} must be accessed \
                     via ofType() or a typed name (e.g. {base}String)"
                ),
                offset: expr.offset,
            });
        }
        Ok(())
    }

    fn require_singleton(&self, expr: &TypedExpr, context: &str, offset: usize) -> Result<()> {
        if expr.rtype.is_collection() {
            return Err(FhirPathError::CardinalityMismatch {
                message: format!("'{context}' requires a singleton operand"),
                offset,
            });
        }
        Ok(())
    }

    fn require_boolean(&self, expr: &TypedExpr, context: &str) -> Result<()> {
        match expr.rtype.physical {
            DuckType::Boolean | DuckType::Unknown => Ok(()),
            _ => Err(FhirPathError::CardinalityMismatch {
                message: format!(
                    "'{context}' requires boolean operands, found {}",
                    expr.rtype.fhir_type
                ),
                offset: expr.offset,
            }),
        }
    }

    fn require_numeric(&self, expr: &TypedExpr, context: &str) -> Result<()> {
        match expr.rtype.physical {
            DuckType::Integer | DuckType::BigInt | DuckType::Decimal | DuckType::Unknown => Ok(()),
            _ => Err(FhirPathError::UnsupportedFeature {
                message: format!(
                    "operator '{context}' requires numeric operands, found {}",
                    expr.rtype.fhir_type
                ),
            }),
        }
    }

    fn require_integer(&self, expr: &TypedExpr, context: &str) -> Result<()> {
        match expr.rtype.physical {
            DuckType::Integer | DuckType::BigInt | DuckType::Unknown => Ok(()),
            _ => Err(FhirPathError::CardinalityMismatch {
                message: format!("'{context}' requires an integer, found {}", expr.rtype.fhir_type),
                offset: expr.offset,
            }),
        }
    }

    fn require_string(&self, expr: &TypedExpr, context: &str) -> Result<()> {
        match expr.rtype.physical {
            DuckType::Varchar | DuckType::Unknown => Ok(()),
            _ => Err(FhirPathError::CardinalityMismatch {
                message: format!(
                    "'{context}' requires a string value, found {}",
                    expr.rtype.fhir_type
                ),
                offset: expr.offset,
            }),
        }
    }
}

fn literal_node(value: LiteralValue, offset: usize) -> TypedExpr {
    let (fhir_type, physical, nullable) = match &value {
        LiteralValue::String(_) => ("string", DuckType::Varchar, false),
        LiteralValue::Integer(_) => ("integer", DuckType::Integer, false),
        LiteralValue::Decimal(_) => ("decimal", DuckType::Decimal, false),
        LiteralValue::Boolean(_) => ("boolean", DuckType::Boolean, false),
        LiteralValue::Null => ("null", DuckType::Unknown, true),
    };
    TypedExpr {
        kind: TypedExprKind::Literal(value),
        rtype: ResolvedType {
            fhir_type: fhir_type.to_string(),
            cardinality: Cardinality::Singleton,
            physical,
            nullable,
        },
        offset,
        path: None,
    }
}

/// Extract a literal value, folding a leading unary minus into the number.
fn literal_of(expr: &Expr) -> Option<LiteralValue> {
    match expr {
        Expr::Literal { value, .. } => Some(value.clone()),
        Expr::Unary {
            op: UnaryOp::Minus,
            operand,
            ..
        } => match literal_of(operand)? {
            LiteralValue::Integer(i) => Some(LiteralValue::Integer(-i)),
            LiteralValue::Decimal(lexeme) => Some(LiteralValue::Decimal(format!("-{lexeme}"))),
            _ => None,
        },
        _ => None,
    }
}

fn is_sql_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
