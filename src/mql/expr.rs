use crate::value::{Document, Value};

/// An aggregation expression, as embedded in `$project`, `$group` and `$expr`.
#[derive(Debug, Clone, PartialEq)]
pub enum AggExpr {
    /// A constant. Strings starting with `$` render through `$literal`.
    Literal(Value),

    /// Field path of the current document: `'$a.b'`
    Field(String),

    /// Variable reference: `'$$x'` or `'$$x.a.b'`
    Var { name: String, path: Option<String> },

    /// Operator with positional arguments: `{ $add : [a, b] }`
    Op { name: String, args: Vec<AggExpr> },

    /// Operator with a single unbracketed argument: `{ $size : a }`
    Unary { name: String, arg: Box<AggExpr> },

    /// Operator with named arguments: `{ $map : { input : a, as : 'x', in : b } }`
    Named { name: String, args: Vec<(String, AggExpr)> },

    /// Computed document
    Document(Vec<(String, AggExpr)>),

    Array(Vec<AggExpr>),
}

impl AggExpr {
    pub fn literal(value: impl Into<Value>) -> AggExpr {
        AggExpr::Literal(value.into())
    }

    pub fn field(path: impl Into<String>) -> AggExpr {
        AggExpr::Field(path.into())
    }

    pub fn var(name: impl Into<String>) -> AggExpr {
        AggExpr::Var { name: name.into(), path: None }
    }

    pub fn root() -> AggExpr {
        AggExpr::var("ROOT")
    }

    pub fn op(name: &str, args: Vec<AggExpr>) -> AggExpr {
        AggExpr::Op { name: name.to_string(), args }
    }

    pub fn unary(name: &str, arg: AggExpr) -> AggExpr {
        AggExpr::Unary { name: name.to_string(), arg: Box::new(arg) }
    }

    pub fn named(name: &str, args: Vec<(&str, AggExpr)>) -> AggExpr {
        AggExpr::Named {
            name: name.to_string(),
            args: args.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            AggExpr::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Extend a field or variable path with `element`.
    ///
    /// Returns `None` for computed expressions, which need a `$let` or
    /// `$getField` to reach into.
    pub fn extend_path(&self, element: &str) -> Option<AggExpr> {
        match self {
            AggExpr::Field(path) => Some(AggExpr::Field(join_path(path, element))),
            AggExpr::Var { name, path: None } if name == "ROOT" || name == "CURRENT" => {
                Some(AggExpr::Field(element.to_string()))
            }
            AggExpr::Var { name, path } => Some(AggExpr::Var {
                name: name.clone(),
                path: Some(match path {
                    Some(p) => join_path(p, element),
                    None => element.to_string(),
                }),
            }),
            _ => None,
        }
    }

    /// Apply `f` to every direct child.
    pub fn map_children(&self, f: &mut impl FnMut(&AggExpr) -> AggExpr) -> AggExpr {
        match self {
            AggExpr::Literal(_) | AggExpr::Field(_) | AggExpr::Var { .. } => self.clone(),
            AggExpr::Op { name, args } => AggExpr::Op {
                name: name.clone(),
                args: args.iter().map(&mut *f).collect(),
            },
            AggExpr::Unary { name, arg } => AggExpr::Unary { name: name.clone(), arg: Box::new(f(arg)) },
            AggExpr::Named { name, args } => AggExpr::Named {
                name: name.clone(),
                args: args.iter().map(|(k, v)| (k.clone(), f(v))).collect(),
            },
            AggExpr::Document(fields) => {
                AggExpr::Document(fields.iter().map(|(k, v)| (k.clone(), f(v))).collect())
            }
            AggExpr::Array(items) => AggExpr::Array(items.iter().map(&mut *f).collect()),
        }
    }

    pub fn children(&self) -> Vec<&AggExpr> {
        match self {
            AggExpr::Literal(_) | AggExpr::Field(_) | AggExpr::Var { .. } => Vec::new(),
            AggExpr::Op { args, .. } | AggExpr::Array(args) => args.iter().collect(),
            AggExpr::Unary { arg, .. } => vec![arg],
            AggExpr::Named { args, .. } | AggExpr::Document(args) => args.iter().map(|(_, v)| v).collect(),
        }
    }

    /// True when any node satisfies `predicate`.
    pub fn any(&self, predicate: &impl Fn(&AggExpr) -> bool) -> bool {
        predicate(self) || self.children().into_iter().any(|c| c.any(predicate))
    }

    /// Top-level field names this expression reads (`'$a.b'` reads `a`).
    pub fn referenced_fields(&self, out: &mut Vec<String>) {
        match self {
            AggExpr::Field(path) => {
                let head = path.split('.').next().unwrap_or(path).to_string();
                if !out.contains(&head) {
                    out.push(head);
                }
            }
            other => {
                for child in other.children() {
                    child.referenced_fields(out);
                }
            }
        }
    }

    /// True when the expression reads the whole current document.
    pub fn references_root(&self) -> bool {
        self.any(&|e| {
            matches!(e, AggExpr::Var { name, .. } if name == "ROOT" || name == "CURRENT")
        })
    }

    /// Replace field references through `f`; references it declines stay as they are.
    pub fn substitute_fields(&self, f: &impl Fn(&str) -> Option<AggExpr>) -> AggExpr {
        match self {
            AggExpr::Field(path) => f(path).unwrap_or_else(|| self.clone()),
            other => other.map_children(&mut |c| c.substitute_fields(f)),
        }
    }

    /// Replace references to variable `name` with `replacement`.
    ///
    /// Returns `None` when a dotted reference (`$$x.a`) cannot be expressed
    /// against `replacement`.
    pub fn substitute_var(&self, name: &str, replacement: &AggExpr) -> Option<AggExpr> {
        match self {
            AggExpr::Var { name: n, path } if n == name => match path {
                None => Some(replacement.clone()),
                Some(path) => replacement.extend_path(path),
            },
            AggExpr::Named { name: op, args } if binds_variable(op, args, name) => {
                // inner scope shadows the variable; only its input sees the outer binding
                let args = args
                    .iter()
                    .map(|(k, v)| {
                        if k == "input" || k == "initialValue" || k == "vars" {
                            v.substitute_var(name, replacement).map(|v| (k.clone(), v))
                        } else {
                            Some((k.clone(), v.clone()))
                        }
                    })
                    .collect::<Option<Vec<_>>>()?;
                Some(AggExpr::Named { name: op.clone(), args })
            }
            other => {
                let mut failed = false;
                let result = other.map_children(&mut |c| match c.substitute_var(name, replacement) {
                    Some(e) => e,
                    None => {
                        failed = true;
                        c.clone()
                    }
                });
                if failed { None } else { Some(result) }
            }
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            AggExpr::Literal(value) => match value {
                Value::String(s) if s.starts_with('$') => literal_document(value.clone()),
                Value::Document(_) | Value::Array(_) => literal_document(value.clone()),
                other => other.clone(),
            },
            AggExpr::Field(path) => Value::String(format!("${}", path)),
            AggExpr::Var { name, path: None } => Value::String(format!("$${}", name)),
            AggExpr::Var { name, path: Some(path) } => Value::String(format!("$${}.{}", name, path)),
            AggExpr::Op { name, args } => single(
                name,
                Value::Array(args.iter().map(AggExpr::to_value).collect()),
            ),
            AggExpr::Unary { name, arg } => single(name, arg.to_value()),
            AggExpr::Named { name, args } => single(
                name,
                Value::Document(args.iter().map(|(k, v)| (k.clone(), v.to_value())).collect()),
            ),
            AggExpr::Document(fields) => {
                Value::Document(fields.iter().map(|(k, v)| (k.clone(), v.to_value())).collect())
            }
            AggExpr::Array(items) => Value::Array(items.iter().map(AggExpr::to_value).collect()),
        }
    }
}

/// Variables `$map`, `$filter`, `$reduce` and `$let` bind for their body.
fn binds_variable(op: &str, args: &[(String, AggExpr)], name: &str) -> bool {
    match op {
        "$map" | "$filter" => args
            .iter()
            .any(|(k, v)| k == "as" && v.as_literal().and_then(Value::as_str) == Some(name)),
        "$reduce" => name == "value" || name == "this",
        "$let" => args.iter().any(|(k, v)| {
            k == "vars" && matches!(v, AggExpr::Document(vars) if vars.iter().any(|(n, _)| n == name))
        }),
        _ => false,
    }
}

fn literal_document(value: Value) -> Value {
    single("$literal", value)
}

fn single(key: &str, value: Value) -> Value {
    let mut doc = Document::new();
    doc.insert(key, value);
    Value::Document(doc)
}

pub(crate) fn join_path(base: &str, element: &str) -> String {
    if base.is_empty() {
        element.to_string()
    } else {
        format!("{}.{}", base, element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_operators() {
        let expr = AggExpr::op("$add", vec![AggExpr::field("A"), AggExpr::literal(1)]);
        assert_eq!(expr.to_value().to_string(), "{ $add : ['$A', 1] }");
        let size = AggExpr::unary("$size", AggExpr::field("Tags"));
        assert_eq!(size.to_value().to_string(), "{ $size : '$Tags' }");
    }

    #[test]
    fn dollar_strings_render_as_literals() {
        assert_eq!(AggExpr::literal("$x").to_value().to_string(), "{ $literal : '$x' }");
    }

    #[test]
    fn substitutes_variables_outside_shadowing_scopes() {
        let expr = AggExpr::op(
            "$gt",
            vec![AggExpr::Var { name: "x".into(), path: Some("Age".into()) }, AggExpr::literal(1)],
        );
        let substituted = expr.substitute_var("x", &AggExpr::root()).unwrap();
        assert_eq!(substituted.to_value().to_string(), "{ $gt : ['$Age', 1] }");
    }
}
