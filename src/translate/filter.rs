//! Predicates to `$match` filters.
//!
//! Each conjunct is translated declaratively when a field-level form exists
//! (`{ X : { $in : [1, 2, 3] } }`) and through `$expr` otherwise, when the
//! server supports it.

use super::{
    context::{Binding, Symbol, TranslationContext},
    expression::{anchored_pattern, literal_for, translate_expression},
    methods::regex_options,
};
use crate::{
    ast::{BinOp, Expr, UnaryOp},
    capabilities::Feature,
    error::{TranslationError, unsupported},
    mql::{AggExpr, FieldOp, Filter, expr::join_path},
    registry::DiscriminatorConvention,
    serializer::{DictionaryRepresentation, Serializer},
    transform::free_parameters,
    value::Value,
};

/// Translate a predicate body whose parameter is already in scope.
pub fn translate_filter(ctx: &mut TranslationContext<'_>, expr: &Expr) -> Result<Filter, TranslationError> {
    match filter(ctx, expr, true)? {
        Some(filter) => Ok(filter.simplify()),
        None => Err(unsupported(expr, "no filter form exists")),
    }
}

/// `None` when the predicate has no declarative form and `$expr` is not
/// allowed (inside `$elemMatch`).
fn filter(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    allow_expr: bool,
) -> Result<Option<Filter>, TranslationError> {
    match expr {
        Expr::Binary { op: op @ (BinOp::AndAlso | BinOp::OrElse), left, right } => {
            let (Some(left), Some(right)) = (filter(ctx, left, allow_expr)?, filter(ctx, right, allow_expr)?)
            else {
                return Ok(None);
            };
            Ok(Some(if *op == BinOp::AndAlso {
                Filter::And(vec![left, right])
            } else {
                Filter::Or(vec![left, right])
            }))
        }
        Expr::Unary { op: UnaryOp::Not, operand } => Ok(filter(ctx, operand, allow_expr)?.map(Filter::negate)),
        Expr::Constant(Value::Boolean(b)) => Ok(Some(if *b { Filter::True } else { Filter::False })),
        _ => {
            if let Some(filter) = declarative(ctx, expr)? {
                return Ok(Some(filter));
            }
            if !allow_expr {
                return Ok(None);
            }
            ctx.capabilities.require(Feature::ExprOperator)?;
            let translated = translate_expression(ctx, expr)?;
            Ok(Some(Filter::Expr(translated.ast)))
        }
    }
}

/// A field reachable by a dotted path from the filtered document.
struct FieldRef {
    path: String,
    serializer: Serializer,
    /// The path starts at an `$elemMatch` element
    element: bool,
}

impl FieldRef {
    /// Only element tests may address the tested value itself.
    fn is_addressable(&self) -> bool {
        !self.path.is_empty() || self.element
    }
}

fn field_ref(ctx: &TranslationContext<'_>, expr: &Expr) -> Result<Option<FieldRef>, TranslationError> {
    match expr {
        Expr::Parameter(name) => Ok(match ctx.lookup(name) {
            Some(Symbol { binding: Binding::Path(path), serializer, .. }) => Some(FieldRef {
                path: path.clone(),
                serializer: serializer.clone(),
                element: false,
            }),
            Some(Symbol { binding: Binding::Element, serializer, .. }) => Some(FieldRef {
                path: String::new(),
                serializer: serializer.clone(),
                element: true,
            }),
            _ => None,
        }),
        Expr::Member { target, name } => {
            let Some(base) = field_ref(ctx, target)? else {
                return Ok(None);
            };
            let derived = |path: String, serializer: Serializer| FieldRef {
                path,
                serializer,
                element: base.element,
            };
            if let Serializer::Nullable(inner) = &base.serializer {
                match name.as_str() {
                    "Value" => return Ok(Some(derived(base.path.clone(), (**inner).clone()))),
                    "HasValue" => return Ok(None),
                    _ => {}
                }
            }
            match (base.serializer.underlying(), name.as_str()) {
                (Serializer::String, "Length")
                | (Serializer::Array(_), "Count" | "Length")
                | (Serializer::DateTime, _)
                | (Serializer::Dictionary { .. }, _) => Ok(None),
                (Serializer::KeyValuePair { key, positional: true, .. }, "Key") => {
                    Ok(Some(derived(join_path(&base.path, "0"), (**key).clone())))
                }
                (Serializer::KeyValuePair { value, positional: true, .. }, "Value") => {
                    Ok(Some(derived(join_path(&base.path, "1"), (**value).clone())))
                }
                _ => match base.serializer.member(name) {
                    Some((element, serializer)) => Ok(Some(derived(join_path(&base.path, &element), serializer))),
                    None => Err(TranslationError::AmbiguousMember {
                        member: name.clone(),
                        type_name: base.serializer.describe(),
                    }),
                },
            }
        }
        Expr::Index { target, index } => {
            let Some(base) = field_ref(ctx, target)? else {
                return Ok(None);
            };
            let Some(key) = index.as_constant() else {
                return Ok(None);
            };
            let derived = |segment: String, serializer: Serializer| {
                Some(FieldRef {
                    path: join_path(&base.path, &segment),
                    serializer,
                    element: base.element,
                })
            };
            Ok(match (base.serializer.underlying(), key) {
                (Serializer::Array(item), position) => match position.as_i64() {
                    Some(n) if n >= 0 => derived(n.to_string(), (**item).clone()),
                    _ => None,
                },
                (
                    Serializer::Dictionary { representation: DictionaryRepresentation::Document, value, .. },
                    Value::String(name),
                ) => derived(name.clone(), (**value).clone()),
                (Serializer::Any, Value::String(name)) => derived(name.clone(), Serializer::Any),
                (Serializer::Any, position) => match position.as_i64() {
                    Some(n) if n >= 0 => derived(n.to_string(), Serializer::Any),
                    _ => None,
                },
                _ => None,
            })
        }
        _ => Ok(None),
    }
}

/// A field usable on the left of a field-level comparison.
fn scalar_field(ctx: &TranslationContext<'_>, expr: &Expr) -> Result<Option<FieldRef>, TranslationError> {
    Ok(field_ref(ctx, expr)?.filter(FieldRef::is_addressable))
}

/// An array-valued field: its path and the serializer of its items.
fn sequence_field(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
) -> Result<Option<(String, Serializer)>, TranslationError> {
    let Some(field) = scalar_field(ctx, expr)? else {
        return Ok(None);
    };
    Ok(match field.serializer.underlying() {
        Serializer::Grouping { element, .. } => Some((join_path(&field.path, "_elements"), (**element).clone())),
        Serializer::Dictionary { representation: DictionaryRepresentation::Document, .. } => None,
        Serializer::Array(_) | Serializer::Any | Serializer::Dictionary { .. } => {
            field.serializer.item().map(|item| (field.path, item))
        }
        _ => None,
    })
}

/// The constant as stored in a field with `serializer`.
fn stored(value: &Value, serializer: &Serializer) -> Result<Value, TranslationError> {
    Ok(match literal_for(value, serializer)?.ast {
        AggExpr::Literal(serialized) => serialized,
        _ => value.clone(),
    })
}

fn declarative(ctx: &mut TranslationContext<'_>, expr: &Expr) -> Result<Option<Filter>, TranslationError> {
    match expr {
        Expr::Binary { op, left, right } if op.is_comparison() => comparison(ctx, *op, left, right),
        Expr::StringEquals { left, right, ignore_case } => {
            let Some(field) = scalar_field(ctx, left)? else {
                return Ok(None);
            };
            let Some(Value::String(literal)) = right.as_constant() else {
                return Ok(None);
            };
            if !field.serializer.is_string() {
                return Ok(None);
            }
            let op = if *ignore_case {
                FieldOp::Regex {
                    pattern: anchored_pattern(literal),
                    options: "i".into(),
                }
            } else {
                FieldOp::Eq(Value::String(literal.clone()))
            };
            Ok(Some(Filter::field(field.path, op)))
        }
        Expr::Call { target: None, method, args, .. } => static_call(ctx, method, args),
        Expr::Call { target: Some(target), method, args, .. } => method_call(ctx, target, method, args),
        Expr::Member { target, name } if name == "HasValue" => {
            let Some(field) = scalar_field(ctx, target)? else {
                return Ok(None);
            };
            Ok(matches!(field.serializer, Serializer::Nullable(_))
                .then(|| Filter::field(field.path, FieldOp::Ne(Value::Null))))
        }
        Expr::TypeIs { operand, type_name } => {
            let Some(field) = field_ref(ctx, operand)? else {
                return Ok(None);
            };
            Ok(Some(type_filter(ctx, &field.path, type_name)))
        }
        _ => {
            let Some(field) = scalar_field(ctx, expr)? else {
                return Ok(None);
            };
            Ok((field.serializer.underlying() == &Serializer::Boolean)
                .then(|| Filter::field(field.path, FieldOp::Eq(Value::Boolean(true)))))
        }
    }
}

/// Discriminator test for documents under `base`.
pub fn type_filter(ctx: &TranslationContext<'_>, base: &str, type_name: &str) -> Filter {
    let path = join_path(base, ctx.registry.discriminator_field());
    let mut values = ctx.registry.discriminator_values(type_name);
    let op = match ctx.registry.convention() {
        DiscriminatorConvention::Scalar if values.len() > 1 => {
            FieldOp::In(values.into_iter().map(Value::String).collect())
        }
        // a hierarchical discriminator lists every ancestor, so equality
        // against an array element is enough
        _ => FieldOp::Eq(Value::String(values.swap_remove(0))),
    };
    Filter::field(path, op)
}

fn comparison(
    ctx: &mut TranslationContext<'_>,
    op: BinOp,
    left: &Expr,
    right: &Expr,
) -> Result<Option<Filter>, TranslationError> {
    let (field_expr, op, constant) = match (left.as_constant(), right.as_constant()) {
        (None, Some(constant)) => (left, op, constant),
        (Some(constant), None) => (right, op.reversed(), constant),
        _ => return Ok(None),
    };

    if let Some(filter) = size_comparison(ctx, field_expr, op, constant)? {
        return Ok(Some(filter));
    }

    // numeric widening casts do not change the comparison
    let (field_expr, widened_to) = match field_expr {
        Expr::Convert { operand, to } if to.is_numeric() => (operand.as_ref(), ctx.registry.resolve_type(to)),
        other => (other, None),
    };
    let Some(field) = scalar_field(ctx, field_expr)? else {
        return Ok(None);
    };
    if let Some(target) = widened_to {
        match (field.serializer.numeric_rank(), target.numeric_rank()) {
            (Some(from), Some(into)) if into >= from => {}
            _ => return Ok(None),
        }
    }

    let value = stored(constant, &field.serializer)?;
    let op = match op {
        BinOp::Equal => FieldOp::Eq(value),
        BinOp::NotEqual => FieldOp::Ne(value),
        BinOp::LessThan => FieldOp::Lt(value),
        BinOp::GreaterThan => FieldOp::Gt(value),
        BinOp::LessEqual => FieldOp::Lte(value),
        BinOp::GreaterEqual => FieldOp::Gte(value),
        _ => return Ok(None),
    };
    Ok(Some(Filter::field(field.path, op)))
}

/// `x.Tags.Count > 2` as an existence test on the element past the bound.
fn size_comparison(
    ctx: &TranslationContext<'_>,
    expr: &Expr,
    op: BinOp,
    constant: &Value,
) -> Result<Option<Filter>, TranslationError> {
    let target = match expr {
        Expr::Member { target, name } if name == "Count" || name == "Length" => target,
        Expr::Call { target: Some(target), method, args, .. }
            if (method == "Count" || method == "LongCount") && args.is_empty() =>
        {
            target
        }
        _ => return Ok(None),
    };
    let Some((path, _)) = sequence_field(ctx, target)? else {
        return Ok(None);
    };
    let Some(n) = constant.as_i64() else {
        return Ok(None);
    };
    let element = |index: i64, present: bool| {
        Filter::field(join_path(&path, &index.to_string()), FieldOp::Exists(present))
    };
    Ok(Some(match op {
        BinOp::Equal => Filter::field(path.clone(), FieldOp::Size(n)),
        BinOp::NotEqual => Filter::field(path.clone(), FieldOp::Not(Box::new(FieldOp::Size(n)))),
        BinOp::GreaterThan if n < 0 => Filter::True,
        BinOp::GreaterThan => element(n, true),
        BinOp::GreaterEqual if n <= 0 => Filter::True,
        BinOp::GreaterEqual => element(n - 1, true),
        BinOp::LessThan if n <= 0 => Filter::False,
        BinOp::LessThan => element(n - 1, false),
        BinOp::LessEqual if n < 0 => Filter::False,
        BinOp::LessEqual => element(n, false),
        _ => return Ok(None),
    }))
}

fn static_call(
    ctx: &TranslationContext<'_>,
    method: &str,
    args: &[Expr],
) -> Result<Option<Filter>, TranslationError> {
    match (method, args) {
        ("Regex.IsMatch", [input, pattern, rest @ ..]) if rest.len() <= 1 => {
            let Some(Value::String(pattern)) = pattern.as_constant() else {
                return Ok(None);
            };
            let Some(field) = scalar_field(ctx, input)? else {
                return Ok(None);
            };
            Ok(Some(Filter::field(
                field.path,
                FieldOp::Regex {
                    pattern: pattern.clone(),
                    options: regex_options(rest.first()),
                },
            )))
        }
        ("string.IsNullOrEmpty", [value]) => {
            let Some(field) = scalar_field(ctx, value)? else {
                return Ok(None);
            };
            Ok(Some(Filter::field(
                field.path,
                FieldOp::In(vec![Value::Null, Value::String(String::new())]),
            )))
        }
        _ => Ok(None),
    }
}

fn method_call(
    ctx: &mut TranslationContext<'_>,
    target: &Expr,
    method: &str,
    args: &[Expr],
) -> Result<Option<Filter>, TranslationError> {
    if let (Expr::Constant(Value::Array(values)), "Contains", [item]) = (target, method, args) {
        let Some(field) = scalar_field(ctx, item)? else {
            return Ok(None);
        };
        let values = values
            .iter()
            .map(|v| stored(v, &field.serializer))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Some(Filter::field(field.path, FieldOp::In(values))));
    }

    if let ("StartsWith" | "EndsWith" | "Contains", [value, rest @ ..]) = (method, args)
        && rest.len() <= 1
        && let Some(field) = scalar_field(ctx, target)?
        && field.serializer.is_string()
    {
        let Some(Value::String(literal)) = value.as_constant() else {
            return Ok(None);
        };
        let escaped = regex::escape(literal);
        let pattern = match method {
            "StartsWith" => format!("^{}", escaped),
            "EndsWith" => format!("{}$", escaped),
            _ => escaped,
        };
        let ignore_case = rest
            .first()
            .and_then(Expr::as_constant)
            .and_then(Value::as_str)
            .is_some_and(|c| c.ends_with("IgnoreCase"));
        return Ok(Some(Filter::field(
            field.path,
            FieldOp::Regex {
                pattern,
                options: if ignore_case { "i".into() } else { String::new() },
            },
        )));
    }

    if method == "ContainsKey" {
        return contains_key(ctx, target, args);
    }

    let Some((path, item)) = sequence_field(ctx, target)? else {
        return Ok(None);
    };
    match (method, args) {
        ("Contains", [value]) => match value.as_constant() {
            Some(constant) => Ok(Some(Filter::field(path, FieldOp::Eq(stored(constant, &item)?)))),
            None => Ok(None),
        },
        ("Any", []) => Ok(Some(Filter::And(vec![
            Filter::field(path.clone(), FieldOp::Ne(Value::Null)),
            Filter::field(path, FieldOp::Not(Box::new(FieldOp::Size(0)))),
        ]))),
        ("Any", [predicate]) => element_match(ctx, path, item, predicate, false),
        ("All", [predicate]) => element_match(ctx, path, item, predicate, true),
        _ => Ok(None),
    }
}

/// `Any(pred)` as `$elemMatch`, `All(pred)` as no element failing it.
fn element_match(
    ctx: &mut TranslationContext<'_>,
    path: String,
    item: Serializer,
    predicate: &Expr,
    all: bool,
) -> Result<Option<Filter>, TranslationError> {
    let Some((parameter, body)) = predicate.as_lambda1() else {
        return Ok(None);
    };
    // predicates reading the enclosing document need $expr
    if free_parameters(body).iter().any(|p| p != parameter) {
        return Ok(None);
    }
    let body = if all { Expr::unary(UnaryOp::Not, body.clone()) } else { body.clone() };
    let symbol = Symbol {
        parameter: parameter.to_string(),
        binding: Binding::Element,
        serializer: item,
    };
    let Some(inner) = ctx.scoped(vec![symbol], |ctx| filter(ctx, &body, false))? else {
        return Ok(None);
    };
    let matched = match inner.simplify() {
        Filter::Field { path: element, op: FieldOp::Eq(value) } if element.is_empty() && !all => {
            return Ok(Some(Filter::field(path, FieldOp::Eq(value))));
        }
        Filter::False if !all => return Ok(Some(Filter::False)),
        Filter::False => return Ok(Some(Filter::True)),
        // no element-level rendering: the caller falls back to $expr
        other => match other.element_match() {
            Some(matched) => matched,
            None => return Ok(None),
        },
    };
    Ok(Some(Filter::field(
        path,
        if all { FieldOp::Not(Box::new(matched)) } else { matched },
    )))
}

fn contains_key(
    ctx: &TranslationContext<'_>,
    target: &Expr,
    args: &[Expr],
) -> Result<Option<Filter>, TranslationError> {
    let [key] = args else {
        return Ok(None);
    };
    let Some(field) = scalar_field(ctx, target)? else {
        return Ok(None);
    };
    let Serializer::Dictionary { representation, key: key_serializer, .. } = field.serializer.underlying() else {
        return Ok(None);
    };
    let Some(constant) = key.as_constant() else {
        return Ok(None);
    };
    let key = stored(constant, key_serializer)?;
    Ok(match (representation, key) {
        (DictionaryRepresentation::Document, Value::String(name)) => {
            Some(Filter::field(join_path(&field.path, &name), FieldOp::Exists(true)))
        }
        (DictionaryRepresentation::Document, _) => None,
        (DictionaryRepresentation::ArrayOfDocuments, key) => Some(Filter::field(
            field.path,
            FieldOp::ElemMatch(Box::new(Filter::field("k", FieldOp::Eq(key)))),
        )),
        (DictionaryRepresentation::ArrayOfArrays, key) => Some(Filter::field(
            field.path,
            FieldOp::ElemMatch(Box::new(Filter::field("0", FieldOp::Eq(key)))),
        )),
    })
}
