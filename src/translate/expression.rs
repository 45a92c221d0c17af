//! Expressions to aggregation expressions.
//!
//! Every translation returns the aggregation expression together with the
//! serializer of its result, so member access, comparisons and constants
//! further up the tree know how the value is stored.

use super::{
    context::TranslationContext,
    methods,
};
use crate::{
    ast::{BinOp, Expr, TypeRef, UnaryOp},
    capabilities::Feature,
    error::{TranslationError, unsupported},
    evaluator::display_string,
    mql::AggExpr,
    registry::DiscriminatorConvention,
    serializer::{CharRepresentation, ClassMap, DecimalRepresentation, DictionaryRepresentation, Serializer},
    value::Value,
};

/// A translated expression and the serializer of its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Translated {
    pub ast: AggExpr,
    pub serializer: Serializer,
}

impl Translated {
    pub fn new(ast: AggExpr, serializer: Serializer) -> Self {
        Translated { ast, serializer }
    }

    fn boolean(ast: AggExpr) -> Self {
        Translated::new(ast, Serializer::Boolean)
    }
}

pub fn translate_expression(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
) -> Result<Translated, TranslationError> {
    match expr {
        Expr::Constant(value) => Ok(Translated::new(
            AggExpr::Literal(value.clone()),
            Serializer::for_value(value),
        )),
        Expr::Parameter(name) => {
            let symbol = ctx
                .lookup(name)
                .ok_or_else(|| TranslationError::UnknownIdentifier(name.clone()))?;
            let ast = symbol.to_expr().ok_or_else(|| {
                unsupported(expr, "an array element matched by $elemMatch cannot be used in a computed expression")
            })?;
            Ok(Translated::new(ast, symbol.serializer.clone()))
        }
        Expr::Identifier(name) => Err(TranslationError::UnknownIdentifier(name.clone())),
        Expr::Source(source) => Err(TranslationError::NestedQuerySource(source.name.clone())),
        Expr::Member { target, name } => translate_member(ctx, target, name),
        Expr::Index { target, index } => translate_index(ctx, expr, target, index),
        Expr::Call { target, method, type_args, args } => {
            methods::translate_call(ctx, expr, target.as_deref(), method, type_args, args)
        }
        Expr::Unary { op: UnaryOp::Not, operand } => {
            let operand = translate_expression(ctx, operand)?;
            Ok(Translated::boolean(AggExpr::op("$not", vec![operand.ast])))
        }
        Expr::Unary { op: UnaryOp::Negate, operand } => {
            let operand = translate_expression(ctx, operand)?;
            if !operand.serializer.is_numeric() && operand.serializer != Serializer::Any {
                return Err(unsupported(expr, format!("cannot negate {}", operand.serializer.describe())));
            }
            Ok(Translated::new(
                AggExpr::op("$subtract", vec![AggExpr::literal(0), operand.ast]),
                operand.serializer,
            ))
        }
        Expr::Binary { op, left, right } => translate_binary(ctx, expr, *op, left, right),
        Expr::Conditional { test, if_true, if_false } => {
            let test = translate_expression(ctx, test)?;
            let (then, otherwise) = translate_operands(ctx, if_true, if_false)?;
            let serializer = match then.ast.as_literal() {
                Some(Value::Null) => Serializer::nullable(otherwise.serializer.clone()),
                _ => then.serializer.clone(),
            };
            Ok(Translated::new(
                AggExpr::named("$cond", vec![("if", test.ast), ("then", then.ast), ("else", otherwise.ast)]),
                serializer,
            ))
        }
        Expr::Lambda { .. } => Err(unsupported(expr, "a lambda is only valid as an operator argument")),
        Expr::New { type_name, members } => translate_new(ctx, type_name.as_deref(), members),
        Expr::NewArray(items) => {
            let items = items
                .iter()
                .map(|item| translate_expression(ctx, item))
                .collect::<Result<Vec<_>, _>>()?;
            let item_serializer = items
                .first()
                .map(|t| t.serializer.clone())
                .unwrap_or(Serializer::Any);
            Ok(Translated::new(
                AggExpr::Array(items.into_iter().map(|t| t.ast).collect()),
                Serializer::array(item_serializer),
            ))
        }
        Expr::Convert { operand, to } => translate_convert(ctx, expr, operand, to),
        Expr::TypeIs { operand, type_name } => {
            let operand = translate_expression(ctx, operand)?;
            Ok(type_test(ctx, &operand, type_name))
        }
        Expr::StringEquals { left, right, ignore_case } => {
            translate_string_equals(ctx, expr, left, right, *ignore_case)
        }
        Expr::Snippet(_) => Err(unsupported(expr, "snippets only exist on the client")),
    }
}

/// Access `element` of a translated document.
///
/// Field and variable paths are extended in place; computed documents are
/// bound to `$$this` with `$let` first.
pub fn member_of(target: &Translated, element: &str, serializer: Serializer) -> Translated {
    let ast = match target.ast.extend_path(element) {
        Some(path) => path,
        None => AggExpr::named(
            "$let",
            vec![
                ("vars", AggExpr::Document(vec![("this".to_string(), target.ast.clone())])),
                ("in", AggExpr::Var { name: "this".into(), path: Some(element.to_string()) }),
            ],
        ),
    };
    Translated::new(ast, serializer)
}

fn translate_member(
    ctx: &mut TranslationContext<'_>,
    target: &Expr,
    name: &str,
) -> Result<Translated, TranslationError> {
    let target = translate_expression(ctx, target)?;
    if let Serializer::Nullable(inner) = &target.serializer {
        match name {
            "HasValue" => {
                return Ok(Translated::boolean(AggExpr::op(
                    "$ne",
                    vec![target.ast, AggExpr::Literal(Value::Null)],
                )));
            }
            "Value" => return Ok(Translated::new(target.ast, (**inner).clone())),
            _ => {}
        }
    }

    let ast = target.ast.clone();
    let special = match (target.serializer.underlying(), name) {
        (Serializer::String, "Length") => {
            Some(Translated::new(AggExpr::unary("$strLenCP", ast), Serializer::Int32))
        }
        (Serializer::Array(_), "Count" | "Length") => {
            Some(Translated::new(AggExpr::unary("$size", ast), Serializer::Int32))
        }
        (Serializer::Dictionary { representation, .. }, "Count") => {
            let entries = dictionary_entries(ast, *representation);
            Some(Translated::new(AggExpr::unary("$size", entries), Serializer::Int32))
        }
        (Serializer::Dictionary { representation, key, .. }, "Keys") => Some(Translated::new(
            dictionary_part(ctx, ast, *representation, EntryPart::Key),
            Serializer::array((**key).clone()),
        )),
        (Serializer::Dictionary { representation, value, .. }, "Values") => Some(Translated::new(
            dictionary_part(ctx, ast, *representation, EntryPart::Value),
            Serializer::array((**value).clone()),
        )),
        (Serializer::DateTime, _) => date_part(name, ast),
        (Serializer::KeyValuePair { key, positional: true, .. }, "Key") => Some(Translated::new(
            AggExpr::op("$arrayElemAt", vec![ast, AggExpr::literal(0)]),
            (**key).clone(),
        )),
        (Serializer::KeyValuePair { value, positional: true, .. }, "Value") => Some(Translated::new(
            AggExpr::op("$arrayElemAt", vec![ast, AggExpr::literal(1)]),
            (**value).clone(),
        )),
        _ => None,
    };
    if let Some(translated) = special {
        return Ok(translated);
    }

    match target.serializer.member(name) {
        Some((element, serializer)) => Ok(member_of(&target, &element, serializer)),
        None => Err(TranslationError::AmbiguousMember {
            member: name.to_string(),
            type_name: target.serializer.describe(),
        }),
    }
}

fn date_part(name: &str, date: AggExpr) -> Option<Translated> {
    let op = match name {
        "Year" => "$year",
        "Month" => "$month",
        "Day" => "$dayOfMonth",
        "Hour" => "$hour",
        "Minute" => "$minute",
        "Second" => "$second",
        "Millisecond" => "$millisecond",
        "DayOfYear" => "$dayOfYear",
        // server days start at 1 (Sunday), client days at 0
        "DayOfWeek" => {
            return Some(Translated::new(
                AggExpr::op("$subtract", vec![AggExpr::unary("$dayOfWeek", date), AggExpr::literal(1)]),
                Serializer::Int32,
            ));
        }
        _ => return None,
    };
    Some(Translated::new(AggExpr::unary(op, date), Serializer::Int32))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryPart {
    Key,
    Value,
}

/// The entries of a dictionary as an array.
pub(crate) fn dictionary_entries(dictionary: AggExpr, representation: DictionaryRepresentation) -> AggExpr {
    match representation {
        DictionaryRepresentation::Document => AggExpr::unary("$objectToArray", dictionary),
        _ => dictionary,
    }
}

/// Key or value of the entry bound to `var`.
pub(crate) fn entry_part(var: &str, representation: DictionaryRepresentation, part: EntryPart) -> AggExpr {
    match representation {
        DictionaryRepresentation::ArrayOfArrays => AggExpr::op(
            "$arrayElemAt",
            vec![
                AggExpr::var(var),
                AggExpr::literal(if part == EntryPart::Key { 0 } else { 1 }),
            ],
        ),
        _ => AggExpr::Var {
            name: var.to_string(),
            path: Some(if part == EntryPart::Key { "k" } else { "v" }.to_string()),
        },
    }
}

/// All keys or all values of a dictionary.
pub(crate) fn dictionary_part(
    ctx: &TranslationContext<'_>,
    dictionary: AggExpr,
    representation: DictionaryRepresentation,
    part: EntryPart,
) -> AggExpr {
    let var = ctx.variable_name("kv");
    AggExpr::named(
        "$map",
        vec![
            ("input", dictionary_entries(dictionary, representation)),
            ("as", AggExpr::literal(var.as_str())),
            ("in", entry_part(&var, representation, part)),
        ],
    )
}

fn translate_index(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    target: &Expr,
    index: &Expr,
) -> Result<Translated, TranslationError> {
    let target = translate_expression(ctx, target)?;
    match target.serializer.underlying().clone() {
        Serializer::Array(item) => {
            let index = translate_expression(ctx, index)?;
            Ok(Translated::new(AggExpr::op("$arrayElemAt", vec![target.ast, index.ast]), *item))
        }
        Serializer::String => {
            let index = translate_expression(ctx, index)?;
            Ok(Translated::new(
                AggExpr::op("$substrCP", vec![target.ast, index.ast, AggExpr::literal(1)]),
                Serializer::Char(CharRepresentation::String),
            ))
        }
        Serializer::Dictionary { representation, key, value } => {
            let key = match index.as_constant() {
                Some(constant) => serialize_literal(constant, &key)?,
                None => translate_expression(ctx, index)?,
            };
            match (representation, key.ast.as_literal()) {
                (DictionaryRepresentation::Document, Some(Value::String(name))) => {
                    Ok(member_of(&target, name, *value))
                }
                (DictionaryRepresentation::Document, _) => {
                    Err(unsupported(expr, "keys of a document dictionary must be constant strings"))
                }
                (representation, _) => {
                    let var = ctx.variable_name("kv");
                    let matching = AggExpr::named(
                        "$filter",
                        vec![
                            ("input", target.ast),
                            ("as", AggExpr::literal(var.as_str())),
                            (
                                "cond",
                                AggExpr::op("$eq", vec![entry_part(&var, representation, EntryPart::Key), key.ast]),
                            ),
                        ],
                    );
                    let entry = AggExpr::op("$arrayElemAt", vec![matching, AggExpr::literal(0)]);
                    Ok(Translated::new(
                        AggExpr::named(
                            "$let",
                            vec![
                                ("vars", AggExpr::Document(vec![("entry".to_string(), entry)])),
                                ("in", entry_part("entry", representation, EntryPart::Value)),
                            ],
                        ),
                        *value,
                    ))
                }
            }
        }
        Serializer::Any => match index.as_constant() {
            Some(Value::String(name)) => Ok(member_of(&target, name, Serializer::Any)),
            Some(position) if position.as_i64().is_some() => Ok(Translated::new(
                AggExpr::op("$arrayElemAt", vec![target.ast, AggExpr::Literal(position.clone())]),
                Serializer::Any,
            )),
            _ => Err(unsupported(expr, "indexers on untyped values must be constant")),
        },
        other => Err(unsupported(expr, format!("{} cannot be indexed", other.describe()))),
    }
}

pub(crate) fn comparison_operator(op: BinOp) -> Option<&'static str> {
    Some(match op {
        BinOp::Equal => "$eq",
        BinOp::NotEqual => "$ne",
        BinOp::LessThan => "$lt",
        BinOp::GreaterThan => "$gt",
        BinOp::LessEqual => "$lte",
        BinOp::GreaterEqual => "$gte",
        _ => return None,
    })
}

fn translate_binary(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    op: BinOp,
    left: &Expr,
    right: &Expr,
) -> Result<Translated, TranslationError> {
    if let Some(name) = comparison_operator(op) {
        let (left, right) = translate_operands(ctx, left, right)?;
        return Ok(Translated::boolean(AggExpr::op(name, vec![left.ast, right.ast])));
    }
    match op {
        BinOp::AndAlso | BinOp::OrElse => {
            let name = if op == BinOp::AndAlso { "$and" } else { "$or" };
            let left = translate_expression(ctx, left)?;
            let right = translate_expression(ctx, right)?;
            Ok(Translated::boolean(AggExpr::op(name, flatten(name, vec![left.ast, right.ast]))))
        }
        BinOp::Coalesce => {
            let (left, right) = translate_operands(ctx, left, right)?;
            let serializer = match right.ast.as_literal() {
                Some(Value::Null) => left.serializer.clone(),
                _ => right.serializer.clone(),
            };
            Ok(Translated::new(AggExpr::op("$ifNull", vec![left.ast, right.ast]), serializer))
        }
        _ => translate_arithmetic(ctx, expr, op, left, right),
    }
}

/// Merge nested applications of an associative operator.
fn flatten(name: &str, args: Vec<AggExpr>) -> Vec<AggExpr> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        match arg {
            AggExpr::Op { name: inner, args } if inner == name => out.extend(args),
            other => out.push(other),
        }
    }
    out
}

fn translate_arithmetic(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    op: BinOp,
    left: &Expr,
    right: &Expr,
) -> Result<Translated, TranslationError> {
    let left = translate_expression(ctx, left)?;
    let right = translate_expression(ctx, right)?;

    if op == BinOp::Add && (left.serializer.is_string() || right.serializer.is_string()) {
        let parts = vec![concat_operand(ctx, left)?, concat_operand(ctx, right)?];
        return Ok(Translated::new(
            AggExpr::op("$concat", flatten("$concat", parts)),
            Serializer::String,
        ));
    }

    let untyped = left.serializer == Serializer::Any || right.serializer == Serializer::Any;
    let rank = match (left.serializer.numeric_rank(), right.serializer.numeric_rank()) {
        (Some(l), Some(r)) => Some(l.max(r)),
        _ if untyped => None,
        _ => {
            return Err(unsupported(
                expr,
                format!(
                    "cannot apply {} to {} and {}",
                    op.symbol(),
                    left.serializer.describe(),
                    right.serializer.describe()
                ),
            ));
        }
    };
    let nullable = matches!(left.serializer, Serializer::Nullable(_))
        || matches!(right.serializer, Serializer::Nullable(_));

    let name = match op {
        BinOp::Add => "$add",
        BinOp::Subtract => "$subtract",
        BinOp::Multiply => "$multiply",
        BinOp::Divide => "$divide",
        BinOp::Modulo => "$mod",
        _ => return Err(unsupported(expr, format!("{} is not an arithmetic operator", op.symbol()))),
    };
    let args = match name {
        "$add" | "$multiply" => flatten(name, vec![left.ast, right.ast]),
        _ => vec![left.ast, right.ast],
    };
    let mut ast = AggExpr::op(name, args);

    // integer division truncates on the client
    if op == BinOp::Divide && matches!(rank, Some(0 | 1)) {
        ast = if ctx.capabilities.supports(Feature::ConversionOperators) {
            AggExpr::unary(if rank == Some(0) { "$toInt" } else { "$toLong" }, ast)
        } else {
            AggExpr::op("$trunc", vec![ast])
        };
    }

    let serializer = match rank {
        Some(rank) => rank_serializer(rank),
        None => Serializer::Any,
    };
    Ok(Translated::new(
        ast,
        if nullable { Serializer::nullable(serializer) } else { serializer },
    ))
}

fn rank_serializer(rank: u8) -> Serializer {
    match rank {
        0 => Serializer::Int32,
        1 => Serializer::Int64,
        2 => Serializer::Double,
        _ => Serializer::Decimal(DecimalRepresentation::Decimal128),
    }
}

fn concat_operand(ctx: &TranslationContext<'_>, operand: Translated) -> Result<AggExpr, TranslationError> {
    if operand.serializer.is_string() {
        return Ok(operand.ast);
    }
    if let Some(value) = operand.ast.as_literal() {
        return Ok(AggExpr::literal(display_string(value)));
    }
    ctx.capabilities.require(Feature::ConversionOperators)?;
    Ok(AggExpr::unary("$toString", operand.ast))
}

/// Translate two operands, serializing a constant side with the serializer
/// of the other side.
pub fn translate_operands(
    ctx: &mut TranslationContext<'_>,
    left: &Expr,
    right: &Expr,
) -> Result<(Translated, Translated), TranslationError> {
    match (left.as_constant(), right.as_constant()) {
        (Some(value), None) => {
            let right = translate_expression(ctx, right)?;
            let left = literal_for(value, &right.serializer)?;
            Ok((left, right))
        }
        (None, Some(value)) => {
            let left = translate_expression(ctx, left)?;
            let right = literal_for(value, &left.serializer)?;
            Ok((left, right))
        }
        _ => Ok((translate_expression(ctx, left)?, translate_expression(ctx, right)?)),
    }
}

/// A constant compared with a value stored by `serializer`.
///
/// A number wider than the field keeps its own type (`x.Age > 1.5`).
pub fn literal_for(value: &Value, serializer: &Serializer) -> Result<Translated, TranslationError> {
    let own = Serializer::for_value(value);
    if let (Some(field), Some(constant)) = (serializer.numeric_rank(), own.numeric_rank())
        && constant > field
    {
        return Ok(Translated::new(AggExpr::Literal(value.clone()), own));
    }
    serialize_literal(value, serializer)
}

pub fn serialize_literal(value: &Value, serializer: &Serializer) -> Result<Translated, TranslationError> {
    let serialized = serializer
        .serialize_constant(value)
        .map_err(|_| TranslationError::Serialization {
            value: value.to_string(),
            serializer: serializer.describe(),
        })?;
    Ok(Translated::new(AggExpr::Literal(serialized), serializer.clone()))
}

fn translate_new(
    ctx: &mut TranslationContext<'_>,
    type_name: Option<&str>,
    members: &[(String, Expr)],
) -> Result<Translated, TranslationError> {
    let mut translated = Vec::with_capacity(members.len());
    for (name, member) in members {
        translated.push((name.clone(), translate_expression(ctx, member)?));
    }

    let registered = type_name.and_then(|name| ctx.registry.class(name)).cloned();
    let serializer = match &registered {
        Some(map) => Serializer::Class(map.clone()),
        None => Serializer::class(ClassMap::anonymous(
            translated
                .iter()
                .map(|(name, t)| (name.clone(), t.serializer.clone()))
                .collect(),
        )),
    };

    let mut fields = Vec::with_capacity(translated.len());
    for (name, t) in translated {
        let element = match serializer.member(&name) {
            Some((element, _)) => element,
            None => {
                return Err(TranslationError::AmbiguousMember {
                    member: name,
                    type_name: serializer.describe(),
                });
            }
        };
        fields.push((element, t.ast));
    }
    Ok(Translated::new(AggExpr::Document(fields), serializer))
}

fn translate_convert(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    operand: &Expr,
    to: &TypeRef,
) -> Result<Translated, TranslationError> {
    let operand = translate_expression(ctx, operand)?;
    let target = match (to.underlying(), ctx.registry.resolve_type(to)) {
        (_, Some(target)) => target,
        (TypeRef::Named(name), None) => {
            return Err(TranslationError::AmbiguousMember {
                member: expr.to_string(),
                type_name: name.clone(),
            });
        }
        (_, None) => return Err(unsupported(expr, format!("no serializer for {}", to))),
    };

    if operand.serializer.underlying() == target.underlying()
        || matches!(to.underlying(), TypeRef::Named(_) | TypeRef::Object)
    {
        return Ok(Translated::new(operand.ast, target));
    }

    // widening casts convert too: the stored width is part of the result
    let op = match to.underlying() {
        TypeRef::Int32 => "$toInt",
        TypeRef::Int64 => "$toLong",
        TypeRef::Double => "$toDouble",
        TypeRef::Decimal => "$toDecimal",
        TypeRef::String => "$toString",
        TypeRef::Boolean => "$toBool",
        TypeRef::DateTime => "$toDate",
        TypeRef::Char if operand.serializer.numeric_rank() == Some(0) => {
            return Ok(Translated::new(operand.ast, Serializer::Char(CharRepresentation::Int32)));
        }
        _ => return Err(unsupported(expr, format!("cannot convert {} to {}", operand.serializer.describe(), to))),
    };
    ctx.capabilities.require(Feature::ConversionOperators)?;
    Ok(Translated::new(AggExpr::unary(op, operand.ast), target))
}

/// Discriminator test for `operand is T`.
pub fn type_test(ctx: &TranslationContext<'_>, operand: &Translated, type_name: &str) -> Translated {
    let field = ctx.registry.discriminator_field().to_string();
    let discriminator = member_of(operand, &field, Serializer::String).ast;
    let values = ctx.registry.discriminator_values(type_name);
    let ast = match ctx.registry.convention() {
        DiscriminatorConvention::Scalar if values.len() == 1 => {
            AggExpr::op("$eq", vec![discriminator, AggExpr::literal(values[0].as_str())])
        }
        DiscriminatorConvention::Scalar => AggExpr::op(
            "$in",
            vec![
                discriminator,
                AggExpr::Array(values.iter().map(|v| AggExpr::literal(v.as_str())).collect()),
            ],
        ),
        DiscriminatorConvention::Hierarchical => {
            let own = values.into_iter().next().unwrap_or_else(|| type_name.to_string());
            AggExpr::named(
                "$cond",
                vec![
                    ("if", AggExpr::unary("$isArray", discriminator.clone())),
                    ("then", AggExpr::op("$in", vec![AggExpr::literal(own.as_str()), discriminator.clone()])),
                    ("else", AggExpr::op("$eq", vec![discriminator, AggExpr::literal(own.as_str())])),
                ],
            )
        }
    };
    Translated::boolean(ast)
}

/// `^…$` pattern matching exactly `text`.
pub fn anchored_pattern(text: &str) -> String {
    format!("^{}$", regex::escape(text))
}

pub(crate) fn reject_char_as_int(expr: &Expr, operand: &Translated) -> Result<(), TranslationError> {
    if operand.serializer.underlying() == &Serializer::Char(CharRepresentation::Int32) {
        return Err(unsupported(expr, "a char operand that is not serialized as a string"));
    }
    Ok(())
}

fn translate_string_equals(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    left: &Expr,
    right: &Expr,
    ignore_case: bool,
) -> Result<Translated, TranslationError> {
    let (left, right) = translate_operands(ctx, left, right)?;
    reject_char_as_int(expr, &left)?;
    reject_char_as_int(expr, &right)?;
    if !ignore_case {
        return Ok(Translated::boolean(AggExpr::op("$eq", vec![left.ast, right.ast])));
    }
    if let Some(Value::String(literal)) = right.ast.as_literal()
        && ctx.capabilities.supports(Feature::RegexMatch)
    {
        return Ok(Translated::boolean(AggExpr::named(
            "$regexMatch",
            vec![
                ("input", left.ast),
                (
                    "regex",
                    AggExpr::Literal(Value::Regex {
                        pattern: anchored_pattern(literal),
                        options: "i".into(),
                    }),
                ),
            ],
        )));
    }
    Ok(Translated::boolean(AggExpr::op(
        "$eq",
        vec![AggExpr::op("$strcasecmp", vec![left.ast, right.ast]), AggExpr::literal(0)],
    )))
}
