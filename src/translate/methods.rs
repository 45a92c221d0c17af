//! Method calls inside expressions: sequence operators over arrays, string
//! functions, dictionary lookups, date arithmetic and `Math`.

use super::{
    context::{Binding, Symbol, TranslationContext},
    expression::{
        EntryPart, Translated, dictionary_entries, dictionary_part, literal_for,
        member_of, reject_char_as_int, translate_expression,
    },
};
use crate::{
    ast::{Expr, TypeRef},
    capabilities::Feature,
    error::{TranslationError, unsupported},
    mql::AggExpr,
    serializer::{DecimalRepresentation, DictionaryRepresentation, Serializer},
    value::Value,
};

/// An enumerable operand: the array expression and the serializer of its items.
struct Sequence {
    ast: AggExpr,
    item: Serializer,
}

pub fn translate_call(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    target: Option<&Expr>,
    method: &str,
    _type_args: &[TypeRef],
    args: &[Expr],
) -> Result<Translated, TranslationError> {
    let Some(target) = target else {
        return translate_static(ctx, expr, method, args);
    };

    // membership in a constant collection
    if let (Expr::Constant(Value::Array(values)), "Contains", [item]) = (target, method, args) {
        let item = translate_expression(ctx, item)?;
        let values = values
            .iter()
            .map(|v| literal_for(v, &item.serializer).map(|t| t.ast))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Translated::new(
            AggExpr::op("$in", vec![item.ast, AggExpr::Array(values)]),
            Serializer::Boolean,
        ));
    }

    let target = translate_expression(ctx, target)?;
    match (method, args) {
        ("CompareTo", [other]) => {
            let other = argument(ctx, other, &target.serializer)?;
            return Ok(Translated::new(AggExpr::op("$cmp", vec![target.ast, other.ast]), Serializer::Int32));
        }
        ("ToString", []) if !target.serializer.is_string() => {
            ctx.capabilities.require(Feature::ConversionOperators)?;
            return Ok(Translated::new(AggExpr::unary("$toString", target.ast), Serializer::String));
        }
        _ => {}
    }

    match target.serializer.underlying().clone() {
        Serializer::String => string_method(ctx, expr, target, method, args),
        Serializer::DateTime => date_method(ctx, expr, target, method, args),
        Serializer::Dictionary { representation, key, value }
            if matches!(method, "ContainsKey" | "ContainsValue") =>
        {
            let (part, serializer) = if method == "ContainsKey" {
                (EntryPart::Key, *key)
            } else {
                (EntryPart::Value, *value)
            };
            let [wanted] = args else {
                return Err(unsupported(expr, format!("{} takes one argument", method)));
            };
            let wanted = argument(ctx, wanted, &serializer)?;
            if let (DictionaryRepresentation::Document, EntryPart::Key, Some(Value::String(name))) =
                (representation, part, wanted.ast.as_literal())
            {
                let field = member_of(&target, name, Serializer::Any).ast;
                return Ok(Translated::new(
                    AggExpr::op("$ne", vec![AggExpr::unary("$type", field), AggExpr::literal("missing")]),
                    Serializer::Boolean,
                ));
            }
            let candidates = dictionary_part(ctx, target.ast, representation, part);
            Ok(Translated::new(
                AggExpr::op("$in", vec![wanted.ast, candidates]),
                Serializer::Boolean,
            ))
        }
        _ => match enumerable(&target) {
            Some(sequence) => sequence_method(ctx, expr, sequence, method, args),
            None => Err(unsupported(
                expr,
                format!("{} has no translatable method {}", target.serializer.describe(), method),
            )),
        },
    }
}

/// An argument compared with or stored alongside values of `serializer`.
fn argument(
    ctx: &mut TranslationContext<'_>,
    arg: &Expr,
    serializer: &Serializer,
) -> Result<Translated, TranslationError> {
    match arg.as_constant() {
        Some(value) => literal_for(value, serializer),
        None => translate_expression(ctx, arg),
    }
}

fn enumerable(target: &Translated) -> Option<Sequence> {
    match target.serializer.underlying() {
        Serializer::Grouping { element, .. } => Some(Sequence {
            ast: member_of(target, "_elements", Serializer::Any).ast,
            item: (**element).clone(),
        }),
        Serializer::Dictionary { representation, .. } => Some(Sequence {
            ast: dictionary_entries(target.ast.clone(), *representation),
            item: target.serializer.item()?,
        }),
        Serializer::Array(_) | Serializer::Any => Some(Sequence {
            ast: target.ast.clone(),
            item: target.serializer.item()?,
        }),
        _ => None,
    }
}

/// Bind a single-parameter lambda to a fresh variable and translate its body.
pub(crate) fn translate_lambda(
    ctx: &mut TranslationContext<'_>,
    lambda: &Expr,
    item: &Serializer,
) -> Result<(String, Translated), TranslationError> {
    let (parameter, body) = lambda
        .as_lambda1()
        .ok_or_else(|| unsupported(lambda, "expected a lambda with one parameter"))?;
    let var = ctx.variable_name(parameter);
    let symbol = Symbol {
        parameter: parameter.to_string(),
        binding: Binding::Variable(var.clone()),
        serializer: item.clone(),
    };
    let body = ctx.scoped(vec![symbol], |ctx| translate_expression(ctx, body))?;
    Ok((var, body))
}

fn map(input: AggExpr, var: &str, body: AggExpr) -> AggExpr {
    AggExpr::named(
        "$map",
        vec![("input", input), ("as", AggExpr::literal(var)), ("in", body)],
    )
}

fn filter(input: AggExpr, var: &str, cond: AggExpr, limit: Option<i64>) -> AggExpr {
    let mut args = vec![("input", input), ("as", AggExpr::literal(var)), ("cond", cond)];
    if let Some(limit) = limit {
        args.push(("limit", AggExpr::literal(limit as i32)));
    }
    AggExpr::named("$filter", args)
}

fn element_at(input: AggExpr, index: i32) -> AggExpr {
    AggExpr::op("$arrayElemAt", vec![input, AggExpr::literal(index)])
}

fn sequence_method(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    sequence: Sequence,
    method: &str,
    args: &[Expr],
) -> Result<Translated, TranslationError> {
    let Sequence { ast: input, item } = sequence;
    let array_of_items = Serializer::array(item.clone());
    Ok(match (method, args) {
        ("Where", [predicate]) => {
            let (var, cond) = translate_lambda(ctx, predicate, &item)?;
            Translated::new(filter(input, &var, cond.ast, None), array_of_items)
        }
        ("Select", [selector]) => {
            let (var, body) = translate_lambda(ctx, selector, &item)?;
            Translated::new(map(input, &var, body.ast), Serializer::array(body.serializer))
        }
        ("SelectMany", [selector]) => {
            let (var, body) = translate_lambda(ctx, selector, &item)?;
            let inner = body
                .serializer
                .item()
                .ok_or_else(|| unsupported(expr, "the selector does not produce a sequence"))?;
            Translated::new(
                AggExpr::named(
                    "$reduce",
                    vec![
                        ("input", map(input, &var, body.ast)),
                        ("initialValue", AggExpr::Array(Vec::new())),
                        ("in", AggExpr::op("$concatArrays", vec![AggExpr::var("value"), AggExpr::var("this")])),
                    ],
                ),
                Serializer::array(inner),
            )
        }
        ("Any", []) => Translated::new(
            AggExpr::op("$gt", vec![AggExpr::unary("$size", input), AggExpr::literal(0)]),
            Serializer::Boolean,
        ),
        ("Any" | "All", [predicate]) => {
            let (var, body) = translate_lambda(ctx, predicate, &item)?;
            let name = if method == "Any" { "$anyElementTrue" } else { "$allElementsTrue" };
            Translated::new(AggExpr::op(name, vec![map(input, &var, body.ast)]), Serializer::Boolean)
        }
        ("Count" | "LongCount", _) => {
            let counted = match args {
                [] => input,
                [predicate] => {
                    let (var, cond) = translate_lambda(ctx, predicate, &item)?;
                    filter(input, &var, cond.ast, None)
                }
                _ => return Err(unsupported(expr, "Count takes at most one predicate")),
            };
            let serializer = if method == "Count" { Serializer::Int32 } else { Serializer::Int64 };
            Translated::new(AggExpr::unary("$size", counted), serializer)
        }
        ("Sum" | "Average" | "Min" | "Max" | "StandardDeviationPop" | "StandardDeviationSamp", _) => {
            let (values, value_serializer) = match args {
                [] => (input, item),
                [selector] => {
                    let (var, body) = translate_lambda(ctx, selector, &item)?;
                    (map(input, &var, body.ast), body.serializer)
                }
                _ => return Err(unsupported(expr, format!("{} takes at most one selector", method))),
            };
            let (name, serializer) = match method {
                "Sum" => ("$sum", value_serializer),
                "Average" => ("$avg", average_serializer(&value_serializer)),
                "Min" => ("$min", value_serializer),
                "Max" => ("$max", value_serializer),
                "StandardDeviationPop" => ("$stdDevPop", Serializer::Double),
                _ => ("$stdDevSamp", Serializer::Double),
            };
            Translated::new(AggExpr::unary(name, values), serializer)
        }
        ("First" | "FirstOrDefault" | "Last" | "LastOrDefault", _) => {
            let first = method.starts_with("First");
            let candidates = match args {
                [] => input,
                [predicate] => {
                    let (var, cond) = translate_lambda(ctx, predicate, &item)?;
                    let limit = (first && ctx.capabilities.supports(Feature::FilterLimit)).then_some(1);
                    filter(input, &var, cond.ast, limit)
                }
                _ => return Err(unsupported(expr, format!("{} takes at most one predicate", method))),
            };
            Translated::new(element_at(candidates, if first { 0 } else { -1 }), item)
        }
        ("ElementAt" | "ElementAtOrDefault", [index]) => {
            let index = translate_expression(ctx, index)?;
            Translated::new(AggExpr::op("$arrayElemAt", vec![input, index.ast]), item)
        }
        ("Contains", [value]) => {
            let value = argument(ctx, value, &item)?;
            Translated::new(AggExpr::op("$in", vec![value.ast, input]), Serializer::Boolean)
        }
        ("Distinct", []) => Translated::new(AggExpr::op("$setUnion", vec![input]), array_of_items),
        ("Concat" | "Union" | "Intersect" | "Except", [other]) => {
            let other = other_sequence(ctx, other, &array_of_items)?;
            let name = match method {
                "Concat" => "$concatArrays",
                "Union" => "$setUnion",
                "Intersect" => "$setIntersection",
                _ => "$setDifference",
            };
            Translated::new(AggExpr::op(name, vec![input, other]), array_of_items)
        }
        ("Reverse", []) => Translated::new(AggExpr::unary("$reverseArray", input), array_of_items),
        ("Take", [count]) => {
            let count = translate_expression(ctx, count)?;
            Translated::new(AggExpr::op("$slice", vec![input, count.ast]), array_of_items)
        }
        ("Skip", [count]) => {
            let count = translate_expression(ctx, count)?;
            Translated::new(
                AggExpr::op("$slice", vec![input, count.ast, AggExpr::literal(i32::MAX)]),
                array_of_items,
            )
        }
        ("SequenceEqual", [other]) => sequence_equal(ctx, input, &array_of_items, other)?,
        ("Aggregate", [seed, func]) => {
            let seed = translate_expression(ctx, seed)?;
            let Expr::Lambda { params, body } = func else {
                return Err(unsupported(func, "expected an accumulator lambda"));
            };
            let [accumulator, element] = params.as_slice() else {
                return Err(unsupported(func, "the accumulator takes two parameters"));
            };
            let symbols = vec![
                Symbol {
                    parameter: accumulator.clone(),
                    binding: Binding::Variable("value".into()),
                    serializer: seed.serializer.clone(),
                },
                Symbol {
                    parameter: element.clone(),
                    binding: Binding::Variable("this".into()),
                    serializer: item,
                },
            ];
            let body = ctx.scoped(symbols, |ctx| translate_expression(ctx, body))?;
            Translated::new(
                AggExpr::named(
                    "$reduce",
                    vec![("input", input), ("initialValue", seed.ast), ("in", body.ast)],
                ),
                seed.serializer,
            )
        }
        ("ToList" | "ToArray" | "AsEnumerable", []) => Translated::new(input, array_of_items),
        _ => return Err(unsupported(expr, format!("{} is not supported on arrays", method))),
    })
}

pub(crate) fn average_serializer(values: &Serializer) -> Serializer {
    let average = match values.underlying() {
        Serializer::Decimal(DecimalRepresentation::Decimal128) => values.underlying().clone(),
        _ => Serializer::Double,
    };
    match values {
        Serializer::Nullable(_) => Serializer::nullable(average),
        _ => average,
    }
}

fn other_sequence(
    ctx: &mut TranslationContext<'_>,
    other: &Expr,
    serializer: &Serializer,
) -> Result<AggExpr, TranslationError> {
    let translated = argument(ctx, other, serializer)?;
    match enumerable(&translated) {
        Some(sequence) => Ok(sequence.ast),
        None => Err(unsupported(
            other,
            format!("{} is not a sequence", translated.serializer.describe()),
        )),
    }
}

/// Both arrays, same length, pairwise equal; `false` when either side is not an array.
fn sequence_equal(
    ctx: &mut TranslationContext<'_>,
    input: AggExpr,
    serializer: &Serializer,
    other: &Expr,
) -> Result<Translated, TranslationError> {
    if let Some(value) = other.as_constant() {
        let literal = literal_for(value, serializer)?;
        return Ok(Translated::new(AggExpr::op("$eq", vec![input, literal.ast]), Serializer::Boolean));
    }
    let other = other_sequence(ctx, other, serializer)?;
    let pair = ctx.variable_name("pair");
    let pairs = map(
        AggExpr::named("$zip", vec![("inputs", AggExpr::Array(vec![input.clone(), other.clone()]))]),
        &pair,
        AggExpr::op("$eq", vec![element_at(AggExpr::var(pair.as_str()), 0), element_at(AggExpr::var(pair.as_str()), 1)]),
    );
    Ok(Translated::new(
        AggExpr::op(
            "$and",
            vec![
                AggExpr::unary("$isArray", input.clone()),
                AggExpr::unary("$isArray", other.clone()),
                AggExpr::op("$eq", vec![AggExpr::unary("$size", input), AggExpr::unary("$size", other)]),
                AggExpr::op("$allElementsTrue", vec![pairs]),
            ],
        ),
        Serializer::Boolean,
    ))
}

/// A string operand; chars stored as numbers cannot take part in string functions.
fn string_operand(ctx: &mut TranslationContext<'_>, operand: &Expr) -> Result<AggExpr, TranslationError> {
    let translated = argument(ctx, operand, &Serializer::String)?;
    reject_char_as_int(operand, &translated)?;
    Ok(translated.ast)
}

fn ignores_case(comparison: Option<&Expr>) -> bool {
    comparison
        .and_then(Expr::as_constant)
        .and_then(Value::as_str)
        .is_some_and(|name| name.ends_with("IgnoreCase"))
}

fn regex_match(input: AggExpr, pattern: String, options: &str) -> AggExpr {
    AggExpr::named(
        "$regexMatch",
        vec![
            ("input", input),
            ("regex", AggExpr::Literal(Value::Regex { pattern, options: options.to_string() })),
        ],
    )
}

fn string_method(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    target: Translated,
    method: &str,
    args: &[Expr],
) -> Result<Translated, TranslationError> {
    let s = target.ast;
    let string = |ast| Ok(Translated::new(ast, Serializer::String));
    let int = |ast| Ok(Translated::new(ast, Serializer::Int32));
    let boolean = |ast| Ok(Translated::new(ast, Serializer::Boolean));

    match (method, args) {
        ("ToLower" | "ToLowerInvariant", []) => string(AggExpr::unary("$toLower", s)),
        ("ToUpper" | "ToUpperInvariant", []) => string(AggExpr::unary("$toUpper", s)),
        ("Trim" | "TrimStart" | "TrimEnd", _) => {
            let name = match method {
                "Trim" => "$trim",
                "TrimStart" => "$ltrim",
                _ => "$rtrim",
            };
            let mut named = vec![("input", s)];
            if let [chars] = args {
                named.push(("chars", string_operand(ctx, chars)?));
            }
            string(AggExpr::named(name, named))
        }
        ("IndexOf", [value]) => int(AggExpr::op("$indexOfCP", vec![s, string_operand(ctx, value)?])),
        ("IndexOf", [value, start]) => {
            let value = string_operand(ctx, value)?;
            let start = translate_expression(ctx, start)?;
            int(AggExpr::op("$indexOfCP", vec![s, value, start.ast]))
        }
        ("Substring", [start]) => {
            let start = translate_expression(ctx, start)?;
            let rest = AggExpr::op("$subtract", vec![AggExpr::unary("$strLenCP", s.clone()), start.ast.clone()]);
            string(AggExpr::op("$substrCP", vec![s, start.ast, rest]))
        }
        ("Substring", [start, length]) => {
            let start = translate_expression(ctx, start)?;
            let length = translate_expression(ctx, length)?;
            string(AggExpr::op("$substrCP", vec![s, start.ast, length.ast]))
        }
        ("StartsWith" | "EndsWith" | "Contains", [value, rest @ ..]) if rest.len() <= 1 => {
            let ignore_case = ignores_case(rest.first());
            match value.as_constant() {
                Some(Value::String(literal)) if ignore_case || method == "EndsWith" => {
                    ctx.capabilities.require(Feature::RegexMatch)?;
                    let escaped = regex::escape(literal);
                    let pattern = match method {
                        "StartsWith" => format!("^{}", escaped),
                        "EndsWith" => format!("{}$", escaped),
                        _ => escaped,
                    };
                    boolean(regex_match(s, pattern, if ignore_case { "i" } else { "" }))
                }
                _ if ignore_case => Err(unsupported(expr, "case-insensitive matching needs a constant operand")),
                _ if method == "EndsWith" => Err(unsupported(expr, "EndsWith needs a constant operand")),
                _ => {
                    let position = AggExpr::op("$indexOfCP", vec![s, string_operand(ctx, value)?]);
                    let name = if method == "StartsWith" { "$eq" } else { "$gte" };
                    boolean(AggExpr::op(name, vec![position, AggExpr::literal(0)]))
                }
            }
        }
        ("Replace", [find, replacement]) => {
            ctx.capabilities.require(Feature::ReplaceAll)?;
            let find = string_operand(ctx, find)?;
            let replacement = string_operand(ctx, replacement)?;
            string(AggExpr::named(
                "$replaceAll",
                vec![("input", s), ("find", find), ("replacement", replacement)],
            ))
        }
        ("Split", [separator]) => Ok(Translated::new(
            AggExpr::op("$split", vec![s, string_operand(ctx, separator)?]),
            Serializer::array(Serializer::String),
        )),
        ("ToString", []) => string(s),
        _ => Err(unsupported(expr, format!("{} is not supported on strings", method))),
    }
}

fn date_method(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    target: Translated,
    method: &str,
    args: &[Expr],
) -> Result<Translated, TranslationError> {
    let unit = match method {
        "AddYears" => "year",
        "AddMonths" => "month",
        "AddDays" => "day",
        "AddHours" => "hour",
        "AddMinutes" => "minute",
        "AddSeconds" => "second",
        "AddMilliseconds" => "millisecond",
        _ => return Err(unsupported(expr, format!("{} is not supported on dates", method))),
    };
    let [amount] = args else {
        return Err(unsupported(expr, format!("{} takes one argument", method)));
    };
    ctx.capabilities.require(Feature::DateAdd)?;
    let amount = translate_expression(ctx, amount)?;
    Ok(Translated::new(
        AggExpr::named(
            "$dateAdd",
            vec![("startDate", target.ast), ("unit", AggExpr::literal(unit)), ("amount", amount.ast)],
        ),
        Serializer::DateTime,
    ))
}

fn translate_static(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    method: &str,
    args: &[Expr],
) -> Result<Translated, TranslationError> {
    let Some((class, name)) = method.split_once('.') else {
        return Err(unsupported(expr, format!("host function {} runs only on the client", method)));
    };
    match class {
        "Math" => math(ctx, expr, name, args),
        "string" => match (name, args) {
            ("IsNullOrEmpty", [value]) => {
                let value = string_operand(ctx, value)?;
                Ok(Translated::new(
                    AggExpr::op(
                        "$in",
                        vec![value, AggExpr::Array(vec![AggExpr::Literal(Value::Null), AggExpr::literal("")])],
                    ),
                    Serializer::Boolean,
                ))
            }
            ("IsNullOrWhiteSpace", [value]) => {
                let value = string_operand(ctx, value)?;
                let trimmed = AggExpr::named(
                    "$trim",
                    vec![("input", AggExpr::op("$ifNull", vec![value, AggExpr::literal("")]))],
                );
                Ok(Translated::new(AggExpr::op("$eq", vec![trimmed, AggExpr::literal("")]), Serializer::Boolean))
            }
            ("Concat", parts) => {
                let parts = parts
                    .iter()
                    .map(|part| string_operand(ctx, part))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Translated::new(AggExpr::op("$concat", parts), Serializer::String))
            }
            _ => Err(unsupported(expr, format!("string.{} is not supported", name))),
        },
        "Regex" if name == "IsMatch" => {
            let [input, pattern, rest @ ..] = args else {
                return Err(unsupported(expr, "Regex.IsMatch takes an input and a pattern"));
            };
            let Some(Value::String(pattern)) = pattern.as_constant() else {
                return Err(unsupported(expr, "the pattern must be constant"));
            };
            ctx.capabilities.require(Feature::RegexMatch)?;
            let input = string_operand(ctx, input)?;
            let options = regex_options(rest.first());
            Ok(Translated::new(regex_match(input, pattern.clone(), &options), Serializer::Boolean))
        }
        _ => Err(unsupported(expr, format!("{} is not supported", method))),
    }
}

/// Option letters for a `RegexOptions` constant.
pub(crate) fn regex_options(options: Option<&Expr>) -> String {
    let Some(Value::String(names)) = options.and_then(Expr::as_constant) else {
        return String::new();
    };
    let mut letters = String::new();
    for (name, letter) in [
        ("IgnoreCase", 'i'),
        ("Multiline", 'm'),
        ("Singleline", 's'),
        ("IgnorePatternWhitespace", 'x'),
    ] {
        if names.contains(name) {
            letters.push(letter);
        }
    }
    letters
}

fn math(
    ctx: &mut TranslationContext<'_>,
    expr: &Expr,
    name: &str,
    args: &[Expr],
) -> Result<Translated, TranslationError> {
    let args = args
        .iter()
        .map(|arg| translate_expression(ctx, arg))
        .collect::<Result<Vec<_>, _>>()?;
    let first_serializer = args.first().map(|a| a.serializer.clone()).unwrap_or(Serializer::Double);
    let mut asts = args.into_iter().map(|a| a.ast);
    let mut next = || asts.next().ok_or_else(|| unsupported(expr, format!("Math.{} is missing an argument", name)));

    Ok(match name {
        "Abs" | "Ceiling" | "Floor" | "Truncate" => {
            let op = match name {
                "Abs" => "$abs",
                "Ceiling" => "$ceil",
                "Floor" => "$floor",
                _ => "$trunc",
            };
            Translated::new(AggExpr::unary(op, next()?), first_serializer)
        }
        "Sqrt" | "Exp" | "Log10" => {
            let op = match name {
                "Sqrt" => "$sqrt",
                "Exp" => "$exp",
                _ => "$log10",
            };
            Translated::new(AggExpr::unary(op, next()?), Serializer::Double)
        }
        "Log" => {
            let value = next()?;
            match next() {
                Ok(base) => Translated::new(AggExpr::op("$log", vec![value, base]), Serializer::Double),
                Err(_) => Translated::new(AggExpr::unary("$ln", value), Serializer::Double),
            }
        }
        "Pow" => {
            let (base, exponent) = (next()?, next()?);
            Translated::new(AggExpr::op("$pow", vec![base, exponent]), Serializer::Double)
        }
        "Max" | "Min" => {
            let (a, b) = (next()?, next()?);
            let op = if name == "Max" { "$max" } else { "$min" };
            Translated::new(AggExpr::op(op, vec![a, b]), first_serializer)
        }
        "Round" => {
            let value = next()?;
            let digits = next().unwrap_or(AggExpr::literal(0));
            Translated::new(AggExpr::op("$round", vec![value, digits]), first_serializer)
        }
        _ => return Err(unsupported(expr, format!("Math.{} is not supported", name))),
    })
}
