//! Reference engine over in-memory collections.
//!
//! Runs the stage and operator subset the translator emits, with the
//! server's semantics where they differ from the query language: `$match`
//! field tests reach into arrays, missing fields are distinct from `null`,
//! and `$divide` always produces a fractional result. Anything else is
//! rejected with the index of the offending stage.

use std::{cmp::Ordering, collections::HashMap};

use chrono::{DateTime, Datelike, Months, TimeDelta, Timelike, Utc};
use regex::{Regex, RegexBuilder};
use rust_decimal::{
    Decimal, RoundingStrategy,
    prelude::{FromPrimitive, ToPrimitive},
};
use tracing::debug;

use super::{DocumentCursor, ExecutionAdapter, ExecutionError};
use crate::{
    ast::{BinOp, TypeRef},
    evaluator::{arithmetic, convert, standard_deviation},
    mql::{AggExpr, FieldOp, Filter, ProjectField, SortDirection, Stage},
    value::{Document, Value},
};

type EngineResult<T> = Result<T, String>;

/// Collections held in memory, keyed by name.
///
/// # Examples
///
/// ```
/// use docstage::{Value, doc};
/// use docstage::execution::{ExecutionAdapter, memory::InMemoryAdapter};
/// use docstage::mql::{FieldOp, Filter, Stage};
///
/// let adapter = InMemoryAdapter::new().with_collection(
///     "people",
///     vec![Value::Document(doc! { "_id" => 1, "X" => 1 }), Value::Document(doc! { "_id" => 2, "X" => 4 })],
/// );
/// let stages = [Stage::Match(Filter::field("X", FieldOp::Gt(2.into())))];
/// let found: Vec<Value> = adapter.aggregate("people", &stages).unwrap().map(Result::unwrap).collect();
/// assert_eq!(found, vec![Value::Document(doc! { "_id" => 2, "X" => 4 })]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryAdapter {
    collections: HashMap<String, Vec<Value>>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        InMemoryAdapter::default()
    }

    pub fn with_collection(mut self, name: impl Into<String>, documents: Vec<Value>) -> Self {
        self.insert(name, documents);
        self
    }

    /// Append documents to a collection, creating it if needed.
    pub fn insert(&mut self, name: impl Into<String>, documents: Vec<Value>) {
        self.collections.entry(name.into()).or_default().extend(documents);
    }
}

impl ExecutionAdapter for InMemoryAdapter {
    fn aggregate(&self, collection: &str, stages: &[Stage]) -> Result<DocumentCursor, ExecutionError> {
        let mut docs = self.collections.get(collection).cloned().unwrap_or_default();
        for (index, stage) in stages.iter().enumerate() {
            docs = exec_stage(stage, docs).map_err(|message| ExecutionError::StageRejected {
                index,
                stage: stage.to_string(),
                message,
            })?;
            debug!(index, stage = stage.name(), remaining = docs.len(), "ran stage");
        }
        Ok(Box::new(docs.into_iter().map(Ok)))
    }
}

// ---------------------------------------------------------------------------
// Stage execution
// ---------------------------------------------------------------------------

fn exec_stage(stage: &Stage, docs: Vec<Value>) -> EngineResult<Vec<Value>> {
    match stage {
        Stage::Match(filter) => exec_match(docs, filter),
        Stage::Project(fields) => docs.iter().map(|doc| project(fields, doc)).collect(),
        Stage::AddFields(fields) => docs
            .into_iter()
            .map(|doc| {
                let Value::Document(mut out) = doc.clone() else {
                    return Err("$addFields requires documents".to_string());
                };
                let vars = Vars::root(&doc);
                for (name, expr) in fields {
                    if let Some(value) = lookup(expr, &vars)? {
                        out.insert(name.clone(), value);
                    }
                }
                Ok(Value::Document(out))
            })
            .collect(),
        Stage::Group { id, accumulators } => exec_group(docs, id, accumulators),
        Stage::Sort(keys) => Ok(exec_sort(docs, keys)),
        Stage::Skip(n) => Ok(docs.into_iter().skip(window(*n)?).collect()),
        Stage::Limit(n) => Ok(docs.into_iter().take(window(*n)?).collect()),
        Stage::Unwind(path) => Ok(exec_unwind(docs, path)),
        Stage::ReplaceRoot(expr) | Stage::ReplaceWith(expr) => docs
            .iter()
            .map(|doc| match eval(expr, &Vars::root(doc))? {
                root @ Value::Document(_) => Ok(root),
                other => Err(format!("'newRoot' must evaluate to an object, not {}", other.type_name())),
            })
            .collect(),
        Stage::Count(field) => Ok(match docs.len() {
            0 => Vec::new(),
            n => vec![Value::Document(crate::doc! { field.as_str() => Value::Int32(n as i32) })],
        }),
    }
}

fn window(n: i64) -> EngineResult<usize> {
    usize::try_from(n).map_err(|_| format!("expected a non-negative number, found {}", n))
}

fn exec_match(docs: Vec<Value>, filter: &Filter) -> EngineResult<Vec<Value>> {
    let mut out = Vec::new();
    for doc in docs {
        if matches(filter, &doc)? {
            out.push(doc);
        }
    }
    Ok(out)
}

fn exec_group(
    docs: Vec<Value>,
    id: &AggExpr,
    accumulators: &[(String, crate::mql::Accumulator)],
) -> EngineResult<Vec<Value>> {
    // groups in order of first appearance
    let mut groups: Vec<(Value, Vec<Vec<Option<Value>>>)> = Vec::new();
    for doc in &docs {
        let vars = Vars::root(doc);
        let key = eval(id, &vars)?;
        let position = match groups.iter().position(|(k, _)| k.compare(&key) == Ordering::Equal) {
            Some(position) => position,
            None => {
                groups.push((key, vec![Vec::new(); accumulators.len()]));
                groups.len() - 1
            }
        };
        for (i, (_, accumulator)) in accumulators.iter().enumerate() {
            let value = lookup(&accumulator.arg, &vars)?;
            groups[position].1[i].push(value);
        }
    }
    groups
        .into_iter()
        .map(|(key, collected)| {
            let mut out = Document::new();
            out.insert("_id", key);
            for ((name, accumulator), values) in accumulators.iter().zip(collected) {
                out.insert(name.clone(), accumulate(&accumulator.op, values)?);
            }
            Ok(Value::Document(out))
        })
        .collect()
}

fn accumulate(op: &str, values: Vec<Option<Value>>) -> EngineResult<Value> {
    let present = || values.iter().flatten().cloned();
    match op {
        "$sum" => sum(present().filter(Value::is_number)),
        "$avg" => average(present().filter(Value::is_number).collect()),
        "$stdDevPop" | "$stdDevSamp" => Ok(deviation(op, present())),
        "$min" | "$max" => Ok(extreme(op == "$min", present().filter(|v| !v.is_null()))),
        "$first" => Ok(values.first().cloned().flatten().unwrap_or(Value::Null)),
        "$last" => Ok(values.last().cloned().flatten().unwrap_or(Value::Null)),
        "$push" => Ok(Value::Array(present().collect())),
        "$addToSet" => Ok(Value::Array(unique(present()))),
        other => Err(format!("unknown group operator '{}'", other)),
    }
}

fn exec_sort(mut docs: Vec<Value>, keys: &[(String, SortDirection)]) -> Vec<Value> {
    docs.sort_by(|a, b| {
        for (path, direction) in keys {
            let left = field_path(a, path).unwrap_or(Value::Null);
            let right = field_path(b, path).unwrap_or(Value::Null);
            let ordering = match direction {
                SortDirection::Ascending => left.compare(&right),
                SortDirection::Descending => right.compare(&left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    docs
}

fn exec_unwind(docs: Vec<Value>, path: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for doc in docs {
        let Value::Document(source) = &doc else {
            continue;
        };
        match source.get(path) {
            Some(Value::Array(items)) => {
                for item in items {
                    let mut copy = source.clone();
                    copy.insert(path, item.clone());
                    out.push(Value::Document(copy));
                }
            }
            Some(Value::Null) | None => {}
            Some(_) => out.push(doc.clone()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

fn project(fields: &[(String, ProjectField)], doc: &Value) -> EngineResult<Value> {
    let Value::Document(source) = doc else {
        return Err("$project requires documents".to_string());
    };
    let inclusion = fields.iter().any(|(_, f)| *f != ProjectField::Exclude);
    if !inclusion {
        let mut out = source.clone();
        for (name, _) in fields {
            out.remove(name);
        }
        return Ok(Value::Document(out));
    }

    let vars = Vars::root(doc);
    let mut out = Document::new();
    if !fields.iter().any(|(name, _)| name == "_id")
        && let Some(id) = source.get("_id")
    {
        out.insert("_id", id.clone());
    }
    for (name, field) in fields {
        match field {
            ProjectField::Include => {
                if let Some(value) = source.get_path(name) {
                    out.insert(name.clone(), value.clone());
                }
            }
            ProjectField::Exclude if name == "_id" => {}
            ProjectField::Exclude => {
                return Err(format!("cannot exclude '{}' in an inclusion projection", name));
            }
            ProjectField::Computed(expr) => {
                if let Some(value) = lookup(expr, &vars)? {
                    out.insert(name.clone(), value);
                }
            }
        }
    }
    Ok(Value::Document(out))
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

fn matches(filter: &Filter, value: &Value) -> EngineResult<bool> {
    match filter {
        Filter::True => Ok(true),
        Filter::False => Ok(false),
        Filter::And(filters) => {
            for filter in filters {
                if !matches(filter, value)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Filter::Or(filters) => {
            for filter in filters {
                if matches(filter, value)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Filter::Nor(filters) => {
            for filter in filters {
                if matches(filter, value)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Filter::Expr(expr) => Ok(eval(expr, &Vars::root(value))?.is_truthy()),
        Filter::Field { path, op } => {
            let candidates = if path.is_empty() {
                vec![value.clone()]
            } else {
                let segments: Vec<&str> = path.split('.').collect();
                let mut out = Vec::new();
                candidates(value, &segments, &mut out);
                out
            };
            field_matches(op, &candidates)
        }
    }
}

/// Values a dotted path reaches, descending into arrays along the way.
fn candidates(value: &Value, path: &[&str], out: &mut Vec<Value>) {
    let Some((segment, rest)) = path.split_first() else {
        out.push(value.clone());
        return;
    };
    match value {
        Value::Document(doc) => {
            if let Some(child) = doc.get(segment) {
                candidates(child, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = segment.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    candidates(item, rest, out);
                }
                return;
            }
            for item in items {
                if matches!(item, Value::Document(_)) {
                    candidates(item, path, out);
                }
            }
        }
        _ => {}
    }
}

/// A value and, for arrays, each element.
fn flattened(candidates: &[Value]) -> impl Iterator<Item = &Value> {
    candidates.iter().flat_map(|value| {
        let elements: &[Value] = match value {
            Value::Array(items) => items,
            _ => &[],
        };
        std::iter::once(value).chain(elements.iter())
    })
}

fn field_matches(op: &FieldOp, candidates: &[Value]) -> EngineResult<bool> {
    Ok(match op {
        FieldOp::Eq(wanted) => equals(wanted, candidates),
        FieldOp::Ne(wanted) => !equals(wanted, candidates),
        FieldOp::Gt(bound) => ordered(bound, candidates, |o| o == Ordering::Greater),
        FieldOp::Gte(bound) => ordered(bound, candidates, |o| o != Ordering::Less),
        FieldOp::Lt(bound) => ordered(bound, candidates, |o| o == Ordering::Less),
        FieldOp::Lte(bound) => ordered(bound, candidates, |o| o != Ordering::Greater),
        FieldOp::In(values) => values.iter().any(|v| equals(v, candidates)),
        FieldOp::Nin(values) => !values.iter().any(|v| equals(v, candidates)),
        FieldOp::Exists(present) => candidates.is_empty() != *present,
        FieldOp::Size(n) => candidates
            .iter()
            .any(|v| matches!(v, Value::Array(items) if items.len() as i64 == *n)),
        FieldOp::Regex { pattern, options } => {
            let regex = compile_regex(pattern, options)?;
            flattened(candidates).any(|v| matches!(v, Value::String(s) if regex.is_match(s)))
        }
        FieldOp::ElemMatch(inner) => {
            let mut found = false;
            for candidate in candidates {
                if let Value::Array(items) = candidate {
                    for item in items {
                        if matches(inner, item)? {
                            found = true;
                            break;
                        }
                    }
                }
            }
            found
        }
        FieldOp::Not(inner) => !field_matches(inner, candidates)?,
        FieldOp::Type(alias) => flattened(candidates).any(|v| has_type(v, alias)),
    })
}

fn equals(wanted: &Value, candidates: &[Value]) -> bool {
    if wanted.is_null() && candidates.is_empty() {
        return true;
    }
    flattened(candidates).any(|v| v.loose_eq(wanted))
}

fn ordered(bound: &Value, candidates: &[Value], accept: impl Fn(Ordering) -> bool) -> bool {
    flattened(candidates).any(|v| comparable(v, bound) && accept(v.compare(bound)))
}

/// Range tests only compare values of the same type bracket.
fn comparable(a: &Value, b: &Value) -> bool {
    (a.is_number() && b.is_number()) || std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn has_type(value: &Value, alias: &Value) -> bool {
    match alias {
        Value::String(name) if name == "number" => value.is_number(),
        Value::String(name) => type_alias(value) == name,
        code => match code.as_i64() {
            Some(1) => matches!(value, Value::Double(_)),
            Some(2) => matches!(value, Value::String(_)),
            Some(3) => matches!(value, Value::Document(_)),
            Some(4) => matches!(value, Value::Array(_)),
            Some(8) => matches!(value, Value::Boolean(_)),
            Some(9) => matches!(value, Value::DateTime(_)),
            Some(10) => value.is_null(),
            Some(16) => matches!(value, Value::Int32(_)),
            Some(18) => matches!(value, Value::Int64(_)),
            Some(19) => matches!(value, Value::Decimal(_)),
            _ => false,
        },
    }
}

fn type_alias(value: &Value) -> &'static str {
    value.type_name()
}

fn compile_regex(pattern: &str, options: &str) -> EngineResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| format!("invalid regular expression: {}", e))
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// Variables in scope: `ROOT`, `CURRENT` and the ones bound by `$map`,
/// `$filter`, `$reduce` and `$let`.
#[derive(Debug, Clone)]
struct Vars {
    bindings: Vec<(String, Value)>,
}

impl Vars {
    fn root(doc: &Value) -> Self {
        Vars {
            bindings: vec![("ROOT".into(), doc.clone()), ("CURRENT".into(), doc.clone())],
        }
    }

    fn with(&self, name: &str, value: Value) -> Self {
        let mut bindings = self.bindings.clone();
        bindings.push((name.to_string(), value));
        Vars { bindings }
    }

    fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Aggregation path semantics: a path through an array maps over its documents.
fn field_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value.clone();
    for segment in path.split('.') {
        current = match current {
            Value::Document(doc) => doc.get(segment)?.clone(),
            Value::Array(items) => {
                Value::Array(items.iter().filter_map(|item| field_path(item, segment)).collect())
            }
            _ => return None,
        };
    }
    Some(current)
}

fn eval(expr: &AggExpr, vars: &Vars) -> EngineResult<Value> {
    Ok(lookup(expr, vars)?.unwrap_or(Value::Null))
}

/// Evaluate, keeping missing fields apart from `null`.
fn lookup(expr: &AggExpr, vars: &Vars) -> EngineResult<Option<Value>> {
    match expr {
        AggExpr::Literal(value) => Ok(Some(value.clone())),
        AggExpr::Field(path) => {
            let current = vars.get("CURRENT").cloned().unwrap_or(Value::Null);
            Ok(field_path(&current, path))
        }
        AggExpr::Var { name, path } => {
            let value = vars
                .get(name)
                .ok_or_else(|| format!("use of undefined variable: {}", name))?;
            Ok(match path {
                Some(path) => field_path(value, path),
                None => Some(value.clone()),
            })
        }
        AggExpr::Document(fields) => {
            let mut out = Document::new();
            for (name, value) in fields {
                if let Some(value) = lookup(value, vars)? {
                    out.insert(name.clone(), value);
                }
            }
            Ok(Some(Value::Document(out)))
        }
        AggExpr::Array(items) => Ok(Some(Value::Array(
            items.iter().map(|item| eval(item, vars)).collect::<EngineResult<_>>()?,
        ))),
        AggExpr::Op { name, args } => {
            let args: Vec<&AggExpr> = args.iter().collect();
            positional(name, &args, vars).map(Some)
        }
        AggExpr::Unary { name, arg } => positional(name, &[arg.as_ref()], vars).map(Some),
        AggExpr::Named { name, args } => named(name, args, vars).map(Some),
    }
}

fn positional(name: &str, args: &[&AggExpr], vars: &Vars) -> EngineResult<Value> {
    // operators that look at their arguments before evaluating them
    match name {
        "$and" => {
            for arg in args {
                if !eval(arg, vars)?.is_truthy() {
                    return Ok(Value::Boolean(false));
                }
            }
            return Ok(Value::Boolean(true));
        }
        "$or" => {
            for arg in args {
                if eval(arg, vars)?.is_truthy() {
                    return Ok(Value::Boolean(true));
                }
            }
            return Ok(Value::Boolean(false));
        }
        "$type" => {
            let [arg] = args else {
                return Err(arity(name, 1, args.len()));
            };
            return Ok(Value::String(match lookup(arg, vars)? {
                Some(value) => type_alias(&value).to_string(),
                None => "missing".to_string(),
            }));
        }
        "$cond" => {
            let [test, if_true, if_false] = args else {
                return Err(arity(name, 3, args.len()));
            };
            let branch = if eval(test, vars)?.is_truthy() { if_true } else { if_false };
            return eval(branch, vars);
        }
        "$ifNull" => {
            let Some((fallback, values)) = args.split_last() else {
                return Err(arity(name, 2, 0));
            };
            for value in values {
                let value = eval(value, vars)?;
                if !value.is_null() {
                    return Ok(value);
                }
            }
            return eval(fallback, vars);
        }
        _ => {}
    }

    let values = args.iter().map(|arg| eval(arg, vars)).collect::<EngineResult<Vec<_>>>()?;
    match name {
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$cmp" => {
            let [left, right] = values.as_slice() else {
                return Err(arity(name, 2, values.len()));
            };
            let ordering = left.compare(right);
            Ok(match name {
                "$eq" => Value::Boolean(ordering == Ordering::Equal),
                "$ne" => Value::Boolean(ordering != Ordering::Equal),
                "$gt" => Value::Boolean(ordering == Ordering::Greater),
                "$gte" => Value::Boolean(ordering != Ordering::Less),
                "$lt" => Value::Boolean(ordering == Ordering::Less),
                "$lte" => Value::Boolean(ordering != Ordering::Greater),
                _ => Value::Int32(match ordering {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }),
            })
        }
        "$not" => match values.as_slice() {
            [value] => Ok(Value::Boolean(!value.is_truthy())),
            _ => Err(arity(name, 1, values.len())),
        },
        "$add" | "$subtract" | "$multiply" | "$divide" | "$mod" | "$pow" | "$log" => math_binary(name, &values),
        "$abs" | "$ceil" | "$floor" | "$sqrt" | "$exp" | "$ln" | "$log10" => math_unary(name, &values),
        "$trunc" | "$round" => rounding(name, &values),
        "$sum" | "$avg" | "$min" | "$max" | "$stdDevPop" | "$stdDevSamp" => {
            let items: Vec<Value> = match values.as_slice() {
                [Value::Array(items)] => items.clone(),
                other => other.to_vec(),
            };
            match name {
                "$sum" => sum(items.into_iter().filter(Value::is_number)),
                "$avg" => average(items.into_iter().filter(Value::is_number).collect()),
                "$stdDevPop" | "$stdDevSamp" => Ok(deviation(name, items.into_iter())),
                _ => Ok(extreme(name == "$min", items.into_iter().filter(|v| !v.is_null()))),
            }
        }
        "$toInt" | "$toLong" | "$toDouble" | "$toDecimal" | "$toString" | "$toBool" | "$toDate" => {
            let [value] = values.as_slice() else {
                return Err(arity(name, 1, values.len()));
            };
            conversion(name, value)
        }
        "$isArray" => match values.as_slice() {
            [value] => Ok(Value::Boolean(matches!(value, Value::Array(_)))),
            _ => Err(arity(name, 1, values.len())),
        },
        "$year" | "$month" | "$dayOfMonth" | "$hour" | "$minute" | "$second" | "$millisecond"
        | "$dayOfWeek" | "$dayOfYear" => {
            let [value] = values.as_slice() else {
                return Err(arity(name, 1, values.len()));
            };
            date_part(name, value)
        }
        _ => array_or_string(name, values),
    }
}

fn array_or_string(name: &str, values: Vec<Value>) -> EngineResult<Value> {
    match name {
        "$size" => match values.as_slice() {
            [Value::Array(items)] => Ok(Value::Int32(items.len() as i32)),
            [other] => Err(format!("the argument to $size must be an array, not {}", other.type_name())),
            _ => Err(arity(name, 1, values.len())),
        },
        "$in" => match values.as_slice() {
            [value, Value::Array(items)] => Ok(Value::Boolean(items.iter().any(|item| item.loose_eq(value)))),
            [_, other] => Err(format!("$in requires an array as its second argument, not {}", other.type_name())),
            _ => Err(arity(name, 2, values.len())),
        },
        "$arrayElemAt" => match values.as_slice() {
            [Value::Null, _] => Ok(Value::Null),
            [Value::Array(items), index] => {
                let index = index.as_i64().ok_or("$arrayElemAt needs an integer index")?;
                let position = if index < 0 { items.len() as i64 + index } else { index };
                Ok(usize::try_from(position)
                    .ok()
                    .and_then(|p| items.get(p))
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            _ => Err("$arrayElemAt takes an array and an index".to_string()),
        },
        "$slice" => slice(&values),
        "$concatArrays" => {
            let mut out = Vec::new();
            for value in values {
                match value {
                    Value::Null => return Ok(Value::Null),
                    Value::Array(items) => out.extend(items),
                    other => return Err(format!("$concatArrays only supports arrays, not {}", other.type_name())),
                }
            }
            Ok(Value::Array(out))
        }
        "$setUnion" | "$setIntersection" | "$setDifference" => sets(name, values),
        "$reverseArray" => match values.as_slice() {
            [Value::Array(items)] => Ok(Value::Array(items.iter().rev().cloned().collect())),
            [Value::Null] => Ok(Value::Null),
            _ => Err("$reverseArray takes an array".to_string()),
        },
        "$anyElementTrue" | "$allElementsTrue" => match values.as_slice() {
            [Value::Array(items)] => Ok(Value::Boolean(if name == "$anyElementTrue" {
                items.iter().any(Value::is_truthy)
            } else {
                items.iter().all(Value::is_truthy)
            })),
            _ => Err(format!("{} takes an array", name)),
        },
        "$objectToArray" => match values.as_slice() {
            [Value::Document(doc)] => Ok(Value::Array(
                doc.iter()
                    .map(|(k, v)| Value::Document(crate::doc! { "k" => k, "v" => v.clone() }))
                    .collect(),
            )),
            [Value::Null] => Ok(Value::Null),
            _ => Err("$objectToArray takes a document".to_string()),
        },
        "$concat" => {
            let mut out = String::new();
            for value in values {
                match value {
                    Value::Null => return Ok(Value::Null),
                    Value::String(s) => out.push_str(&s),
                    other => return Err(format!("$concat only supports strings, not {}", other.type_name())),
                }
            }
            Ok(Value::String(out))
        }
        "$toLower" | "$toUpper" => match values.as_slice() {
            [Value::Null] => Ok(Value::String(String::new())),
            [Value::String(s)] => Ok(Value::String(if name == "$toLower" { s.to_lowercase() } else { s.to_uppercase() })),
            _ => Err(format!("{} takes a string", name)),
        },
        "$strLenCP" => match values.as_slice() {
            [Value::String(s)] => Ok(Value::Int32(s.chars().count() as i32)),
            _ => Err("$strLenCP requires a string argument".to_string()),
        },
        "$substrCP" => match values.as_slice() {
            [Value::String(s), start, length] => {
                let start = start.as_i64().ok_or("$substrCP needs a numeric start")?.max(0) as usize;
                let length = length.as_i64().ok_or("$substrCP needs a numeric length")?.max(0) as usize;
                Ok(Value::String(s.chars().skip(start).take(length).collect()))
            }
            [Value::Null, _, _] => Ok(Value::String(String::new())),
            _ => Err(arity(name, 3, values.len())),
        },
        "$indexOfCP" => match values.as_slice() {
            [Value::Null, ..] => Ok(Value::Null),
            [Value::String(s), Value::String(sub), rest @ ..] => {
                let from = rest.first().and_then(Value::as_i64).unwrap_or(0).max(0) as usize;
                let chars: Vec<char> = s.chars().collect();
                let needle: Vec<char> = sub.chars().collect();
                let found = (from..=chars.len().saturating_sub(needle.len()))
                    .find(|&i| chars.get(i..i + needle.len()) == Some(needle.as_slice()));
                Ok(Value::Int32(found.map_or(-1, |i| i as i32)))
            }
            _ => Err("$indexOfCP takes strings".to_string()),
        },
        "$split" => match values.as_slice() {
            [Value::Null, _] => Ok(Value::Null),
            [Value::String(s), Value::String(separator)] if !separator.is_empty() => Ok(Value::Array(
                s.split(separator.as_str()).map(|part| Value::String(part.to_string())).collect(),
            )),
            _ => Err("$split takes a string and a non-empty separator".to_string()),
        },
        "$strcasecmp" => match values.as_slice() {
            [left, right] => {
                let text = |v: &Value| match v {
                    Value::Null => String::new(),
                    Value::String(s) => s.to_uppercase(),
                    other => other.to_string(),
                };
                Ok(Value::Int32(match text(left).cmp(&text(right)) {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }))
            }
            _ => Err(arity(name, 2, values.len())),
        },
        other => Err(format!("unrecognized expression '{}'", other)),
    }
}

fn named(name: &str, args: &[(String, AggExpr)], vars: &Vars) -> EngineResult<Value> {
    let arg = |key: &str| args.iter().find(|(k, _)| k == key).map(|(_, v)| v);
    let required = |key: &str| arg(key).ok_or_else(|| format!("{} requires '{}'", name, key));
    let variable = |key: &str| -> EngineResult<String> {
        match required(key)?.as_literal() {
            Some(Value::String(var)) => Ok(var.clone()),
            _ => Err(format!("{} needs a variable name for '{}'", name, key)),
        }
    };
    match name {
        "$map" | "$filter" => {
            let items = match eval(required("input")?, vars)? {
                Value::Null => return Ok(Value::Null),
                Value::Array(items) => items,
                other => return Err(format!("input to {} must be an array, not {}", name, other.type_name())),
            };
            let var = variable("as")?;
            if name == "$map" {
                let body = required("in")?;
                let mapped = items
                    .into_iter()
                    .map(|item| eval(body, &vars.with(&var, item)))
                    .collect::<EngineResult<_>>()?;
                return Ok(Value::Array(mapped));
            }
            let cond = required("cond")?;
            let limit = match arg("limit") {
                Some(limit) => eval(limit, vars)?.as_i64().map(|n| n.max(0) as usize),
                None => None,
            };
            let mut kept = Vec::new();
            for item in items {
                if limit.is_some_and(|n| kept.len() >= n) {
                    break;
                }
                if eval(cond, &vars.with(&var, item.clone()))?.is_truthy() {
                    kept.push(item);
                }
            }
            Ok(Value::Array(kept))
        }
        "$reduce" => {
            let items = match eval(required("input")?, vars)? {
                Value::Null => return Ok(Value::Null),
                Value::Array(items) => items,
                other => return Err(format!("input to $reduce must be an array, not {}", other.type_name())),
            };
            let body = required("in")?;
            let mut accumulated = eval(required("initialValue")?, vars)?;
            for item in items {
                accumulated = eval(body, &vars.with("value", accumulated).with("this", item))?;
            }
            Ok(accumulated)
        }
        "$let" => {
            let Some(AggExpr::Document(bindings)) = arg("vars") else {
                return Err("$let requires a 'vars' document".to_string());
            };
            let mut scope = vars.clone();
            for (var, value) in bindings {
                scope = scope.with(var, eval(value, vars)?);
            }
            eval(required("in")?, &scope)
        }
        "$cond" => {
            let branch = if eval(required("if")?, vars)?.is_truthy() { "then" } else { "else" };
            eval(required(branch)?, vars)
        }
        "$zip" => {
            let Value::Array(inputs) = eval(required("inputs")?, vars)? else {
                return Err("$zip requires an array of inputs".to_string());
            };
            let mut arrays = Vec::with_capacity(inputs.len());
            for input in inputs {
                match input {
                    Value::Null => return Ok(Value::Null),
                    Value::Array(items) => arrays.push(items),
                    other => return Err(format!("$zip inputs must be arrays, not {}", other.type_name())),
                }
            }
            let length = arrays.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::Array(
                (0..length)
                    .map(|i| Value::Array(arrays.iter().map(|a| a[i].clone()).collect()))
                    .collect(),
            ))
        }
        "$trim" | "$ltrim" | "$rtrim" => {
            let input = match eval(required("input")?, vars)? {
                Value::Null => return Ok(Value::Null),
                Value::String(s) => s,
                other => return Err(format!("{} requires a string input, not {}", name, other.type_name())),
            };
            let chars: Vec<char> = match arg("chars") {
                Some(chars) => match eval(chars, vars)? {
                    Value::String(s) => s.chars().collect(),
                    _ => return Err(format!("{} 'chars' must be a string", name)),
                },
                None => vec![' ', '\t', '\n', '\r', '\u{0}', '\u{b}', '\u{c}'],
            };
            let trimmed = match name {
                "$trim" => input.trim_matches(chars.as_slice()),
                "$ltrim" => input.trim_start_matches(chars.as_slice()),
                _ => input.trim_end_matches(chars.as_slice()),
            };
            Ok(Value::String(trimmed.to_string()))
        }
        "$replaceAll" => {
            let values = ["input", "find", "replacement"]
                .iter()
                .map(|key| eval(required(key)?, vars))
                .collect::<EngineResult<Vec<_>>>()?;
            match values.as_slice() {
                [Value::String(input), Value::String(find), Value::String(replacement)] => {
                    Ok(Value::String(input.replace(find.as_str(), replacement)))
                }
                [a, b, c] if a.is_null() || b.is_null() || c.is_null() => Ok(Value::Null),
                _ => Err("$replaceAll takes strings".to_string()),
            }
        }
        "$regexMatch" => {
            let input = eval(required("input")?, vars)?;
            let (pattern, mut options) = match eval(required("regex")?, vars)? {
                Value::Regex { pattern, options } => (pattern, options),
                Value::String(pattern) => (pattern, String::new()),
                other => return Err(format!("$regexMatch needs a regex, not {}", other.type_name())),
            };
            if let Some(extra) = arg("options") {
                options.push_str(eval(extra, vars)?.as_str().unwrap_or_default());
            }
            let regex = compile_regex(&pattern, &options)?;
            match input {
                Value::String(s) => Ok(Value::Boolean(regex.is_match(&s))),
                Value::Null => Ok(Value::Boolean(false)),
                other => Err(format!("$regexMatch needs a string input, not {}", other.type_name())),
            }
        }
        "$dateAdd" => {
            let start = eval(required("startDate")?, vars)?;
            let unit = eval(required("unit")?, vars)?;
            let amount = eval(required("amount")?, vars)?;
            match (start, unit, amount.as_i64()) {
                (Value::Null, _, _) => Ok(Value::Null),
                (Value::DateTime(ms), Value::String(unit), Some(amount)) => date_add(ms, &unit, amount),
                _ => Err("$dateAdd takes a date, a unit and an integer amount".to_string()),
            }
        }
        other => Err(format!("unrecognized expression '{}'", other)),
    }
}

fn arity(name: &str, expected: usize, actual: usize) -> String {
    format!("{} takes {} argument(s), got {}", name, expected, actual)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sum(values: impl Iterator<Item = Value>) -> EngineResult<Value> {
    let mut total = Value::Int32(0);
    for value in values {
        total = match (&total, &value) {
            // int32 overflow widens to a long
            (Value::Int32(a), Value::Int32(b)) => match a.checked_add(*b) {
                Some(n) => Value::Int32(n),
                None => Value::Int64(*a as i64 + *b as i64),
            },
            _ => arithmetic(BinOp::Add, &total, &value).map_err(|e| e.to_string())?,
        };
    }
    Ok(total)
}

fn average(values: Vec<Value>) -> EngineResult<Value> {
    if values.is_empty() {
        return Ok(Value::Null);
    }
    let count = values.len();
    Ok(match sum(values.into_iter())? {
        Value::Decimal(total) => Value::Decimal(total / Decimal::from(count)),
        total => Value::Double(total.as_f64().unwrap_or(f64::NAN) / count as f64),
    })
}

/// `$stdDevPop`/`$stdDevSamp`: non-numbers are ignored, undefined is null.
fn deviation(op: &str, values: impl Iterator<Item = Value>) -> Value {
    let numbers: Vec<f64> = values.filter(Value::is_number).filter_map(|v| v.as_f64()).collect();
    standard_deviation(&numbers, op == "$stdDevSamp")
        .map(Value::Double)
        .unwrap_or(Value::Null)
}

fn extreme(min: bool, values: impl Iterator<Item = Value>) -> Value {
    let wanted = if min { Ordering::Less } else { Ordering::Greater };
    values
        .reduce(|best, value| if value.compare(&best) == wanted { value } else { best })
        .unwrap_or(Value::Null)
}

fn unique(values: impl Iterator<Item = Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for value in values {
        if !out.iter().any(|v| v.loose_eq(&value)) {
            out.push(value);
        }
    }
    out
}

fn sets(name: &str, values: Vec<Value>) -> EngineResult<Value> {
    let mut arrays = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::Null => return Ok(Value::Null),
            Value::Array(items) => arrays.push(items),
            other => return Err(format!("{} only supports arrays, not {}", name, other.type_name())),
        }
    }
    let contains = |items: &[Value], value: &Value| items.iter().any(|v| v.loose_eq(value));
    let result = match (name, arrays.as_slice()) {
        ("$setUnion", _) => unique(arrays.iter().flatten().cloned()),
        ("$setIntersection", [first, rest @ ..]) => unique(
            first
                .iter()
                .filter(|v| rest.iter().all(|other| contains(other, v)))
                .cloned(),
        ),
        ("$setDifference", [first, second]) => {
            unique(first.iter().filter(|v| !contains(second, v)).cloned())
        }
        _ => return Err(format!("{} received {} arrays", name, arrays.len())),
    };
    Ok(Value::Array(result))
}

fn slice(values: &[Value]) -> EngineResult<Value> {
    let (items, start, count) = match values {
        [Value::Null, ..] => return Ok(Value::Null),
        [Value::Array(items), n] => {
            let n = n.as_i64().ok_or("$slice needs an integer count")?;
            if n >= 0 {
                (items, 0, n)
            } else {
                (items, (items.len() as i64 + n).max(0), -n)
            }
        }
        [Value::Array(items), position, n] => {
            let position = position.as_i64().ok_or("$slice needs an integer position")?;
            let n = n.as_i64().ok_or("$slice needs an integer count")?;
            let start = if position < 0 { (items.len() as i64 + position).max(0) } else { position };
            (items, start, n.max(0))
        }
        _ => return Err("$slice takes an array and one or two integers".to_string()),
    };
    Ok(Value::Array(
        items.iter().skip(start as usize).take(count.max(0) as usize).cloned().collect(),
    ))
}

fn math_binary(name: &str, values: &[Value]) -> EngineResult<Value> {
    if values.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }
    let fail = |e: crate::evaluator::EvalError| e.to_string();
    match (name, values) {
        ("$add", _) => {
            // a date plus milliseconds stays a date
            let mut date = None;
            let mut numbers = Vec::new();
            for value in values {
                match value {
                    Value::DateTime(ms) if date.is_none() => date = Some(*ms),
                    other => numbers.push(other.clone()),
                }
            }
            let total = sum(numbers.into_iter())?;
            Ok(match date {
                Some(ms) => Value::DateTime(ms + total.as_f64().unwrap_or(0.0) as i64),
                None => total,
            })
        }
        ("$multiply", _) => {
            let mut product = Value::Int32(1);
            for value in values {
                product = arithmetic(BinOp::Multiply, &product, value).map_err(fail)?;
            }
            Ok(product)
        }
        ("$subtract", [Value::DateTime(a), Value::DateTime(b)]) => Ok(Value::Int64(a - b)),
        ("$subtract", [Value::DateTime(a), n]) => Ok(Value::DateTime(a - n.as_f64().unwrap_or(0.0) as i64)),
        ("$subtract", [a, b]) => arithmetic(BinOp::Subtract, a, b).map_err(fail),
        ("$mod", [a, b]) => arithmetic(BinOp::Modulo, a, b).map_err(fail),
        ("$divide", [a, b]) => match (a, b) {
            (Value::Decimal(_), _) | (_, Value::Decimal(_)) => {
                let (x, y) = (decimal(a)?, decimal(b)?);
                if y.is_zero() {
                    return Err("can't $divide by zero".to_string());
                }
                Ok(Value::Decimal(x / y))
            }
            _ => {
                let (x, y) = (number(a)?, number(b)?);
                if y == 0.0 {
                    return Err("can't $divide by zero".to_string());
                }
                Ok(Value::Double(x / y))
            }
        },
        ("$pow", [base, exponent]) => {
            if let (Some(b), Some(e)) = (base.as_i64(), exponent.as_i64())
                && !matches!(base, Value::Double(_) | Value::Decimal(_))
                && e >= 0
                && let Some(result) = u32::try_from(e).ok().and_then(|e| b.checked_pow(e))
            {
                return Ok(match i32::try_from(result) {
                    Ok(n) if matches!(base, Value::Int32(_)) => Value::Int32(n),
                    _ => Value::Int64(result),
                });
            }
            Ok(Value::Double(number(base)?.powf(number(exponent)?)))
        }
        ("$log", [value, base]) => Ok(Value::Double(number(value)?.log(number(base)?))),
        _ => Err(arity(name, 2, values.len())),
    }
}

fn math_unary(name: &str, values: &[Value]) -> EngineResult<Value> {
    let [value] = values else {
        return Err(arity(name, 1, values.len()));
    };
    match (name, value) {
        (_, Value::Null) => Ok(Value::Null),
        ("$abs", Value::Int32(n)) => Ok(Value::Int32(n.abs())),
        ("$abs", Value::Int64(n)) => Ok(Value::Int64(n.abs())),
        ("$abs", Value::Decimal(d)) => Ok(Value::Decimal(d.abs())),
        ("$ceil" | "$floor", Value::Int32(_) | Value::Int64(_)) => Ok(value.clone()),
        ("$ceil", Value::Decimal(d)) => Ok(Value::Decimal(d.ceil())),
        ("$floor", Value::Decimal(d)) => Ok(Value::Decimal(d.floor())),
        _ => {
            let x = number(value)?;
            Ok(Value::Double(match name {
                "$abs" => x.abs(),
                "$ceil" => x.ceil(),
                "$floor" => x.floor(),
                "$sqrt" => x.sqrt(),
                "$exp" => x.exp(),
                "$ln" => x.ln(),
                _ => x.log10(),
            }))
        }
    }
}

fn rounding(name: &str, values: &[Value]) -> EngineResult<Value> {
    let (value, places) = match values {
        [value] => (value, 0),
        [value, places] => (value, places.as_i64().ok_or_else(|| format!("{} needs integer places", name))?),
        _ => return Err(arity(name, 2, values.len())),
    };
    let strategy = if name == "$round" {
        RoundingStrategy::MidpointNearestEven
    } else {
        RoundingStrategy::ToZero
    };
    let places = u32::try_from(places).unwrap_or(0);
    match value {
        Value::Null => Ok(Value::Null),
        Value::Int32(_) | Value::Int64(_) => Ok(value.clone()),
        Value::Decimal(d) => Ok(Value::Decimal(d.round_dp_with_strategy(places, strategy))),
        other => {
            let x = number(other)?;
            let rounded = Decimal::from_f64(x)
                .map(|d| d.round_dp_with_strategy(places, strategy))
                .and_then(|d| d.to_f64())
                .unwrap_or(x);
            Ok(Value::Double(rounded))
        }
    }
}

fn number(value: &Value) -> EngineResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| format!("expected a number, found {}", value.type_name()))
}

fn decimal(value: &Value) -> EngineResult<Decimal> {
    value
        .as_decimal()
        .ok_or_else(|| format!("expected a number, found {}", value.type_name()))
}

fn conversion(name: &str, value: &Value) -> EngineResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let target = match name {
        "$toInt" => TypeRef::Int32,
        "$toLong" => TypeRef::Int64,
        "$toDouble" => TypeRef::Double,
        "$toDecimal" => TypeRef::Decimal,
        "$toString" => TypeRef::String,
        "$toDate" => TypeRef::DateTime,
        _ => return Ok(Value::Boolean(value.is_truthy())),
    };
    match (name, value) {
        ("$toInt" | "$toLong" | "$toDouble" | "$toDecimal", Value::String(s)) => {
            let parsed = s.trim().parse::<f64>().map_err(|_| format!("failed to parse number '{}'", s))?;
            convert(&Value::Double(parsed), &target).map_err(|e| e.to_string())
        }
        ("$toDate", Value::Int64(ms)) => Ok(Value::DateTime(*ms)),
        _ => convert(value, &target).map_err(|e| e.to_string()),
    }
}

fn datetime(ms: i64) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| format!("date out of range: {}", ms))
}

fn date_part(name: &str, value: &Value) -> EngineResult<Value> {
    let ms = match value {
        Value::Null => return Ok(Value::Null),
        Value::DateTime(ms) => *ms,
        other => return Err(format!("{} requires a date, not {}", name, other.type_name())),
    };
    let date = datetime(ms)?;
    let part = match name {
        "$year" => date.year() as i64,
        "$month" => date.month() as i64,
        "$dayOfMonth" => date.day() as i64,
        "$hour" => date.hour() as i64,
        "$minute" => date.minute() as i64,
        "$second" => date.second() as i64,
        "$millisecond" => (date.timestamp_subsec_millis()) as i64,
        // Sunday is 1
        "$dayOfWeek" => date.weekday().num_days_from_sunday() as i64 + 1,
        _ => date.ordinal() as i64,
    };
    Ok(Value::Int32(part as i32))
}

fn date_add(ms: i64, unit: &str, amount: i64) -> EngineResult<Value> {
    let date = datetime(ms)?;
    let months = |n: i64| -> EngineResult<DateTime<Utc>> {
        let shifted = if n >= 0 {
            date.checked_add_months(Months::new(n as u32))
        } else {
            date.checked_sub_months(Months::new(n.unsigned_abs() as u32))
        };
        shifted.ok_or_else(|| "date out of range".to_string())
    };
    let delta = |d: Option<TimeDelta>| -> EngineResult<DateTime<Utc>> {
        d.and_then(|d| date.checked_add_signed(d)).ok_or_else(|| "date out of range".to_string())
    };
    let shifted = match unit {
        "year" => months(amount * 12)?,
        "quarter" => months(amount * 3)?,
        "month" => months(amount)?,
        "week" => delta(TimeDelta::try_weeks(amount))?,
        "day" => delta(TimeDelta::try_days(amount))?,
        "hour" => delta(TimeDelta::try_hours(amount))?,
        "minute" => delta(TimeDelta::try_minutes(amount))?,
        "second" => delta(TimeDelta::try_seconds(amount))?,
        "millisecond" => delta(TimeDelta::try_milliseconds(amount))?,
        other => return Err(format!("unknown $dateAdd unit '{}'", other)),
    };
    Ok(Value::DateTime(shifted.timestamp_millis()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn people() -> InMemoryAdapter {
        InMemoryAdapter::new().with_collection(
            "people",
            vec![
                Value::Document(doc! { "_id" => 1, "Name" => "John", "Tags" => vec![Value::from("a"), Value::from("b")] }),
                Value::Document(doc! { "_id" => 2, "Name" => "Jane", "Tags" => Vec::<Value>::new() }),
                Value::Document(doc! { "_id" => 3, "Name" => "John" }),
            ],
        )
    }

    fn run(stages: &[Stage]) -> Result<Vec<Value>, ExecutionError> {
        people().aggregate("people", stages)?.collect()
    }

    #[test]
    fn field_equality_reaches_into_arrays() {
        let found = run(&[Stage::Match(Filter::field("Tags", FieldOp::Eq("b".into())))]).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn unknown_operator_names_the_stage() {
        let stages = [
            Stage::Limit(5),
            Stage::Project(vec![(
                "x".into(),
                ProjectField::Computed(AggExpr::unary("$bogus", AggExpr::field("Name"))),
            )]),
        ];
        match run(&stages) {
            Err(ExecutionError::StageRejected { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected a rejected stage, got {:?}", other),
        }
    }

    #[test]
    fn missing_fields_are_left_out_of_projections() {
        let stages = [Stage::Project(vec![
            ("Tags".into(), ProjectField::Computed(AggExpr::field("Tags"))),
            ("_id".into(), ProjectField::Exclude),
        ])];
        let found = run(&stages).unwrap();
        assert_eq!(found[2], Value::Document(Document::new()));
    }

    #[test]
    fn groups_keep_first_appearance_order() {
        let stages = [Stage::Group {
            id: AggExpr::field("Name"),
            accumulators: vec![("n".into(), crate::mql::Accumulator::new("$sum", AggExpr::literal(1)))],
        }];
        let found = run(&stages).unwrap();
        assert_eq!(
            found,
            vec![
                Value::Document(doc! { "_id" => "John", "n" => 2 }),
                Value::Document(doc! { "_id" => "Jane", "n" => 1 }),
            ]
        );
    }
}
