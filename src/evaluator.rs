//! Client-side interpreter for canonical expressions.
//!
//! The normalizer uses it to fold closed subtrees into constants, and the
//! residual function uses it to run the client-side part of a query against
//! documents returned by the server. Semantics follow the query language
//! (integer division truncates, `+` concatenates strings, comparisons with
//! `null` are false) rather than the server's aggregation semantics.

use std::cmp::Ordering;

use chrono::{Datelike, Months, TimeZone, Timelike, Utc};
use regex::RegexBuilder;
use rust_decimal::{
    Decimal, RoundingStrategy,
    prelude::{FromPrimitive, ToPrimitive},
};
use thiserror::Error;

use crate::{
    ast::{BinOp, Expr, TypeRef, UnaryOp},
    environment::Environment,
    value::{Document, Value},
};

/// Bindings visible while evaluating an expression.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    /// Lambda parameters, innermost last
    bindings: Vec<(String, Value)>,
    /// Values computed by the server for a client-side projection
    snippets: Vec<Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        EvalContext::default()
    }

    /// Create a new context with one more parameter bound
    pub fn with_binding(&self, name: &str, value: Value) -> Self {
        let mut bindings = self.bindings.clone();
        bindings.push((name.to_string(), value));
        EvalContext {
            bindings,
            snippets: self.snippets.clone(),
        }
    }

    pub fn with_snippets(mut self, snippets: Vec<Value>) -> Self {
        self.snippets = snippets;
        self
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.bindings.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Errors that can occur during client-side evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// Type mismatch or invalid operation for the given type
    #[error("type error: {0}")]
    TypeError(String),

    /// Invalid member, key or index access
    #[error("access error: {0}")]
    AccessError(String),

    /// Reference to a parameter with no binding
    #[error("unbound parameter '{0}'")]
    UnboundParameter(String),

    #[error("division by zero")]
    DivisionByZero,

    /// Operation on an empty sequence or similar invalid state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The node needs information only the server has
    #[error("'{0}' cannot be evaluated on the client")]
    NotEvaluable(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// Raised by a host function
    #[error("host function '{name}' failed: {message}")]
    HostFunction { name: String, message: String },
}

/// Name of a value's type, for error messages.
pub fn type_name(value: &Value) -> &'static str {
    value.type_name()
}

/// The client-side query interpreter.
pub struct Evaluator<'e> {
    env: &'e Environment,
}

impl<'e> Evaluator<'e> {
    pub fn new(env: &'e Environment) -> Self {
        Evaluator { env }
    }

    /// Evaluate an expression with no parameters bound.
    pub fn evaluate_closed(&self, expr: &Expr) -> Result<Value, EvalError> {
        self.evaluate(expr, &EvalContext::new())
    }

    pub fn evaluate(&self, expr: &Expr, ctx: &EvalContext) -> Result<Value, EvalError> {
        match expr {
            Expr::Constant(value) => Ok(value.clone()),
            Expr::Parameter(name) => ctx
                .lookup(name)
                .cloned()
                .ok_or_else(|| EvalError::UnboundParameter(name.clone())),
            Expr::Identifier(name) => match ctx.lookup(name).or_else(|| self.env.capture(name)) {
                Some(value) => Ok(value.clone()),
                None => Err(EvalError::NotEvaluable(name.clone())),
            },
            Expr::Snippet(index) => ctx
                .snippets
                .get(*index)
                .cloned()
                .ok_or_else(|| EvalError::AccessError(format!("snippet {} is missing", index))),
            Expr::Source(_) | Expr::Lambda { .. } => Err(EvalError::NotEvaluable(expr.to_string())),
            Expr::Member { target, name } => {
                let target = self.evaluate(target, ctx)?;
                self.apply_member(&target, name)
            }
            Expr::Index { target, index } => {
                let target = self.evaluate(target, ctx)?;
                let index = self.evaluate(index, ctx)?;
                self.apply_index(&target, &index)
            }
            Expr::Call { target: Some(target), method, type_args, args } => {
                let target = self.evaluate(target, ctx)?;
                self.apply_method(&target, method, type_args, args, ctx)
            }
            Expr::Call { target: None, method, args, .. } => {
                let values = args
                    .iter()
                    .map(|a| self.evaluate(a, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                self.apply_static(method, &values)
            }
            Expr::Unary { op, operand } => {
                let value = self.evaluate(operand, ctx)?;
                match op {
                    UnaryOp::Not => match value {
                        Value::Boolean(b) => Ok(Value::Boolean(!b)),
                        other => Err(EvalError::TypeError(format!(
                            "cannot negate {}",
                            type_name(&other)
                        ))),
                    },
                    UnaryOp::Negate => arithmetic(BinOp::Subtract, &Value::Int32(0), &value),
                }
            }
            Expr::Binary { op: BinOp::AndAlso, left, right } => {
                if !self.evaluate_bool(left, ctx)? {
                    return Ok(Value::Boolean(false));
                }
                Ok(Value::Boolean(self.evaluate_bool(right, ctx)?))
            }
            Expr::Binary { op: BinOp::OrElse, left, right } => {
                if self.evaluate_bool(left, ctx)? {
                    return Ok(Value::Boolean(true));
                }
                Ok(Value::Boolean(self.evaluate_bool(right, ctx)?))
            }
            Expr::Binary { op: BinOp::Coalesce, left, right } => {
                let left = self.evaluate(left, ctx)?;
                if left.is_null() {
                    return self.evaluate(right, ctx);
                }
                Ok(left)
            }
            Expr::Binary { op, left, right } => {
                let left = self.evaluate(left, ctx)?;
                let right = self.evaluate(right, ctx)?;
                apply_binop(*op, &left, &right)
            }
            Expr::Conditional { test, if_true, if_false } => {
                if self.evaluate_bool(test, ctx)? {
                    self.evaluate(if_true, ctx)
                } else {
                    self.evaluate(if_false, ctx)
                }
            }
            Expr::New { members, .. } => {
                let mut doc = Document::new();
                for (name, value) in members {
                    doc.insert(name.clone(), self.evaluate(value, ctx)?);
                }
                Ok(Value::Document(doc))
            }
            Expr::NewArray(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|i| self.evaluate(i, ctx))
                    .collect::<Result<_, _>>()?,
            )),
            Expr::Convert { operand, to } => {
                let value = self.evaluate(operand, ctx)?;
                convert(&value, to)
            }
            Expr::TypeIs { operand, type_name } => {
                let value = self.evaluate(operand, ctx)?;
                Ok(Value::Boolean(has_discriminator(&value, type_name)))
            }
            Expr::StringEquals { left, right, ignore_case } => {
                let left = self.evaluate(left, ctx)?;
                let right = self.evaluate(right, ctx)?;
                Ok(Value::Boolean(match (&left, &right) {
                    (Value::String(a), Value::String(b)) if *ignore_case => {
                        a.to_lowercase() == b.to_lowercase()
                    }
                    (a, b) => a == b,
                }))
            }
        }
    }

    fn evaluate_bool(&self, expr: &Expr, ctx: &EvalContext) -> Result<bool, EvalError> {
        match self.evaluate(expr, ctx)? {
            Value::Boolean(b) => Ok(b),
            other => Err(EvalError::TypeError(format!(
                "expected a boolean, found {}",
                type_name(&other)
            ))),
        }
    }

    /// Invoke a lambda expression with positional arguments.
    pub fn apply_lambda(
        &self,
        lambda: &Expr,
        args: &[Value],
        ctx: &EvalContext,
    ) -> Result<Value, EvalError> {
        match lambda {
            Expr::Lambda { params, body } if params.len() == args.len() => {
                let mut inner = ctx.clone();
                for (param, arg) in params.iter().zip(args) {
                    inner = inner.with_binding(param, arg.clone());
                }
                self.evaluate(body, &inner)
            }
            Expr::Lambda { params, .. } => Err(EvalError::TypeError(format!(
                "lambda expects {} arguments, got {}",
                params.len(),
                args.len()
            ))),
            other => Err(EvalError::TypeError(format!("{} is not a lambda", other))),
        }
    }

    fn apply_member(&self, target: &Value, name: &str) -> Result<Value, EvalError> {
        match (target, name) {
            (Value::Null, "HasValue") => Ok(Value::Boolean(false)),
            (Value::Null, _) => Err(EvalError::AccessError(format!(
                "cannot read member '{}' of null",
                name
            ))),
            (_, "HasValue") => Ok(Value::Boolean(true)),
            (Value::Document(doc), _) => match doc.get(name) {
                Some(value) => Ok(value.clone()),
                None => match name {
                    "Count" => Ok(Value::Int32(doc.len() as i32)),
                    "Keys" => Ok(Value::Array(doc.keys().map(Value::from).collect())),
                    "Values" => Ok(Value::Array(doc.values().cloned().collect())),
                    _ => Ok(Value::Null),
                },
            },
            (_, "Value") => Ok(target.clone()),
            (Value::String(s), "Length") => Ok(Value::Int32(s.chars().count() as i32)),
            (Value::Array(items), "Length" | "Count") => Ok(Value::Int32(items.len() as i32)),
            (Value::DateTime(ms), _) => date_member(*ms, name),
            _ => Err(EvalError::AccessError(format!(
                "{} has no member '{}'",
                type_name(target),
                name
            ))),
        }
    }

    fn apply_index(&self, target: &Value, index: &Value) -> Result<Value, EvalError> {
        match (target, index) {
            (Value::Array(items), i) if i.as_i64().is_some() => {
                let i = i.as_i64().unwrap_or_default();
                usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .ok_or_else(|| EvalError::AccessError(format!("index {} is out of range", i)))
            }
            (Value::Document(doc), Value::String(key)) => doc
                .get(key)
                .cloned()
                .ok_or_else(|| EvalError::AccessError(format!("key '{}' was not present", key))),
            (Value::String(s), i) if i.as_i64().is_some() => {
                let i = i.as_i64().unwrap_or_default();
                usize::try_from(i)
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::String(c.to_string()))
                    .ok_or_else(|| EvalError::AccessError(format!("index {} is out of range", i)))
            }
            (t, i) => Err(EvalError::TypeError(format!(
                "cannot index {} with {}",
                type_name(t),
                type_name(i)
            ))),
        }
    }

    fn apply_method(
        &self,
        target: &Value,
        method: &str,
        type_args: &[TypeRef],
        args: &[Expr],
        ctx: &EvalContext,
    ) -> Result<Value, EvalError> {
        // Methods with lambda arguments are handled before evaluating arguments.
        if let Value::Array(items) = target {
            return self.apply_sequence_method(items, method, type_args, args, ctx);
        }
        if let Value::Document(doc) = target
            && !matches!(method, "ContainsKey" | "ContainsValue" | "Equals" | "ToString")
        {
            let pairs = doc
                .iter()
                .map(|(k, v)| Value::Document(crate::doc! { "k" => k, "v" => v.clone() }))
                .collect::<Vec<_>>();
            return self.apply_sequence_method(&pairs, method, type_args, args, ctx);
        }

        let values = args
            .iter()
            .map(|a| self.evaluate(a, ctx))
            .collect::<Result<Vec<_>, _>>()?;

        match (target, method) {
            (_, "Equals") if values.len() == 1 => Ok(Value::Boolean(target.loose_eq(&values[0]))),
            (_, "ToString") => Ok(Value::String(display_string(target))),
            (_, "CompareTo") if values.len() == 1 => {
                Ok(Value::Int32(ordering_to_int(target.compare(&values[0]))))
            }
            (Value::String(s), _) => string_method(s, method, &values),
            (Value::Document(doc), "ContainsKey") => match values.first() {
                Some(Value::String(key)) => Ok(Value::Boolean(doc.contains_key(key))),
                _ => Err(EvalError::TypeError("ContainsKey expects a string key".to_string())),
            },
            (Value::Document(doc), "ContainsValue") => match values.first() {
                Some(v) => Ok(Value::Boolean(doc.values().any(|x| x.loose_eq(v)))),
                None => Err(EvalError::TypeError("ContainsValue expects a value".to_string())),
            },
            (Value::DateTime(ms), _) => date_method(*ms, method, &values),
            _ => Err(EvalError::UnknownFunction(format!(
                "{}.{}",
                type_name(target),
                method
            ))),
        }
    }

    fn apply_sequence_method(
        &self,
        items: &[Value],
        method: &str,
        type_args: &[TypeRef],
        args: &[Expr],
        ctx: &EvalContext,
    ) -> Result<Value, EvalError> {
        let lambda = |i: usize| args.get(i).filter(|a| matches!(a, Expr::Lambda { .. }));
        let arg = |i: usize| -> Result<Value, EvalError> {
            match args.get(i) {
                Some(a) => self.evaluate(a, ctx),
                None => Err(EvalError::TypeError(format!("{} expects an argument", method))),
            }
        };
        let test = |f: &Expr, item: &Value| -> Result<bool, EvalError> {
            match self.apply_lambda(f, std::slice::from_ref(item), ctx)? {
                Value::Boolean(b) => Ok(b),
                other => Err(EvalError::TypeError(format!(
                    "predicate returned {}",
                    type_name(&other)
                ))),
            }
        };
        let filtered = |i: usize| -> Result<Vec<Value>, EvalError> {
            match lambda(i) {
                Some(f) => {
                    let mut out = Vec::new();
                    for item in items {
                        if test(f, item)? {
                            out.push(item.clone());
                        }
                    }
                    Ok(out)
                }
                None => Ok(items.to_vec()),
            }
        };
        let projected = |i: usize| -> Result<Vec<Value>, EvalError> {
            match lambda(i) {
                Some(f) => items
                    .iter()
                    .map(|item| self.apply_lambda(f, std::slice::from_ref(item), ctx))
                    .collect(),
                None => Ok(items.to_vec()),
            }
        };

        match method {
            "ToList" | "ToArray" | "AsEnumerable" | "AsQueryable" => Ok(Value::Array(items.to_vec())),
            "Any" => match lambda(0) {
                Some(f) => {
                    for item in items {
                        if test(f, item)? {
                            return Ok(Value::Boolean(true));
                        }
                    }
                    Ok(Value::Boolean(false))
                }
                None => Ok(Value::Boolean(!items.is_empty())),
            },
            "All" => {
                let f = lambda(0).ok_or_else(|| EvalError::TypeError("All expects a predicate".into()))?;
                for item in items {
                    if !test(f, item)? {
                        return Ok(Value::Boolean(false));
                    }
                }
                Ok(Value::Boolean(true))
            }
            "Count" => Ok(Value::Int32(filtered(0)?.len() as i32)),
            "LongCount" => Ok(Value::Int64(filtered(0)?.len() as i64)),
            "Where" => Ok(Value::Array(filtered(0)?)),
            "Select" => Ok(Value::Array(projected(0)?)),
            "SelectMany" => {
                let mut out = Vec::new();
                for value in projected(0)? {
                    match value {
                        Value::Array(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
                Ok(Value::Array(out))
            }
            "OfType" => {
                let out = match type_args.first() {
                    Some(TypeRef::Named(name)) => items
                        .iter()
                        .filter(|i| has_discriminator(i, name))
                        .cloned()
                        .collect(),
                    _ => items.to_vec(),
                };
                Ok(Value::Array(out))
            }
            "Contains" => {
                let needle = arg(0)?;
                Ok(Value::Boolean(items.iter().any(|i| i.loose_eq(&needle))))
            }
            "IndexOf" => {
                let needle = arg(0)?;
                Ok(Value::Int32(
                    items.iter().position(|i| i.loose_eq(&needle)).map(|p| p as i32).unwrap_or(-1),
                ))
            }
            "Sum" => {
                let mut total = Value::Int32(0);
                for value in projected(0)? {
                    if !value.is_null() {
                        total = arithmetic(BinOp::Add, &total, &value)?;
                    }
                }
                Ok(total)
            }
            "Average" => average(&projected(0)?),
            "StandardDeviationPop" | "StandardDeviationSamp" => {
                let numbers: Vec<f64> = projected(0)?.iter().filter_map(Value::as_f64).collect();
                standard_deviation(&numbers, method.ends_with("Samp"))
                    .map(Value::Double)
                    .ok_or_else(|| EvalError::InvalidOperation("too few elements for a standard deviation".into()))
            }
            "Min" => extreme(projected(0)?, Ordering::Less),
            "Max" => extreme(projected(0)?, Ordering::Greater),
            "First" | "FirstOrDefault" => match filtered(0)?.into_iter().next() {
                Some(v) => Ok(v),
                None if method.ends_with("OrDefault") => Ok(Value::Null),
                None => Err(EvalError::InvalidOperation("sequence contains no elements".into())),
            },
            "Last" | "LastOrDefault" => match filtered(0)?.pop() {
                Some(v) => Ok(v),
                None if method.ends_with("OrDefault") => Ok(Value::Null),
                None => Err(EvalError::InvalidOperation("sequence contains no elements".into())),
            },
            "Single" | "SingleOrDefault" => {
                let mut matches = filtered(0)?;
                match matches.len() {
                    1 => Ok(matches.remove(0)),
                    0 if method.ends_with("OrDefault") => Ok(Value::Null),
                    0 => Err(EvalError::InvalidOperation("sequence contains no elements".into())),
                    _ => Err(EvalError::InvalidOperation(
                        "sequence contains more than one element".into(),
                    )),
                }
            }
            "ElementAt" | "ElementAtOrDefault" => {
                let index = arg(0)?.as_i64().unwrap_or(-1);
                match usize::try_from(index).ok().and_then(|i| items.get(i)) {
                    Some(v) => Ok(v.clone()),
                    None if method.ends_with("OrDefault") => Ok(Value::Null),
                    None => Err(EvalError::AccessError(format!("index {} is out of range", index))),
                }
            }
            "Distinct" => Ok(Value::Array(distinct(items.iter().cloned()))),
            "Concat" => match arg(0)? {
                Value::Array(other) => Ok(Value::Array(items.iter().chain(&other).cloned().collect())),
                other => Err(EvalError::TypeError(format!("cannot concat {}", type_name(&other)))),
            },
            "Union" | "Intersect" | "Except" => {
                let other = match arg(0)? {
                    Value::Array(other) => other,
                    v => return Err(EvalError::TypeError(format!("cannot combine with {}", type_name(&v)))),
                };
                let out = match method {
                    "Union" => distinct(items.iter().chain(&other).cloned()),
                    "Intersect" => distinct(
                        items.iter().filter(|i| other.iter().any(|o| o.loose_eq(i))).cloned(),
                    ),
                    _ => distinct(
                        items.iter().filter(|i| !other.iter().any(|o| o.loose_eq(i))).cloned(),
                    ),
                };
                Ok(Value::Array(out))
            }
            "Reverse" => Ok(Value::Array(items.iter().rev().cloned().collect())),
            "Take" => {
                let n = arg(0)?.as_i64().unwrap_or(0).max(0) as usize;
                Ok(Value::Array(items.iter().take(n).cloned().collect()))
            }
            "Skip" => {
                let n = arg(0)?.as_i64().unwrap_or(0).max(0) as usize;
                Ok(Value::Array(items.iter().skip(n).cloned().collect()))
            }
            "OrderBy" | "OrderByDescending" => {
                let keys = projected(0)?;
                let mut pairs: Vec<(Value, Value)> = keys.into_iter().zip(items.iter().cloned()).collect();
                pairs.sort_by(|a, b| a.0.compare(&b.0));
                if method == "OrderByDescending" {
                    pairs.reverse();
                }
                Ok(Value::Array(pairs.into_iter().map(|(_, v)| v).collect()))
            }
            "SequenceEqual" => match arg(0)? {
                Value::Array(other) => Ok(Value::Boolean(
                    items.len() == other.len() && items.iter().zip(&other).all(|(a, b)| a.loose_eq(b)),
                )),
                _ => Ok(Value::Boolean(false)),
            },
            "Aggregate" => {
                let (mut acc, f, rest) = match args.len() {
                    1 => match items.split_first() {
                        Some((first, rest)) => (first.clone(), &args[0], rest),
                        None => return Err(EvalError::InvalidOperation("sequence contains no elements".into())),
                    },
                    _ => (arg(0)?, &args[1], items),
                };
                for item in rest {
                    acc = self.apply_lambda(f, &[acc, item.clone()], ctx)?;
                }
                Ok(acc)
            }
            _ => Err(EvalError::UnknownFunction(format!("array.{}", method))),
        }
    }

    fn apply_static(&self, method: &str, args: &[Value]) -> Result<Value, EvalError> {
        let number = |i: usize| -> Result<f64, EvalError> {
            args.get(i).and_then(Value::as_f64).ok_or_else(|| {
                EvalError::TypeError(format!("{} expects numeric arguments", method))
            })
        };
        match method {
            "Math.Abs" => match args.first() {
                Some(v) if v.is_number() => {
                    if v.compare(&Value::Int32(0)) == Ordering::Less {
                        arithmetic(BinOp::Subtract, &Value::Int32(0), v)
                    } else {
                        Ok(v.clone())
                    }
                }
                _ => Err(EvalError::TypeError("Math.Abs expects a number".into())),
            },
            "Math.Ceiling" => match args.first() {
                Some(Value::Decimal(d)) => Ok(Value::Decimal(d.ceil())),
                _ => Ok(Value::Double(number(0)?.ceil())),
            },
            "Math.Floor" => match args.first() {
                Some(Value::Decimal(d)) => Ok(Value::Decimal(d.floor())),
                _ => Ok(Value::Double(number(0)?.floor())),
            },
            "Math.Truncate" => match args.first() {
                Some(Value::Decimal(d)) => Ok(Value::Decimal(d.trunc())),
                _ => Ok(Value::Double(number(0)?.trunc())),
            },
            "Math.Round" => {
                let digits = match args.get(1) {
                    Some(v) => v.as_i64().unwrap_or(0).clamp(0, 15) as u32,
                    None => 0,
                };
                match args.first() {
                    Some(Value::Decimal(d)) => Ok(Value::Decimal(
                        d.round_dp_with_strategy(digits, RoundingStrategy::MidpointNearestEven),
                    )),
                    _ => {
                        let scale = 10f64.powi(digits as i32);
                        Ok(Value::Double((number(0)? * scale).round_ties_even() / scale))
                    }
                }
            }
            "Math.Sqrt" => Ok(Value::Double(number(0)?.sqrt())),
            "Math.Exp" => Ok(Value::Double(number(0)?.exp())),
            "Math.Log" if args.len() == 2 => Ok(Value::Double(number(0)?.log(number(1)?))),
            "Math.Log" => Ok(Value::Double(number(0)?.ln())),
            "Math.Log10" => Ok(Value::Double(number(0)?.log10())),
            "Math.Pow" => Ok(Value::Double(number(0)?.powf(number(1)?))),
            "Math.Max" | "Math.Min" => match (args.first(), args.get(1)) {
                (Some(a), Some(b)) => {
                    let pick_first = match method {
                        "Math.Max" => a.compare(b) != Ordering::Less,
                        _ => a.compare(b) != Ordering::Greater,
                    };
                    Ok(if pick_first { a.clone() } else { b.clone() })
                }
                _ => Err(EvalError::TypeError(format!("{} expects two arguments", method))),
            },
            "string.IsNullOrEmpty" => Ok(Value::Boolean(match args.first() {
                Some(Value::String(s)) => s.is_empty(),
                Some(Value::Null) | None => true,
                Some(_) => false,
            })),
            "string.IsNullOrWhiteSpace" => Ok(Value::Boolean(match args.first() {
                Some(Value::String(s)) => s.trim().is_empty(),
                Some(Value::Null) | None => true,
                Some(_) => false,
            })),
            "string.Concat" => Ok(Value::String(args.iter().map(display_string).collect())),
            "string.Equals" => match args {
                [a, b] => Ok(Value::Boolean(a == b)),
                [Value::String(a), Value::String(b), Value::String(cmp)] if cmp.ends_with("IgnoreCase") => {
                    Ok(Value::Boolean(a.to_lowercase() == b.to_lowercase()))
                }
                [a, b, _] => Ok(Value::Boolean(a == b)),
                _ => Err(EvalError::TypeError("string.Equals expects two arguments".into())),
            },
            "Regex.IsMatch" => match args {
                [Value::String(input), Value::String(pattern), rest @ ..] => {
                    let ignore_case = matches!(rest.first(), Some(Value::String(o)) if o.contains("IgnoreCase"));
                    let regex = RegexBuilder::new(pattern)
                        .case_insensitive(ignore_case)
                        .build()
                        .map_err(|e| EvalError::TypeError(format!("invalid pattern: {}", e)))?;
                    Ok(Value::Boolean(regex.is_match(input)))
                }
                _ => Err(EvalError::TypeError("Regex.IsMatch expects string arguments".into())),
            },
            name => match self.env.function(name) {
                Some(function) => function.call(args).map_err(|e| match e {
                    EvalError::HostFunction { .. } => e,
                    other => EvalError::HostFunction {
                        name: name.to_string(),
                        message: other.to_string(),
                    },
                }),
                None => Err(EvalError::UnknownFunction(name.to_string())),
            },
        }
    }
}

fn ordering_to_int(ordering: Ordering) -> i32 {
    match ordering {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

fn distinct(items: impl Iterator<Item = Value>) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for item in items {
        if !out.iter().any(|o| o.loose_eq(&item)) {
            out.push(item);
        }
    }
    out
}

fn average(values: &[Value]) -> Result<Value, EvalError> {
    let present: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
    if present.is_empty() {
        return Err(EvalError::InvalidOperation("sequence contains no elements".into()));
    }
    if present.iter().any(|v| matches!(v, Value::Decimal(_))) {
        let mut total = Decimal::ZERO;
        for v in &present {
            total += v.as_decimal().ok_or_else(|| EvalError::TypeError("cannot average non-numbers".into()))?;
        }
        return Ok(Value::Decimal(total / Decimal::from(present.len())));
    }
    let mut total = 0.0;
    for v in &present {
        total += v.as_f64().ok_or_else(|| EvalError::TypeError("cannot average non-numbers".into()))?;
    }
    Ok(Value::Double(total / present.len() as f64))
}

fn extreme(values: Vec<Value>, wanted: Ordering) -> Result<Value, EvalError> {
    let mut best: Option<Value> = None;
    for value in values.into_iter().filter(|v| !v.is_null()) {
        best = match best {
            Some(current) if value.compare(&current) != wanted => Some(current),
            _ => Some(value),
        };
    }
    best.ok_or_else(|| EvalError::InvalidOperation("sequence contains no elements".into()))
}

/// True when a document's `_t` discriminator names `type_name` (scalar or hierarchical).
pub fn has_discriminator(value: &Value, type_name: &str) -> bool {
    match value.as_document().and_then(|d| d.get("_t")) {
        Some(Value::String(t)) => t == type_name,
        Some(Value::Array(ts)) => ts.iter().any(|t| t.as_str() == Some(type_name)),
        _ => false,
    }
}

/// String form used by `+` concatenation and `ToString()`.
pub fn display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Boolean(true) => "True".to_string(),
        Value::Boolean(false) => "False".to_string(),
        Value::Int32(n) => n.to_string(),
        Value::Int64(n) => n.to_string(),
        Value::Double(n) => n.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn ignore_case_argument(values: &[Value], index: usize) -> bool {
    matches!(values.get(index), Some(Value::String(c)) if c.ends_with("IgnoreCase"))
}

fn string_method(s: &str, method: &str, args: &[Value]) -> Result<Value, EvalError> {
    let text = |i: usize| -> Result<&str, EvalError> {
        args.get(i)
            .and_then(Value::as_str)
            .ok_or_else(|| EvalError::TypeError(format!("{} expects a string argument", method)))
    };
    let int = |i: usize| -> Result<i64, EvalError> {
        args.get(i)
            .and_then(Value::as_i64)
            .ok_or_else(|| EvalError::TypeError(format!("{} expects an integer argument", method)))
    };
    let fold = |value: &str, ignore_case: bool| {
        if ignore_case { value.to_lowercase() } else { value.to_string() }
    };
    match method {
        "ToLower" | "ToLowerInvariant" => Ok(Value::String(s.to_lowercase())),
        "ToUpper" | "ToUpperInvariant" => Ok(Value::String(s.to_uppercase())),
        "Trim" | "TrimStart" | "TrimEnd" => {
            let chars: Vec<char> = args.iter().filter_map(Value::as_str).flat_map(str::chars).collect();
            let matcher = |c: char| if chars.is_empty() { c.is_whitespace() } else { chars.contains(&c) };
            Ok(Value::String(match method {
                "Trim" => s.trim_matches(matcher).to_string(),
                "TrimStart" => s.trim_start_matches(matcher).to_string(),
                _ => s.trim_end_matches(matcher).to_string(),
            }))
        }
        "Contains" | "StartsWith" | "EndsWith" => {
            let ignore_case = ignore_case_argument(args, 1);
            let haystack = fold(s, ignore_case);
            let needle = fold(text(0)?, ignore_case);
            Ok(Value::Boolean(match method {
                "Contains" => haystack.contains(&needle),
                "StartsWith" => haystack.starts_with(&needle),
                _ => haystack.ends_with(&needle),
            }))
        }
        "IndexOf" => {
            let chars: Vec<char> = s.chars().collect();
            let needle: Vec<char> = text(0)?.chars().collect();
            let start = if args.len() > 1 { int(1)?.max(0) as usize } else { 0 };
            let end = if args.len() > 2 {
                (start + int(2)?.max(0) as usize).min(chars.len())
            } else {
                chars.len()
            };
            if start > chars.len() {
                return Err(EvalError::AccessError("start index is out of range".into()));
            }
            let found = (start..=end.saturating_sub(needle.len()))
                .find(|&i| i + needle.len() <= end && chars[i..i + needle.len()] == needle[..]);
            Ok(Value::Int32(found.map(|i| i as i32).unwrap_or(-1)))
        }
        "Substring" => {
            let chars: Vec<char> = s.chars().collect();
            let start = usize::try_from(int(0)?)
                .map_err(|_| EvalError::AccessError("start index is negative".into()))?;
            let length = if args.len() > 1 {
                usize::try_from(int(1)?).map_err(|_| EvalError::AccessError("length is negative".into()))?
            } else {
                chars.len().saturating_sub(start)
            };
            if start + length > chars.len() {
                return Err(EvalError::AccessError("substring is out of range".into()));
            }
            Ok(Value::String(chars[start..start + length].iter().collect()))
        }
        "Replace" => Ok(Value::String(s.replace(text(0)?, text(1)?))),
        "Split" => Ok(Value::Array(
            s.split(text(0)?).map(|part| Value::String(part.to_string())).collect(),
        )),
        "Equals" => {
            let ignore_case = ignore_case_argument(args, 1);
            Ok(Value::Boolean(fold(s, ignore_case) == fold(text(0)?, ignore_case)))
        }
        _ => Err(EvalError::UnknownFunction(format!("string.{}", method))),
    }
}

fn date_time(ms: i64) -> Result<chrono::DateTime<Utc>, EvalError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| EvalError::TypeError(format!("{} is not a valid date", ms)))
}

fn date_member(ms: i64, name: &str) -> Result<Value, EvalError> {
    let date = date_time(ms)?;
    let value = match name {
        "Year" => date.year(),
        "Month" => date.month() as i32,
        "Day" => date.day() as i32,
        "Hour" => date.hour() as i32,
        "Minute" => date.minute() as i32,
        "Second" => date.second() as i32,
        "Millisecond" => (date.timestamp_subsec_millis()) as i32,
        "DayOfWeek" => date.weekday().num_days_from_sunday() as i32,
        "DayOfYear" => date.ordinal() as i32,
        _ => {
            return Err(EvalError::AccessError(format!("date has no member '{}'", name)));
        }
    };
    Ok(Value::Int32(value))
}

fn date_method(ms: i64, method: &str, args: &[Value]) -> Result<Value, EvalError> {
    let amount = args
        .first()
        .and_then(Value::as_f64)
        .ok_or_else(|| EvalError::TypeError(format!("{} expects a number", method)))?;
    let unit_ms = match method {
        "AddMilliseconds" => 1.0,
        "AddSeconds" => 1_000.0,
        "AddMinutes" => 60_000.0,
        "AddHours" => 3_600_000.0,
        "AddDays" => 86_400_000.0,
        "AddMonths" | "AddYears" => {
            let months = amount as i32 * if method == "AddYears" { 12 } else { 1 };
            let date = date_time(ms)?;
            let shifted = if months >= 0 {
                date.checked_add_months(Months::new(months as u32))
            } else {
                date.checked_sub_months(Months::new(months.unsigned_abs()))
            };
            return shifted
                .map(|d| Value::DateTime(d.timestamp_millis()))
                .ok_or_else(|| EvalError::InvalidOperation("date is out of range".into()));
        }
        _ => return Err(EvalError::UnknownFunction(format!("date.{}", method))),
    };
    Ok(Value::DateTime(ms + (amount * unit_ms) as i64))
}

/// Comparison and arithmetic between two evaluated operands.
pub fn apply_binop(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        BinOp::Equal => Ok(Value::Boolean(left.loose_eq(right))),
        BinOp::NotEqual => Ok(Value::Boolean(!left.loose_eq(right))),
        BinOp::LessThan | BinOp::GreaterThan | BinOp::LessEqual | BinOp::GreaterEqual => {
            // lifted comparisons with null are false
            if left.is_null() || right.is_null() {
                return Ok(Value::Boolean(false));
            }
            if left.is_number() != right.is_number()
                || (!left.is_number() && std::mem::discriminant(left) != std::mem::discriminant(right))
            {
                return Err(EvalError::TypeError(format!(
                    "cannot compare {} {} {}",
                    type_name(left),
                    op.symbol(),
                    type_name(right)
                )));
            }
            let ordering = left.compare(right);
            Ok(Value::Boolean(match op {
                BinOp::LessThan => ordering == Ordering::Less,
                BinOp::GreaterThan => ordering == Ordering::Greater,
                BinOp::LessEqual => ordering != Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinOp::Add if matches!(left, Value::String(_)) || matches!(right, Value::String(_)) => Ok(
            Value::String(format!("{}{}", display_string(left), display_string(right))),
        ),
        BinOp::Add | BinOp::Subtract | BinOp::Multiply | BinOp::Divide | BinOp::Modulo => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            arithmetic(op, left, right)
        }
        BinOp::AndAlso | BinOp::OrElse => match (left, right) {
            (Value::Boolean(a), Value::Boolean(b)) => Ok(Value::Boolean(if op == BinOp::AndAlso {
                *a && *b
            } else {
                *a || *b
            })),
            (a, b) => Err(EvalError::TypeError(format!(
                "cannot combine {} {} {}",
                type_name(a),
                op.symbol(),
                type_name(b)
            ))),
        },
        BinOp::Coalesce => Ok(if left.is_null() { right.clone() } else { left.clone() }),
    }
}

/// Width class of a numeric value; mixed operands widen to the larger class.
fn numeric_rank(value: &Value) -> Option<u8> {
    match value {
        Value::Int32(_) => Some(0),
        Value::Int64(_) => Some(1),
        Value::Double(_) => Some(2),
        Value::Decimal(_) => Some(3),
        _ => None,
    }
}

/// Arithmetic with width-preserving promotion: int32 op int64 is int64,
/// anything with a double is double, anything with a decimal is decimal.
/// Integer division truncates; decimal arithmetic is exact.
/// Population or sample standard deviation, `None` when it is undefined.
pub fn standard_deviation(values: &[f64], sample: bool) -> Option<f64> {
    let n = values.len();
    if n == 0 || (sample && n < 2) {
        return None;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let squares: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    let divisor = if sample { n - 1 } else { n };
    Some((squares / divisor as f64).sqrt())
}

pub fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let (Some(l), Some(r)) = (numeric_rank(left), numeric_rank(right)) else {
        return Err(EvalError::TypeError(format!(
            "cannot apply {} to {} and {}",
            op.symbol(),
            type_name(left),
            type_name(right)
        )));
    };
    match l.max(r) {
        0 | 1 => {
            let (a, b) = (left.as_i64().unwrap_or(0), right.as_i64().unwrap_or(0));
            let result = match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Subtract => a.wrapping_sub(b),
                BinOp::Multiply => a.wrapping_mul(b),
                BinOp::Divide | BinOp::Modulo if b == 0 => return Err(EvalError::DivisionByZero),
                BinOp::Divide => a.wrapping_div(b),
                BinOp::Modulo => a.wrapping_rem(b),
                _ => unreachable_op(op)?,
            };
            if l.max(r) == 0 {
                Ok(Value::Int32(result as i32))
            } else {
                Ok(Value::Int64(result))
            }
        }
        2 => {
            let (a, b) = (left.as_f64().unwrap_or(f64::NAN), right.as_f64().unwrap_or(f64::NAN));
            Ok(Value::Double(match op {
                BinOp::Add => a + b,
                BinOp::Subtract => a - b,
                BinOp::Multiply => a * b,
                BinOp::Divide => a / b,
                BinOp::Modulo => a % b,
                _ => unreachable_op(op)?,
            }))
        }
        _ => {
            let to_decimal = |v: &Value| {
                v.as_decimal()
                    .ok_or_else(|| EvalError::TypeError(format!("{} is not representable as decimal", v)))
            };
            let (a, b) = (to_decimal(left)?, to_decimal(right)?);
            let result = match op {
                BinOp::Add => a.checked_add(b),
                BinOp::Subtract => a.checked_sub(b),
                BinOp::Multiply => a.checked_mul(b),
                BinOp::Divide | BinOp::Modulo if b.is_zero() => return Err(EvalError::DivisionByZero),
                BinOp::Divide => a.checked_div(b),
                BinOp::Modulo => a.checked_rem(b),
                _ => unreachable_op(op)?,
            };
            result
                .map(Value::Decimal)
                .ok_or_else(|| EvalError::InvalidOperation("decimal overflow".into()))
        }
    }
}

fn unreachable_op<T>(op: BinOp) -> Result<T, EvalError> {
    Err(EvalError::TypeError(format!("{} is not an arithmetic operator", op.symbol())))
}

/// Explicit conversion to a declared type.
pub fn convert(value: &Value, to: &TypeRef) -> Result<Value, EvalError> {
    let fail = || {
        EvalError::TypeError(format!("cannot convert {} to {}", type_name(value), to))
    };
    let char_code = |s: &str| {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c as i64),
            _ => None,
        }
    };
    match to {
        TypeRef::Nullable(inner) => {
            if value.is_null() {
                Ok(Value::Null)
            } else {
                convert(value, inner)
            }
        }
        TypeRef::Int32 | TypeRef::Int64 => {
            let n = match value {
                Value::Int32(n) => *n as i64,
                Value::Int64(n) => *n,
                Value::Double(n) => n.trunc() as i64,
                Value::Decimal(d) => d.trunc().to_i64().ok_or_else(fail)?,
                Value::String(s) => char_code(s).ok_or_else(fail)?,
                _ => return Err(fail()),
            };
            Ok(match to {
                TypeRef::Int32 => Value::Int32(n as i32),
                _ => Value::Int64(n),
            })
        }
        TypeRef::Double => value.as_f64().map(Value::Double).ok_or_else(fail),
        TypeRef::Decimal => match value {
            Value::Double(n) => Decimal::from_f64(*n).map(Value::Decimal).ok_or_else(fail),
            other => other.as_decimal().map(Value::Decimal).ok_or_else(fail),
        },
        TypeRef::String => match value {
            Value::Null => Ok(Value::Null),
            other => Ok(Value::String(display_string(other))),
        },
        TypeRef::Char => match value {
            Value::String(s) if s.chars().count() == 1 => Ok(value.clone()),
            other => other
                .as_i64()
                .and_then(|n| u32::try_from(n).ok())
                .and_then(char::from_u32)
                .map(|c| Value::String(c.to_string()))
                .ok_or_else(fail),
        },
        TypeRef::Boolean => match value {
            Value::Boolean(_) => Ok(value.clone()),
            _ => Err(fail()),
        },
        TypeRef::DateTime => match value {
            Value::DateTime(_) => Ok(value.clone()),
            _ => Err(fail()),
        },
        TypeRef::Object | TypeRef::Named(_) => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_query;

    fn eval(text: &str) -> Result<Value, EvalError> {
        let env = Environment::new();
        let expr = parse_query(text).unwrap();
        Evaluator::new(&env).evaluate_closed(&expr)
    }

    #[test]
    fn integer_widths_widen() {
        assert_eq!(eval("2 * 3L").unwrap(), Value::Int64(6));
        assert_eq!(eval("7 / 2").unwrap(), Value::Int32(3));
        assert_eq!(eval("7 / 2.0").unwrap(), Value::Double(3.5));
        assert_eq!(eval("0.1m + 0.2m").unwrap(), Value::Decimal(Decimal::new(3, 1)));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(eval("1 / 0"), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn string_methods() {
        assert_eq!(eval("\"Hello\".ToLower()").unwrap(), Value::from("hello"));
        assert_eq!(eval("\"Hello\".IndexOf(\"l\")").unwrap(), Value::Int32(2));
        assert_eq!(eval("\"Hello\".Substring(1, 3)").unwrap(), Value::from("ell"));
        assert_eq!(eval("\"a\" + 1").unwrap(), Value::from("a1"));
    }

    #[test]
    fn sequence_methods_with_lambdas() {
        assert_eq!(eval("new[] { 1, 2, 3 }.Where(x => x > 1).Sum()").unwrap(), Value::Int32(5));
        assert_eq!(eval("new[] { 1, 2, 3 }.Any(x => x == 2)").unwrap(), Value::Boolean(true));
        assert_eq!(
            eval("new[] { 1, 2, 3 }.Aggregate(0, (acc, x) => acc + x * x)").unwrap(),
            Value::Int32(14)
        );
    }

    #[test]
    fn comparisons_with_null_are_false() {
        assert_eq!(eval("null < 1").unwrap(), Value::Boolean(false));
        assert_eq!(eval("null == null").unwrap(), Value::Boolean(true));
    }
}
