//! The client-side remainder of a query.
//!
//! When an operator cannot run on the server and client fallback is enabled,
//! the pipeline is split: the server runs every stage before the split and
//! the steps after it run here, once, over the returned documents. Steps keep
//! their original query order.

use std::sync::Arc;

use crate::{
    ast::Expr,
    environment::Environment,
    evaluator::{EvalContext, EvalError, Evaluator},
    execution::{DocumentCursor, ExecutionError},
    mql::SortDirection,
    value::{Document, Value},
};

/// One client-side operator.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientStep {
    /// Keep values for which the lambda returns `true`
    Filter(Expr),
    /// Replace each value by the lambda's result. With `snippets`, the value
    /// is a `{ _snippets : [...] }` document whose entries answer the
    /// lambda's `Snippet` nodes.
    Project { selector: Expr, snippets: bool },
    /// Flatten the sequences the lambda returns
    SelectMany(Expr),
    /// Stable sort by key lambdas, first key most significant
    Sort(Vec<(Expr, SortDirection)>),
    /// Group into `{ _id : key, _elements : [...] }` documents in order of
    /// first appearance
    Group { key: Expr, element: Option<Expr> },
    Distinct,
    Skip(usize),
    Take(usize),
}

/// Client steps bound to the environment the query was translated in.
#[derive(Debug, Clone)]
pub struct ResidualFunction {
    env: Arc<Environment>,
    steps: Vec<ClientStep>,
}

impl ResidualFunction {
    pub fn new(env: Arc<Environment>, steps: Vec<ClientStep>) -> Self {
        ResidualFunction { env, steps }
    }

    pub fn steps(&self) -> &[ClientStep] {
        &self.steps
    }

    /// Wrap `input` so each step runs lazily as values are pulled.
    pub fn apply(&self, input: DocumentCursor) -> DocumentCursor {
        let mut cursor = input;
        for step in &self.steps {
            let env = Arc::clone(&self.env);
            cursor = match step.clone() {
                ClientStep::Filter(predicate) => Box::new(cursor.filter_map(move |item| {
                    let value = match item {
                        Ok(value) => value,
                        Err(e) => return Some(Err(e)),
                    };
                    match test(&env, &predicate, &value) {
                        Ok(true) => Some(Ok(value)),
                        Ok(false) => None,
                        Err(e) => Some(Err(e)),
                    }
                })),
                ClientStep::Project { selector, snippets } => Box::new(
                    cursor.map(move |item| item.and_then(|value| project(&env, &selector, snippets, value))),
                ),
                ClientStep::SelectMany(selector) => Box::new(cursor.flat_map(move |item| {
                    let expanded = item.and_then(|value| project(&env, &selector, false, value));
                    let out: Vec<Result<Value, ExecutionError>> = match expanded {
                        Ok(Value::Array(values)) => values.into_iter().map(Ok).collect(),
                        Ok(Value::Null) => Vec::new(),
                        Ok(other) => vec![Err(ExecutionError::Residual(EvalError::TypeError(format!(
                            "SelectMany expects a sequence, found {}",
                            other.type_name()
                        ))))],
                        Err(e) => vec![Err(e)],
                    };
                    out
                })),
                ClientStep::Sort(keys) => buffered(cursor, move |values| sort(&env, &keys, values)),
                ClientStep::Group { key, element } => {
                    buffered(cursor, move |values| group(&env, &key, element.as_ref(), values))
                }
                ClientStep::Distinct => {
                    let mut seen: Vec<Value> = Vec::new();
                    Box::new(cursor.filter(move |item| match item {
                        Ok(value) if seen.iter().any(|s| s.loose_eq(value)) => false,
                        Ok(value) => {
                            seen.push(value.clone());
                            true
                        }
                        Err(_) => true,
                    }))
                }
                ClientStep::Skip(n) => Box::new(cursor.skip(n)),
                ClientStep::Take(n) => Box::new(cursor.take(n)),
            };
        }
        cursor
    }
}

fn test(env: &Environment, predicate: &Expr, value: &Value) -> Result<bool, ExecutionError> {
    let result = Evaluator::new(env).apply_lambda(predicate, std::slice::from_ref(value), &EvalContext::new())?;
    Ok(matches!(result, Value::Boolean(true)))
}

fn project(env: &Environment, selector: &Expr, snippets: bool, value: Value) -> Result<Value, ExecutionError> {
    let mut ctx = EvalContext::new();
    if snippets {
        let computed = value
            .as_document()
            .and_then(|doc| doc.get("_snippets"))
            .and_then(Value::as_array)
            .map(<[Value]>::to_vec)
            .unwrap_or_default();
        ctx = ctx.with_snippets(computed);
    }
    Ok(Evaluator::new(env).apply_lambda(selector, &[value], &ctx)?)
}

/// Run a step that needs every value before it yields the first.
fn buffered<F>(cursor: DocumentCursor, step: F) -> DocumentCursor
where
    F: FnOnce(Vec<Value>) -> Result<Vec<Value>, ExecutionError> + Send + 'static,
{
    let mut pending = Some((cursor, step));
    Box::new(std::iter::from_fn(move || pending.take()).flat_map(|(cursor, step)| {
        let out: Vec<Result<Value, ExecutionError>> = match cursor.collect::<Result<Vec<_>, _>>().and_then(step) {
            Ok(values) => values.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        };
        out
    }))
}

fn sort(env: &Environment, keys: &[(Expr, SortDirection)], values: Vec<Value>) -> Result<Vec<Value>, ExecutionError> {
    let evaluator = Evaluator::new(env);
    let ctx = EvalContext::new();
    let mut keyed = Vec::with_capacity(values.len());
    for value in values {
        let computed = keys
            .iter()
            .map(|(key, _)| evaluator.apply_lambda(key, std::slice::from_ref(&value), &ctx))
            .collect::<Result<Vec<_>, _>>()?;
        keyed.push((computed, value));
    }
    keyed.sort_by(|(a, _), (b, _)| {
        a.iter()
            .zip(b)
            .zip(keys)
            .map(|((a, b), (_, direction))| match direction {
                SortDirection::Ascending => a.compare(b),
                SortDirection::Descending => b.compare(a),
            })
            .find(|ordering| ordering.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(keyed.into_iter().map(|(_, value)| value).collect())
}

fn group(
    env: &Environment,
    key: &Expr,
    element: Option<&Expr>,
    values: Vec<Value>,
) -> Result<Vec<Value>, ExecutionError> {
    let evaluator = Evaluator::new(env);
    let ctx = EvalContext::new();
    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
    for value in values {
        let id = evaluator.apply_lambda(key, std::slice::from_ref(&value), &ctx)?;
        let item = match element {
            Some(selector) => evaluator.apply_lambda(selector, &[value], &ctx)?,
            None => value,
        };
        match groups.iter_mut().find(|(existing, _)| existing.loose_eq(&id)) {
            Some((_, items)) => items.push(item),
            None => groups.push((id, vec![item])),
        }
    }
    Ok(groups
        .into_iter()
        .map(|(id, items)| {
            let mut doc = Document::new();
            doc.insert("_id", id);
            doc.insert("_elements", Value::Array(items));
            Value::Document(doc)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinOp;

    fn cursor(values: Vec<Value>) -> DocumentCursor {
        Box::new(values.into_iter().map(Ok))
    }

    #[test]
    fn steps_run_in_query_order() {
        let residual = ResidualFunction::new(
            Arc::new(Environment::new()),
            vec![
                ClientStep::Filter(Expr::lambda(
                    &["n"],
                    Expr::binary(BinOp::GreaterThan, Expr::param("n"), Expr::constant(1)),
                )),
                ClientStep::Skip(1),
                ClientStep::Project {
                    selector: Expr::lambda(&["n"], Expr::binary(BinOp::Multiply, Expr::param("n"), Expr::constant(10))),
                    snippets: false,
                },
                ClientStep::Take(1),
            ],
        );
        let out: Vec<Value> = residual
            .apply(cursor(vec![1.into(), 2.into(), 3.into(), 4.into()]))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(out, vec![Value::Int32(30)]);
    }

    #[test]
    fn sort_and_group_buffer_their_input() {
        let doc = |name: &str, n: i32| Value::Document(crate::doc! { "Name" => name, "N" => n });
        let residual = ResidualFunction::new(
            Arc::new(Environment::new()),
            vec![
                ClientStep::Sort(vec![(
                    Expr::lambda(&["x"], Expr::member(Expr::param("x"), "N")),
                    SortDirection::Descending,
                )]),
                ClientStep::Group {
                    key: Expr::lambda(&["x"], Expr::member(Expr::param("x"), "Name")),
                    element: Some(Expr::lambda(&["x"], Expr::member(Expr::param("x"), "N"))),
                },
            ],
        );
        let out: Vec<Value> = residual
            .apply(cursor(vec![doc("a", 1), doc("b", 2), doc("a", 3)]))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            out,
            vec![
                Value::Document(crate::doc! { "_id" => "a", "_elements" => vec![Value::Int32(3), Value::Int32(1)] }),
                Value::Document(crate::doc! { "_id" => "b", "_elements" => vec![Value::Int32(2)] }),
            ]
        );
    }

    #[test]
    fn select_many_and_distinct() {
        let residual = ResidualFunction::new(
            Arc::new(Environment::new()),
            vec![
                ClientStep::SelectMany(Expr::lambda(&["x"], Expr::member(Expr::param("x"), "Tags"))),
                ClientStep::Distinct,
            ],
        );
        let doc = |tags: Vec<Value>| Value::Document(crate::doc! { "Tags" => tags });
        let out: Vec<Value> = residual
            .apply(cursor(vec![
                doc(vec!["a".into(), "b".into()]),
                doc(vec!["b".into(), "c".into()]),
            ]))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(out, vec![Value::from("a"), Value::from("b"), Value::from("c")]);
    }

    #[test]
    fn snippet_projection_reads_server_values() {
        let residual = ResidualFunction::new(
            Arc::new(Environment::new()),
            vec![ClientStep::Project {
                selector: Expr::lambda(&["x"], Expr::Snippet(1)),
                snippets: true,
            }],
        );
        let doc = Value::Document(crate::doc! { "_snippets" => vec![Value::from("a"), Value::from("b")] });
        let out: Vec<Value> = residual.apply(cursor(vec![doc])).collect::<Result<_, _>>().unwrap();
        assert_eq!(out, vec![Value::from("b")]);
    }
}
