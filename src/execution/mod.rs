//! Running a translated query.
//!
//! An [`ExecutionAdapter`] sends stages to an engine and hands back a cursor.
//! [`ExecutableQuery`] drives it: server stages first, then `_v` unwrapping,
//! then the residual client steps, then the terminal reduction.

pub mod memory;

use std::cmp::Ordering;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{
    evaluator::{EvalError, standard_deviation},
    mql::{Stage, render_pipeline},
    residual::ResidualFunction,
    value::Value,
};

/// A lazy, finite, single-pass stream of result values.
pub type DocumentCursor = Box<dyn Iterator<Item = Result<Value, ExecutionError>> + Send>;

/// The seam between the translator and a database engine.
pub trait ExecutionAdapter {
    /// Run `stages` against `collection`.
    ///
    /// A stage the engine cannot run is reported as
    /// [`ExecutionError::StageRejected`] with its index in `stages`.
    fn aggregate(&self, collection: &str, stages: &[Stage]) -> Result<DocumentCursor, ExecutionError>;
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("stage {index} {stage} was rejected: {message}")]
    StageRejected { index: usize, stage: String, message: String },

    #[error("client-side evaluation failed: {0}")]
    Residual(#[from] EvalError),

    #[error("sequence contains no elements")]
    EmptySequence,

    #[error("sequence contains more than one element")]
    MoreThanOneElement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Average,
    Min,
    Max,
    StdDevPop,
    StdDevSamp,
}

/// How a terminal operator turns the result stream into one value.
#[derive(Debug, Clone, PartialEq)]
pub enum Reduction {
    First { or_default: bool },
    Single { or_default: bool },
    Any,
    /// `All`: the pipeline returns counterexamples
    IsEmpty,
    /// Reads the `$count` result; no document means zero
    ServerCount { long: bool },
    /// Reads a `$group` accumulator; no document means an empty input
    ServerAggregate { default: Option<Value> },
    ClientCount { long: bool },
    ClientAggregate { op: AggregateOp, nullable: bool },
}

impl Reduction {
    pub fn reduce(&self, mut values: DocumentCursor) -> Result<Value, ExecutionError> {
        match self {
            Reduction::First { or_default } => match values.next().transpose()? {
                Some(value) => Ok(value),
                None => empty(*or_default),
            },
            Reduction::Single { or_default } => {
                let first = values.next().transpose()?;
                if values.next().transpose()?.is_some() {
                    return Err(ExecutionError::MoreThanOneElement);
                }
                match first {
                    Some(value) => Ok(value),
                    None => empty(*or_default),
                }
            }
            Reduction::Any => Ok(Value::Boolean(values.next().transpose()?.is_some())),
            Reduction::IsEmpty => Ok(Value::Boolean(values.next().transpose()?.is_none())),
            Reduction::ServerCount { long } => {
                let count = values.next().transpose()?.and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(count_value(count, *long))
            }
            Reduction::ServerAggregate { default } => match values.next().transpose()? {
                Some(value) => Ok(value),
                None => default.clone().ok_or(ExecutionError::EmptySequence),
            },
            Reduction::ClientCount { long } => {
                let mut count = 0i64;
                for value in values {
                    value?;
                    count += 1;
                }
                Ok(count_value(count, *long))
            }
            Reduction::ClientAggregate { op, nullable } => {
                let mut present = Vec::new();
                for value in values {
                    let value = value?;
                    if !value.is_null() {
                        present.push(value);
                    }
                }
                aggregate(*op, *nullable, present)
            }
        }
    }
}

fn empty(or_default: bool) -> Result<Value, ExecutionError> {
    if or_default { Ok(Value::Null) } else { Err(ExecutionError::EmptySequence) }
}

fn count_value(count: i64, long: bool) -> Value {
    if long { Value::Int64(count) } else { Value::Int32(count as i32) }
}

fn aggregate(op: AggregateOp, nullable: bool, values: Vec<Value>) -> Result<Value, ExecutionError> {
    if values.is_empty() {
        return match op {
            AggregateOp::Sum => Ok(Value::Int32(0)),
            _ if nullable => Ok(Value::Null),
            _ => Err(ExecutionError::EmptySequence),
        };
    }
    match op {
        AggregateOp::Sum => sum(&values),
        AggregateOp::Average => {
            let count = values.len();
            Ok(match sum(&values)? {
                Value::Decimal(total) => Value::Decimal(total / Decimal::from(count)),
                total => Value::Double(total.as_f64().unwrap_or(f64::NAN) / count as f64),
            })
        }
        AggregateOp::StdDevPop | AggregateOp::StdDevSamp => {
            let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            Ok(standard_deviation(&numbers, op == AggregateOp::StdDevSamp)
                .map(Value::Double)
                .unwrap_or(Value::Null))
        }
        AggregateOp::Min | AggregateOp::Max => {
            let wanted = if op == AggregateOp::Min { Ordering::Less } else { Ordering::Greater };
            let mut best = values[0].clone();
            for value in &values[1..] {
                if value.compare(&best) == wanted {
                    best = value.clone();
                }
            }
            Ok(best)
        }
    }
}

fn sum(values: &[Value]) -> Result<Value, ExecutionError> {
    let mut total = Value::Int32(0);
    for value in values {
        total = crate::evaluator::arithmetic(crate::ast::BinOp::Add, &total, value)?;
    }
    Ok(total)
}

/// The outcome of [`ExecutableQuery::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Sequence(Vec<Value>),
    Scalar(Value),
}

impl QueryResult {
    pub fn into_values(self) -> Vec<Value> {
        match self {
            QueryResult::Sequence(values) => values,
            QueryResult::Scalar(value) => vec![value],
        }
    }
}

/// A translated query, ready to run any number of times.
#[derive(Debug, Clone)]
pub struct ExecutableQuery {
    pub collection: String,
    pub stages: Vec<Stage>,
    pub residual: Option<ResidualFunction>,
    /// Field each server result value is wrapped in
    pub unwrap: Option<String>,
    pub reduction: Option<Reduction>,
}

impl ExecutableQuery {
    /// Shell text of each stage.
    pub fn pipeline_text(&self) -> Vec<String> {
        render_pipeline(&self.stages)
    }

    /// Run the stages and the client steps, without the terminal reduction.
    pub fn stream<A>(&self, adapter: &A) -> Result<DocumentCursor, ExecutionError>
    where
        A: ExecutionAdapter + ?Sized,
    {
        let cursor = adapter.aggregate(&self.collection, &self.stages)?;
        let cursor: DocumentCursor = match self.unwrap.clone() {
            Some(field) => Box::new(cursor.map(move |item| item.map(|value| unwrap(value, &field)))),
            None => cursor,
        };
        Ok(match &self.residual {
            Some(residual) => residual.apply(cursor),
            None => cursor,
        })
    }

    pub fn execute<A>(&self, adapter: &A) -> Result<QueryResult, ExecutionError>
    where
        A: ExecutionAdapter + ?Sized,
    {
        let cursor = self.stream(adapter)?;
        match &self.reduction {
            Some(reduction) => Ok(QueryResult::Scalar(reduction.reduce(cursor)?)),
            None => Ok(QueryResult::Sequence(cursor.collect::<Result<_, _>>()?)),
        }
    }
}

fn unwrap(value: Value, field: &str) -> Value {
    match value {
        Value::Document(mut doc) => doc.remove(field).unwrap_or(Value::Null),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(values: Vec<Value>) -> DocumentCursor {
        Box::new(values.into_iter().map(Ok))
    }

    #[test]
    fn single_rejects_a_second_element() {
        let single = Reduction::Single { or_default: true };
        assert_eq!(single.reduce(cursor(vec![])), Ok(Value::Null));
        assert_eq!(single.reduce(cursor(vec![1.into()])), Ok(Value::Int32(1)));
        assert_eq!(
            single.reduce(cursor(vec![1.into(), 2.into()])),
            Err(ExecutionError::MoreThanOneElement)
        );
    }

    #[test]
    fn client_aggregates_skip_nulls() {
        let average = Reduction::ClientAggregate { op: AggregateOp::Average, nullable: true };
        assert_eq!(
            average.reduce(cursor(vec![1.into(), Value::Null, 4.into()])),
            Ok(Value::Double(2.5))
        );
        assert_eq!(average.reduce(cursor(vec![Value::Null])), Ok(Value::Null));
        let max = Reduction::ClientAggregate { op: AggregateOp::Max, nullable: false };
        assert_eq!(max.reduce(cursor(vec![])), Err(ExecutionError::EmptySequence));
    }

    #[test]
    fn missing_count_document_is_zero() {
        let count = Reduction::ServerCount { long: true };
        assert_eq!(count.reduce(cursor(vec![])), Ok(Value::Int64(0)));
    }
}
