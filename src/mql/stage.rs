use std::fmt;

use super::{
    expr::AggExpr,
    filter::{Filter, number},
};
use crate::value::{Document, Value};

/// One field of a `$project` specification.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectField {
    Include,
    Exclude,
    Computed(AggExpr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    fn to_value(self) -> Value {
        match self {
            SortDirection::Ascending => Value::Int32(1),
            SortDirection::Descending => Value::Int32(-1),
        }
    }
}

/// A `$group` accumulator such as `{ $sum : 1 }`.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    pub op: String,
    pub arg: AggExpr,
}

impl Accumulator {
    pub fn new(op: &str, arg: AggExpr) -> Self {
        Accumulator { op: op.to_string(), arg }
    }
}

/// A pipeline stage. Stages are never modified once emitted; rewrites build new ones.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Project(Vec<(String, ProjectField)>),
    AddFields(Vec<(String, AggExpr)>),
    Group {
        id: AggExpr,
        accumulators: Vec<(String, Accumulator)>,
    },
    Sort(Vec<(String, SortDirection)>),
    Skip(i64),
    Limit(i64),
    /// Field path without the leading `$`
    Unwind(String),
    ReplaceRoot(AggExpr),
    ReplaceWith(AggExpr),
    /// Output field name
    Count(String),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Group { .. } => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
            Stage::Unwind(_) => "$unwind",
            Stage::ReplaceRoot(_) => "$replaceRoot",
            Stage::ReplaceWith(_) => "$replaceWith",
            Stage::Count(_) => "$count",
        }
    }

    pub fn to_value(&self) -> Value {
        let body = match self {
            Stage::Match(filter) => filter.to_value(),
            Stage::Project(fields) => Value::Document(
                fields
                    .iter()
                    .map(|(name, field)| {
                        let value = match field {
                            ProjectField::Include => Value::Int32(1),
                            ProjectField::Exclude => Value::Int32(0),
                            ProjectField::Computed(expr) => projected_value(expr),
                        };
                        (name.clone(), value)
                    })
                    .collect(),
            ),
            Stage::AddFields(fields) => Value::Document(
                fields.iter().map(|(k, v)| (k.clone(), projected_value(v))).collect(),
            ),
            Stage::Group { id, accumulators } => {
                let mut doc = Document::new();
                doc.insert("_id", id.to_value());
                for (name, acc) in accumulators {
                    doc.insert(name.clone(), Value::Document(crate::doc! { acc.op.as_str() => acc.arg.to_value() }));
                }
                Value::Document(doc)
            }
            Stage::Sort(keys) => Value::Document(
                keys.iter().map(|(k, d)| (k.clone(), d.to_value())).collect(),
            ),
            Stage::Skip(n) | Stage::Limit(n) => number(*n),
            Stage::Unwind(path) => Value::String(format!("${}", path)),
            Stage::ReplaceRoot(expr) => Value::Document(crate::doc! { "newRoot" => expr.to_value() }),
            Stage::ReplaceWith(expr) => expr.to_value(),
            Stage::Count(field) => Value::String(field.clone()),
        };
        Value::Document(crate::doc! { self.name() => body })
    }
}

/// Inside `$project` a bare number or boolean means inclusion, so constants
/// go through `$literal`; nested documents are projection specs too.
fn projected_value(expr: &AggExpr) -> Value {
    match expr {
        AggExpr::Literal(value) => Value::Document(crate::doc! { "$literal" => value.clone() }),
        AggExpr::Document(fields) => Value::Document(
            fields.iter().map(|(k, v)| (k.clone(), projected_value(v))).collect(),
        ),
        other => other.to_value(),
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

/// Canonical text of each stage, in order.
pub fn render_pipeline(stages: &[Stage]) -> Vec<String> {
    stages.iter().map(Stage::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mql::FieldOp;

    #[test]
    fn renders_match_and_limit() {
        let stage = Stage::Match(Filter::field(
            "X",
            FieldOp::In(vec![1.into(), 2.into(), 3.into()]),
        ));
        assert_eq!(stage.to_string(), "{ $match : { X : { $in : [1, 2, 3] } } }");
        assert_eq!(Stage::Limit(1).to_string(), "{ $limit : 1 }");
    }

    #[test]
    fn project_wraps_constants_in_literal() {
        let stage = Stage::Project(vec![
            ("A".into(), ProjectField::Computed(AggExpr::literal(1))),
            ("B".into(), ProjectField::Computed(AggExpr::field("B"))),
            ("_id".into(), ProjectField::Exclude),
        ]);
        assert_eq!(stage.to_string(), "{ $project : { A : { $literal : 1 }, B : '$B', _id : 0 } }");
    }

    #[test]
    fn renders_group_with_accumulators() {
        let stage = Stage::Group {
            id: AggExpr::field("Name"),
            accumulators: vec![("_elements".into(), Accumulator::new("$push", AggExpr::root()))],
        };
        assert_eq!(
            stage.to_string(),
            "{ $group : { _id : '$Name', _elements : { $push : '$$ROOT' } } }"
        );
    }
}
