use super::expr::AggExpr;
use crate::value::{Document, Value};

/// A `$match` filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches everything; renders as `{ }`
    True,

    /// Matches nothing; renders as `{ _id : { $type : -1 } }`
    False,

    /// Test on a field. An empty path tests the array element inside `$elemMatch`.
    Field { path: String, op: FieldOp },

    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),

    /// `{ $expr : e }`
    Expr(AggExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Size(i64),
    Regex { pattern: String, options: String },
    ElemMatch(Box<Filter>),
    Not(Box<FieldOp>),
    /// `$type` by alias or number
    Type(Value),
}

impl Filter {
    pub fn field(path: impl Into<String>, op: FieldOp) -> Filter {
        Filter::Field { path: path.into(), op }
    }

    /// The logical complement.
    pub fn negate(self) -> Filter {
        match self {
            Filter::True => Filter::False,
            Filter::False => Filter::True,
            Filter::Field { path, op } => Filter::Field { path, op: op.negate() },
            Filter::And(filters) => Filter::Or(filters.into_iter().map(Filter::negate).collect()),
            Filter::Or(filters) => Filter::Nor(filters),
            Filter::Nor(filters) => Filter::Or(filters),
            Filter::Expr(expr) => Filter::Expr(match expr {
                AggExpr::Op { name, mut args } if name == "$not" && args.len() == 1 => args.remove(0),
                other => AggExpr::op("$not", vec![other]),
            }),
        }
    }

    /// Flatten nested conjunctions and disjunctions and fold constant branches.
    pub fn simplify(self) -> Filter {
        match self {
            Filter::And(filters) => {
                let mut out = Vec::new();
                for filter in filters.into_iter().map(Filter::simplify) {
                    match filter {
                        Filter::True => {}
                        Filter::False => return Filter::False,
                        Filter::And(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Filter::True,
                    1 => out.remove(0),
                    _ => Filter::And(out),
                }
            }
            Filter::Or(filters) => {
                let mut out = Vec::new();
                for filter in filters.into_iter().map(Filter::simplify) {
                    match filter {
                        Filter::False => {}
                        Filter::True => return Filter::True,
                        Filter::Or(inner) => out.extend(inner),
                        other => out.push(other),
                    }
                }
                match out.len() {
                    0 => Filter::False,
                    1 => out.remove(0),
                    _ => Filter::Or(out),
                }
            }
            Filter::Nor(filters) => {
                let mut out = Vec::new();
                for filter in filters.into_iter().map(Filter::simplify) {
                    match filter {
                        Filter::False => {}
                        Filter::True => return Filter::False,
                        other => out.push(other),
                    }
                }
                if out.is_empty() { Filter::True } else { Filter::Nor(out) }
            }
            Filter::Field { op: FieldOp::In(values), .. } if values.is_empty() => Filter::False,
            Filter::Field { path, op: FieldOp::ElemMatch(inner) } => match inner.simplify() {
                Filter::False => Filter::False,
                inner => Filter::Field { path, op: FieldOp::ElemMatch(Box::new(inner)) },
            },
            Filter::Expr(AggExpr::Literal(Value::Boolean(b))) => {
                if b { Filter::True } else { Filter::False }
            }
            other => other,
        }
    }

    /// An `$elemMatch` over this body, or `None` when the body has no
    /// faithful rendering. Tests on the element itself must sit at the top
    /// level and use distinct operators.
    pub fn element_match(self) -> Option<FieldOp> {
        let body = match self {
            Filter::And(filters) if filters.iter().all(Filter::is_element_test) => {
                let mut filters = fold_exclusions(filters);
                if filters.len() == 1 {
                    filters.remove(0)
                } else {
                    element_operators(&filters)?;
                    Filter::And(filters)
                }
            }
            body if body.is_element_test() => body,
            body if body.tests_element() => return None,
            body => body,
        };
        Some(FieldOp::ElemMatch(Box::new(body)))
    }

    fn is_element_test(&self) -> bool {
        matches!(self, Filter::Field { path, .. } if path.is_empty())
    }

    fn tests_element(&self) -> bool {
        match self {
            Filter::Field { path, .. } => path.is_empty(),
            Filter::And(filters) | Filter::Or(filters) | Filter::Nor(filters) => {
                filters.iter().any(Filter::tests_element)
            }
            _ => false,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Document(self.to_document())
    }

    pub fn to_document(&self) -> Document {
        match self {
            Filter::True => Document::new(),
            Filter::False => {
                let mut doc = Document::new();
                doc.insert("_id", Value::Document(crate::doc! { "$type" => -1 }));
                doc
            }
            Filter::Field { path, op } => {
                let mut doc = Document::new();
                doc.insert(path.clone(), op.to_value());
                doc
            }
            Filter::And(filters) => merge_conjunction(filters).unwrap_or_else(|| {
                crate::doc! { "$and" => Value::Array(filters.iter().map(Filter::to_value).collect()) }
            }),
            Filter::Or(filters) => {
                crate::doc! { "$or" => Value::Array(filters.iter().map(Filter::to_value).collect()) }
            }
            Filter::Nor(filters) => {
                crate::doc! { "$nor" => Value::Array(filters.iter().map(Filter::to_value).collect()) }
            }
            Filter::Expr(expr) => crate::doc! { "$expr" => expr.to_value() },
        }
    }
}

/// Render `{ a : x, b : y }` for a conjunction when no key collides, merging
/// operator documents that test the same field.
fn merge_conjunction(filters: &[Filter]) -> Option<Document> {
    let mut merged = Document::new();
    for filter in filters {
        for (key, value) in filter.to_document() {
            if key.starts_with('$') && merged.contains_key(&key) {
                return None;
            }
            if !merged.contains_key(&key) {
                merged.insert(key, value);
                continue;
            }
            match (merged.get_mut(&key), value) {
                (Some(Value::Document(existing)), Value::Document(ops))
                    if is_operator_document(existing) && is_operator_document(&ops) =>
                {
                    for (op, v) in ops {
                        if existing.contains_key(&op) {
                            return None;
                        }
                        existing.insert(op, v);
                    }
                }
                _ => return None,
            }
        }
    }
    Some(merged)
}

fn is_operator_document(doc: &Document) -> bool {
    !doc.is_empty() && doc.keys().all(|k| k.starts_with('$'))
}

impl FieldOp {
    pub fn negate(self) -> FieldOp {
        match self {
            FieldOp::Eq(v) => FieldOp::Ne(v),
            FieldOp::Ne(v) => FieldOp::Eq(v),
            FieldOp::In(vs) => FieldOp::Nin(vs),
            FieldOp::Nin(vs) => FieldOp::In(vs),
            FieldOp::Exists(b) => FieldOp::Exists(!b),
            FieldOp::Not(op) => *op,
            other => FieldOp::Not(Box::new(other)),
        }
    }

    /// Operator document of the test (`{ $gt : 1 }`), or the bare value for
    /// direct equality and patterns.
    pub fn to_value(&self) -> Value {
        let op = |name: &str, value: Value| Value::Document(crate::doc! { name => value });
        match self {
            FieldOp::Eq(value) if needs_explicit_eq(value) => op("$eq", value.clone()),
            FieldOp::Eq(value) => value.clone(),
            FieldOp::Ne(value) => op("$ne", value.clone()),
            FieldOp::Gt(value) => op("$gt", value.clone()),
            FieldOp::Gte(value) => op("$gte", value.clone()),
            FieldOp::Lt(value) => op("$lt", value.clone()),
            FieldOp::Lte(value) => op("$lte", value.clone()),
            FieldOp::In(values) => op("$in", Value::Array(values.clone())),
            FieldOp::Nin(values) => op("$nin", Value::Array(values.clone())),
            FieldOp::Exists(b) => op("$exists", Value::Boolean(*b)),
            FieldOp::Size(n) => op("$size", number(*n)),
            FieldOp::Regex { pattern, options } => Value::Regex {
                pattern: pattern.clone(),
                options: options.clone(),
            },
            FieldOp::ElemMatch(filter) => op("$elemMatch", element_filter(filter)),
            FieldOp::Not(inner) => op(
                "$not",
                match inner.as_ref() {
                    FieldOp::Eq(value) => op("$eq", value.clone()),
                    other => other.to_value(),
                },
            ),
            FieldOp::Type(alias) => op("$type", alias.clone()),
        }
    }
}

/// `$elemMatch` body: element-level tests render as bare operator documents.
fn element_filter(filter: &Filter) -> Value {
    match filter {
        Filter::Field { path, op } if path.is_empty() => match op {
            FieldOp::Eq(value) => Value::Document(crate::doc! { "$eq" => value.clone() }),
            FieldOp::Regex { .. } => Value::Document(crate::doc! { "$regex" => op.to_value() }),
            other => other.to_value(),
        },
        Filter::And(filters) if filters.iter().all(Filter::is_element_test) => {
            element_operators(filters).map(Value::Document).unwrap_or_else(|| filter.to_value())
        }
        other => other.to_value(),
    }
}

/// Operators of a conjunction of element tests, `None` when two share a name.
fn element_operators(filters: &[Filter]) -> Option<Document> {
    let mut merged = Document::new();
    for filter in filters {
        let Value::Document(ops) = element_filter(filter) else {
            return None;
        };
        for (op, value) in ops {
            if merged.contains_key(&op) {
                return None;
            }
            merged.insert(op, value);
        }
    }
    Some(merged)
}

/// Element `!=` tests as one `$nin` in the position of the first.
fn fold_exclusions(filters: Vec<Filter>) -> Vec<Filter> {
    let excluded = |filter: &Filter| match filter {
        Filter::Field { op: FieldOp::Ne(value), .. } => Some(vec![value.clone()]),
        Filter::Field { op: FieldOp::Nin(values), .. } => Some(values.clone()),
        _ => None,
    };
    if filters.iter().filter(|f| excluded(f).is_some()).count() < 2 {
        return filters;
    }
    let mut values = Vec::new();
    let mut slot = None;
    let mut out = Vec::with_capacity(filters.len());
    for filter in filters {
        match excluded(&filter) {
            Some(more) => {
                values.extend(more);
                if slot.is_none() {
                    slot = Some(out.len());
                    out.push(Filter::True);
                }
            }
            None => out.push(filter),
        }
    }
    if let Some(index) = slot {
        out[index] = Filter::field("", FieldOp::Nin(values));
    }
    out
}

fn needs_explicit_eq(value: &Value) -> bool {
    match value {
        Value::Regex { .. } => true,
        Value::Document(doc) => doc.keys().any(|k| k.starts_with('$')),
        _ => false,
    }
}

pub(crate) fn number(n: i64) -> Value {
    match i32::try_from(n) {
        Ok(small) => Value::Int32(small),
        Err(_) => Value::Int64(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn false_renders_as_the_sentinel() {
        assert_eq!(Filter::False.to_value().to_string(), "{ _id : { $type : -1 } }");
        assert_eq!(Filter::True.to_value().to_string(), "{ }");
    }

    #[test]
    fn conjunctions_merge_same_field_operators() {
        let filter = Filter::And(vec![
            Filter::field("Tags", FieldOp::Ne(Value::Null)),
            Filter::field("Tags", FieldOp::Not(Box::new(FieldOp::Size(0)))),
        ]);
        assert_eq!(
            filter.to_value().to_string(),
            "{ Tags : { $ne : null, $not : { $size : 0 } } }"
        );
    }

    #[test]
    fn colliding_conjunctions_use_and() {
        let filter = Filter::And(vec![
            Filter::field("A", FieldOp::Eq(1.into())),
            Filter::field("A", FieldOp::Eq(2.into())),
        ]);
        assert_eq!(filter.to_value().to_string(), "{ $and : [{ A : 1 }, { A : 2 }] }");
    }

    #[test]
    fn element_exclusions_fold_into_nin() {
        let body = Filter::And(vec![
            Filter::field("", FieldOp::Ne(1.into())),
            Filter::field("", FieldOp::Gt(0.into())),
            Filter::field("", FieldOp::Ne(2.into())),
        ]);
        let matched = body.element_match().unwrap();
        assert_eq!(
            Filter::field("Scores", matched).to_value().to_string(),
            "{ Scores : { $elemMatch : { $nin : [1, 2], $gt : 0 } } }"
        );
    }

    #[test]
    fn repeated_element_operators_have_no_element_match() {
        let body = Filter::And(vec![
            Filter::field("", FieldOp::Gt(2.into())),
            Filter::field("", FieldOp::Gt(0.into())),
        ]);
        assert_eq!(body.element_match(), None);
        let either = Filter::Or(vec![
            Filter::field("", FieldOp::Lt(1.into())),
            Filter::field("", FieldOp::Gt(5.into())),
        ]);
        assert_eq!(either.element_match(), None);
    }

    #[test]
    fn document_elements_keep_their_paths() {
        let body = Filter::Or(vec![
            Filter::field("k", FieldOp::Eq("a".into())),
            Filter::field("k", FieldOp::Eq("b".into())),
        ]);
        assert_eq!(
            Filter::field("D", body.element_match().unwrap()).to_value().to_string(),
            "{ D : { $elemMatch : { $or : [{ k : 'a' }, { k : 'b' }] } } }"
        );
    }

    #[test]
    fn simplify_folds_constant_branches() {
        let filter = Filter::And(vec![Filter::True, Filter::field("A", FieldOp::Eq(1.into()))]);
        assert_eq!(filter.simplify(), Filter::field("A", FieldOp::Eq(1.into())));
        assert_eq!(
            Filter::Or(vec![Filter::False, Filter::False]).simplify(),
            Filter::False
        );
    }
}
