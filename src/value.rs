use std::cmp::Ordering;

use rust_decimal::{
    Decimal,
    prelude::{FromPrimitive, ToPrimitive},
};

/// A document value as stored by the database and carried through translation.
///
/// The variants follow the wire types a pipeline can observe. Numbers keep
/// their width (32-bit, 64-bit, double, decimal) because the canonical stage
/// text distinguishes them (`1`, `NumberLong(1)`, `1.0`, `NumberDecimal('1')`).
///
/// # Examples
///
/// ```
/// use docstage::{Value, doc};
///
/// let person = doc! { "_id" => 1, "Name" => "John", "Tags" => vec![Value::from("a")] };
/// assert_eq!(person.get("Name"), Some(&Value::from("John")));
/// assert_eq!(Value::Document(person).to_string(), "{ _id : 1, Name : 'John', Tags : ['a'] }");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null (also used for missing values on the client side)
    Null,

    /// Boolean
    Boolean(bool),

    /// 32-bit integer
    Int32(i32),

    /// 64-bit integer, rendered as `NumberLong(n)`
    Int64(i64),

    /// Double precision float
    Double(f64),

    /// 128-bit decimal, rendered as `NumberDecimal('d')`
    Decimal(Decimal),

    /// UTF-8 string
    String(String),

    /// Regular expression with its option flags
    Regex { pattern: String, options: String },

    /// UTC date time in milliseconds since the epoch
    DateTime(i64),

    /// Array of values
    Array(Vec<Value>),

    /// Ordered document
    Document(Document),
}

/// An insertion-ordered document.
///
/// Field order is significant: stage bodies render fields in the order they
/// were inserted, and `$sort` specifications depend on it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Document { entries: Vec::new() }
    }

    /// Insert a field, replacing an existing field with the same name in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Resolve a dotted path (`a.b.0.c`) through nested documents and arrays.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.get(first)?;
        for segment in segments {
            current = match current {
                Value::Document(doc) => doc.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut doc = Document::new();
        for (k, v) in iter {
            doc.insert(k, v);
        }
        doc
    }
}

impl IntoIterator for Document {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Build a [`Document`] from `key => value` pairs.
#[macro_export]
macro_rules! doc {
    () => {
        $crate::value::Document::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut document = $crate::value::Document::new();
        $( document.insert($key, $value); )+
        document
    }};
}

impl Value {
    /// The server-side type alias (as reported by `$type`).
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "bool",
            Value::Int32(_) => "int",
            Value::Int64(_) => "long",
            Value::Double(_) => "double",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::Regex { .. } => "regex",
            Value::DateTime(_) => "date",
            Value::Array(_) => "array",
            Value::Document(_) => "object",
        }
    }

    /// Truthiness under aggregation semantics: only null, false and numeric zero are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Int32(n) => *n != 0,
            Value::Int64(n) => *n != 0,
            Value::Double(n) => *n != 0.0,
            Value::Decimal(d) => !d.is_zero(),
            _ => true,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self,
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) | Value::Decimal(_)
        )
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(n) => Some(*n as f64),
            Value::Int64(n) => Some(*n as f64),
            Value::Double(n) => Some(*n),
            Value::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    /// Integer view of a numeric value; doubles and decimals must be whole.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(n) => Some(*n as i64),
            Value::Int64(n) => Some(*n),
            Value::Double(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            Value::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Int32(n) => Some(Decimal::from(*n)),
            Value::Int64(n) => Some(Decimal::from(*n)),
            Value::Double(n) => Decimal::from_f64(*n),
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Canonical sort rank of the value's type in the server's comparison order.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 1,
            Value::Int32(_) | Value::Int64(_) | Value::Double(_) | Value::Decimal(_) => 2,
            Value::String(_) => 3,
            Value::Document(_) => 4,
            Value::Array(_) => 5,
            Value::Boolean(_) => 8,
            Value::DateTime(_) => 9,
            Value::Regex { .. } => 11,
        }
    }

    /// Total order across types, numbers compared by value regardless of width.
    pub fn compare(&self, other: &Value) -> Ordering {
        let (left, right) = (self.type_rank(), other.type_rank());
        if left != right {
            return left.cmp(&right);
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => compare_sequences(a.iter(), b.iter()),
            (Value::Document(a), Value::Document(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ordering = va.compare(vb).then_with(|| ka.cmp(kb));
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                a.len().cmp(&b.len())
            }
            (
                Value::Regex { pattern: pa, options: oa },
                Value::Regex { pattern: pb, options: ob },
            ) => pa.cmp(pb).then_with(|| oa.cmp(ob)),
            (a, b) => compare_numbers(a, b),
        }
    }

    /// Equality with numeric values compared across widths (`1 == NumberLong(1)`).
    pub fn loose_eq(&self, other: &Value) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

fn compare_sequences<'a>(
    mut a: impl Iterator<Item = &'a Value>,
    mut b: impl Iterator<Item = &'a Value>,
) -> Ordering {
    loop {
        match (a.next(), b.next()) {
            (Some(x), Some(y)) => {
                let ordering = x.compare(y);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    match (a.as_decimal(), b.as_decimal()) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int32(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int64(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Decimal(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Document(doc)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    /// Converts relaxed extended JSON: `$numberLong`, `$numberDecimal`,
    /// `$date` and `$regularExpression` wrappers are recognised.
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => match i32::try_from(i) {
                    Ok(small) => Value::Int32(small),
                    Err(_) => Value::Int64(i),
                },
                None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1
                    && let Some((key, inner)) = map.iter().next()
                    && let Some(value) = extended_json(key, inner)
                {
                    return value;
                }
                Value::Document(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

fn extended_json(key: &str, inner: &serde_json::Value) -> Option<Value> {
    match key {
        "$numberLong" => inner.as_str()?.parse().ok().map(Value::Int64),
        "$numberInt" => inner.as_str()?.parse().ok().map(Value::Int32),
        "$numberDouble" => inner.as_str()?.parse().ok().map(Value::Double),
        "$numberDecimal" => inner.as_str()?.parse().ok().map(Value::Decimal),
        "$date" => match inner {
            serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| Value::DateTime(d.timestamp_millis())),
            serde_json::Value::Number(n) => n.as_i64().map(Value::DateTime),
            _ => None,
        },
        "$regularExpression" => {
            let pattern = inner.get("pattern")?.as_str()?.to_string();
            let options = inner.get("options")?.as_str()?.to_string();
            Some(Value::Regex { pattern, options })
        }
        _ => None,
    }
}

impl Value {
    /// Relaxed extended JSON view of the value.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => json!(b),
            Value::Int32(n) => json!(n),
            Value::Int64(n) => json!(n),
            Value::Double(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| json!({ "$numberDouble": n.to_string() })),
            Value::Decimal(d) => json!({ "$numberDecimal": d.to_string() }),
            Value::String(s) => json!(s),
            Value::Regex { pattern, options } => {
                json!({ "$regularExpression": { "pattern": pattern, "options": options } })
            }
            Value::DateTime(ms) => match chrono::DateTime::from_timestamp_millis(*ms) {
                Some(date) => json!({ "$date": date.to_rfc3339_opts(chrono::SecondsFormat::Millis, true) }),
                None => json!({ "$date": ms }),
            },
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Document(doc) => serde_json::Value::Object(
                doc.iter().map(|(k, v)| (k.to_string(), v.to_json())).collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_across_widths() {
        assert!(Value::Int32(1).loose_eq(&Value::Int64(1)));
        assert!(Value::Double(1.5).loose_eq(&Value::Decimal(Decimal::new(15, 1))));
        assert_eq!(Value::Int32(2).compare(&Value::Double(1.5)), Ordering::Greater);
    }

    #[test]
    fn type_order_puts_null_before_numbers_before_strings() {
        assert_eq!(Value::Null.compare(&Value::Int32(0)), Ordering::Less);
        assert_eq!(Value::Int32(100).compare(&Value::from("a")), Ordering::Less);
        assert_eq!(Value::Boolean(false).compare(&Value::from("z")), Ordering::Greater);
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut d = doc! { "a" => 1, "b" => 2 };
        d.insert("a", 3);
        assert_eq!(d.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(d.get("a"), Some(&Value::Int32(3)));
    }

    #[test]
    fn dotted_paths_walk_arrays() {
        let d = doc! { "a" => doc! { "b" => vec![Value::from(10), Value::from(20)] } };
        assert_eq!(d.get_path("a.b.1"), Some(&Value::Int32(20)));
        assert_eq!(d.get_path("a.c"), None);
    }

    #[test]
    fn extended_json_wrappers() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"n": {"$numberLong": "5"}, "d": {"$numberDecimal": "1.25"}}"#)
                .unwrap();
        let value = Value::from(json);
        let doc = value.as_document().unwrap();
        assert_eq!(doc.get("n"), Some(&Value::Int64(5)));
        assert_eq!(doc.get("d"), Some(&Value::Decimal(Decimal::new(125, 2))));
    }
}
