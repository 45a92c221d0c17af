//! Serializer bindings: the wire representation of a value and the mapping
//! from members to element names.
//!
//! Every translated subtree carries exactly one [`Serializer`]. Member access
//! consults it to find the element name and the member's own serializer;
//! comparisons consult it to serialize constants the way the field is stored.

use std::sync::Arc;

use crate::value::{Document, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecimalRepresentation {
    /// Stored as a 128-bit decimal
    Decimal128,
    /// Stored as its invariant string form
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharRepresentation {
    /// Stored as the code point
    Int32,
    /// Stored as a one-character string
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictionaryRepresentation {
    /// `{ key : value, ... }` (keys must serialize as strings)
    Document,
    /// `[[key, value], ...]`
    ArrayOfArrays,
    /// `[{ k : key, v : value }, ...]`
    ArrayOfDocuments,
}

/// Wire representation of a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Serializer {
    Int32,
    Int64,
    Double,
    Decimal(DecimalRepresentation),
    String,
    Char(CharRepresentation),
    Boolean,
    DateTime,

    /// Untyped document value; members map to elements of the same name
    Any,

    Nullable(Box<Serializer>),

    Array(Box<Serializer>),

    Dictionary {
        representation: DictionaryRepresentation,
        key: Box<Serializer>,
        value: Box<Serializer>,
    },

    /// An enumerated dictionary entry. Positional entries are two-element
    /// arrays, the others are `{ k, v }` documents.
    KeyValuePair {
        key: Box<Serializer>,
        value: Box<Serializer>,
        positional: bool,
    },

    /// A mapped class
    Class(Arc<ClassMap>),

    /// Result of `GroupBy`: `{ _id : key, _elements : [element, ...] }`
    Grouping {
        key: Box<Serializer>,
        element: Box<Serializer>,
    },

    /// A scalar result wrapped in a synthesized `_v` field
    Wrapped(Box<Serializer>),
}

/// How a member is stored inside its containing document.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberMap {
    pub member_name: String,
    pub element_name: String,
    pub serializer: Serializer,
}

/// Member to element mapping of a class, plus its discriminator.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassMap {
    pub type_name: String,
    pub members: Vec<MemberMap>,
    /// Discriminator value; defaults to the type name
    pub discriminator: Option<String>,
    pub base_type: Option<String>,
    /// Synthesized for an anonymous or computed projection
    pub anonymous: bool,
}

impl ClassMap {
    pub fn builder(type_name: impl Into<String>) -> ClassMapBuilder {
        ClassMapBuilder {
            map: ClassMap {
                type_name: type_name.into(),
                members: Vec::new(),
                discriminator: None,
                base_type: None,
                anonymous: false,
            },
        }
    }

    /// Class map of an anonymous projection with the given members.
    pub fn anonymous(members: Vec<(String, Serializer)>) -> ClassMap {
        let mut builder = ClassMap::builder("<anonymous>");
        for (name, serializer) in members {
            builder = builder.member(name, serializer);
        }
        let mut map = builder.build();
        map.anonymous = true;
        map
    }

    pub fn member(&self, name: &str) -> Option<&MemberMap> {
        self.members.iter().find(|m| m.member_name == name)
    }

    pub fn discriminator_value(&self) -> &str {
        self.discriminator.as_deref().unwrap_or(&self.type_name)
    }
}

pub struct ClassMapBuilder {
    map: ClassMap,
}

impl ClassMapBuilder {
    /// Map a member to an element of the same name. `Id` maps to `_id`.
    pub fn member(self, name: impl Into<String>, serializer: Serializer) -> Self {
        let name = name.into();
        let element = if name == "Id" { "_id".to_string() } else { name.clone() };
        self.member_element(name, element, serializer)
    }

    /// Map a member to an explicitly named element.
    pub fn member_element(
        mut self,
        name: impl Into<String>,
        element: impl Into<String>,
        serializer: Serializer,
    ) -> Self {
        let member_name = name.into();
        let element_name = element.into();
        match self.map.members.iter_mut().find(|m| m.member_name == member_name) {
            Some(existing) => {
                existing.element_name = element_name;
                existing.serializer = serializer;
            }
            None => self.map.members.push(MemberMap {
                member_name,
                element_name,
                serializer,
            }),
        }
        self
    }

    pub fn discriminator(mut self, value: impl Into<String>) -> Self {
        self.map.discriminator = Some(value.into());
        self
    }

    pub fn base_type(mut self, base: impl Into<String>) -> Self {
        self.map.base_type = Some(base.into());
        self
    }

    pub fn build(self) -> ClassMap {
        self.map
    }
}

impl Serializer {
    pub fn nullable(inner: Serializer) -> Serializer {
        match inner {
            Serializer::Nullable(_) => inner,
            other => Serializer::Nullable(Box::new(other)),
        }
    }

    pub fn array(item: Serializer) -> Serializer {
        Serializer::Array(Box::new(item))
    }

    pub fn class(map: ClassMap) -> Serializer {
        Serializer::Class(Arc::new(map))
    }

    /// The serializer with any nullable wrapper removed.
    pub fn underlying(&self) -> &Serializer {
        match self {
            Serializer::Nullable(inner) => inner.underlying(),
            other => other,
        }
    }

    /// Name used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Serializer::Int32 => "int".to_string(),
            Serializer::Int64 => "long".to_string(),
            Serializer::Double => "double".to_string(),
            Serializer::Decimal(DecimalRepresentation::Decimal128) => "decimal".to_string(),
            Serializer::Decimal(DecimalRepresentation::String) => "decimal (as string)".to_string(),
            Serializer::String => "string".to_string(),
            Serializer::Char(CharRepresentation::Int32) => "char (as int)".to_string(),
            Serializer::Char(CharRepresentation::String) => "char (as string)".to_string(),
            Serializer::Boolean => "bool".to_string(),
            Serializer::DateTime => "DateTime".to_string(),
            Serializer::Any => "document".to_string(),
            Serializer::Nullable(inner) => format!("{}?", inner.describe()),
            Serializer::Array(inner) => format!("{}[]", inner.describe()),
            Serializer::Dictionary { key, value, .. } => {
                format!("Dictionary<{}, {}>", key.describe(), value.describe())
            }
            Serializer::KeyValuePair { key, value, .. } => {
                format!("KeyValuePair<{}, {}>", key.describe(), value.describe())
            }
            Serializer::Class(map) => map.type_name.clone(),
            Serializer::Grouping { key, element } => {
                format!("IGrouping<{}, {}>", key.describe(), element.describe())
            }
            Serializer::Wrapped(inner) => inner.describe(),
        }
    }

    /// Element name and serializer of a member.
    ///
    /// Returns `None` when the member cannot be resolved, which the translator
    /// reports as an ambiguous member.
    pub fn member(&self, name: &str) -> Option<(String, Serializer)> {
        match self {
            Serializer::Class(map) => map
                .member(name)
                .map(|m| (m.element_name.clone(), m.serializer.clone())),
            Serializer::Any => Some((name.to_string(), Serializer::Any)),
            Serializer::Nullable(inner) => match name {
                "Value" => None,
                _ => inner.member(name),
            },
            Serializer::Grouping { key, .. } if name == "Key" => {
                Some(("_id".to_string(), (**key).clone()))
            }
            Serializer::KeyValuePair { key, value, positional: false } => match name {
                "Key" => Some(("k".to_string(), (**key).clone())),
                "Value" => Some(("v".to_string(), (**value).clone())),
                _ => None,
            },
            Serializer::Wrapped(inner) => inner.member(name),
            _ => None,
        }
    }

    /// Serializer of the items produced by enumerating a value.
    pub fn item(&self) -> Option<Serializer> {
        match self {
            Serializer::Array(item) => Some((**item).clone()),
            Serializer::Any => Some(Serializer::Any),
            Serializer::Nullable(inner) => inner.item(),
            Serializer::Dictionary { representation, key, value } => Some(Serializer::KeyValuePair {
                key: key.clone(),
                value: value.clone(),
                positional: *representation == DictionaryRepresentation::ArrayOfArrays,
            }),
            Serializer::Grouping { element, .. } => Some((**element).clone()),
            Serializer::String => Some(Serializer::Char(CharRepresentation::String)),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.numeric_rank().is_some()
    }

    /// Width class of numeric serializers: int, long, double, decimal.
    pub fn numeric_rank(&self) -> Option<u8> {
        match self.underlying() {
            Serializer::Int32 | Serializer::Char(CharRepresentation::Int32) => Some(0),
            Serializer::Int64 => Some(1),
            Serializer::Double => Some(2),
            Serializer::Decimal(DecimalRepresentation::Decimal128) => Some(3),
            _ => None,
        }
    }

    /// True for values stored as strings (strings, string chars, string decimals).
    pub fn is_string(&self) -> bool {
        matches!(
            self.underlying(),
            Serializer::String | Serializer::Char(CharRepresentation::String)
        )
    }

    pub fn is_array(&self) -> bool {
        matches!(self.underlying(), Serializer::Array(_))
    }

    /// True when the serializer can represent a missing or null value.
    pub fn is_nullable(&self) -> bool {
        !matches!(
            self,
            Serializer::Int32
                | Serializer::Int64
                | Serializer::Double
                | Serializer::Decimal(_)
                | Serializer::Char(_)
                | Serializer::Boolean
                | Serializer::DateTime
        )
    }

    /// Convert a client value to the form this serializer stores.
    pub fn serialize_constant(&self, value: &Value) -> Result<Value, String> {
        let mismatch = || format!("cannot serialize {} as {}", value, self.describe());
        if value.is_null() {
            return Ok(Value::Null);
        }
        Ok(match self {
            Serializer::Int32 => match value.as_i64().map(i32::try_from) {
                Some(Ok(n)) => Value::Int32(n),
                _ => return Err(mismatch()),
            },
            Serializer::Int64 => Value::Int64(value.as_i64().ok_or_else(mismatch)?),
            Serializer::Double => Value::Double(value.as_f64().ok_or_else(mismatch)?),
            Serializer::Decimal(representation) => {
                let decimal = value.as_decimal().ok_or_else(mismatch)?;
                match representation {
                    DecimalRepresentation::Decimal128 => Value::Decimal(decimal),
                    DecimalRepresentation::String => Value::String(decimal.to_string()),
                }
            }
            Serializer::Char(representation) => {
                let code = match value {
                    Value::String(s) if s.chars().count() == 1 => s.chars().next().map(|c| c as u32),
                    other => other.as_i64().and_then(|n| u32::try_from(n).ok()),
                };
                let c = code.and_then(char::from_u32).ok_or_else(mismatch)?;
                match representation {
                    CharRepresentation::Int32 => Value::Int32(c as i32),
                    CharRepresentation::String => Value::String(c.to_string()),
                }
            }
            Serializer::String => match value {
                Value::String(_) => value.clone(),
                _ => return Err(mismatch()),
            },
            Serializer::Boolean => match value {
                Value::Boolean(_) => value.clone(),
                _ => return Err(mismatch()),
            },
            Serializer::DateTime => match value {
                Value::DateTime(_) => value.clone(),
                _ => return Err(mismatch()),
            },
            Serializer::Nullable(inner) | Serializer::Wrapped(inner) => inner.serialize_constant(value)?,
            Serializer::Array(item) => match value {
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|i| item.serialize_constant(i))
                        .collect::<Result<_, _>>()?,
                ),
                _ => return Err(mismatch()),
            },
            Serializer::Dictionary { representation, key, value: value_serializer } => {
                let Value::Document(doc) = value else {
                    return Err(mismatch());
                };
                let mut entries = Vec::new();
                for (k, v) in doc.iter() {
                    let k = key.serialize_constant(&Value::from(k))?;
                    let v = value_serializer.serialize_constant(v)?;
                    entries.push((k, v));
                }
                match representation {
                    DictionaryRepresentation::Document => {
                        let mut out = Document::new();
                        for (k, v) in entries {
                            let Value::String(k) = k else {
                                return Err(mismatch());
                            };
                            out.insert(k, v);
                        }
                        Value::Document(out)
                    }
                    DictionaryRepresentation::ArrayOfArrays => Value::Array(
                        entries.into_iter().map(|(k, v)| Value::Array(vec![k, v])).collect(),
                    ),
                    DictionaryRepresentation::ArrayOfDocuments => Value::Array(
                        entries
                            .into_iter()
                            .map(|(k, v)| Value::Document(crate::doc! { "k" => k, "v" => v }))
                            .collect(),
                    ),
                }
            }
            Serializer::Class(map) => match value {
                Value::Document(doc) => {
                    let mut out = Document::new();
                    for (name, v) in doc.iter() {
                        match map.member(name) {
                            Some(m) => out.insert(m.element_name.clone(), m.serializer.serialize_constant(v)?),
                            None => out.insert(name, v.clone()),
                        }
                    }
                    Value::Document(out)
                }
                _ => return Err(mismatch()),
            },
            Serializer::Any | Serializer::KeyValuePair { .. } | Serializer::Grouping { .. } => {
                value.clone()
            }
        })
    }

    /// Infer a serializer for a constant with no field to take one from.
    pub fn for_value(value: &Value) -> Serializer {
        match value {
            Value::Int32(_) => Serializer::Int32,
            Value::Int64(_) => Serializer::Int64,
            Value::Double(_) => Serializer::Double,
            Value::Decimal(_) => Serializer::Decimal(DecimalRepresentation::Decimal128),
            Value::String(_) => Serializer::String,
            Value::Boolean(_) => Serializer::Boolean,
            Value::DateTime(_) => Serializer::DateTime,
            Value::Array(items) => Serializer::array(
                items.first().map(Serializer::for_value).unwrap_or(Serializer::Any),
            ),
            Value::Null | Value::Regex { .. } | Value::Document(_) => Serializer::Any,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn person() -> Serializer {
        Serializer::class(
            ClassMap::builder("Person")
                .member("Id", Serializer::Int32)
                .member_element("Name", "name", Serializer::String)
                .member("Price", Serializer::Decimal(DecimalRepresentation::String))
                .build(),
        )
    }

    #[test]
    fn members_map_to_element_names() {
        let person = person();
        assert_eq!(person.member("Id").unwrap().0, "_id");
        assert_eq!(person.member("Name").unwrap().0, "name");
        assert_eq!(person.member("Missing"), None);
    }

    #[test]
    fn constants_follow_the_field_representation() {
        let (_, price) = person().member("Price").unwrap();
        assert_eq!(
            price.serialize_constant(&Value::Decimal(Decimal::new(15, 1))),
            Ok(Value::from("1.5"))
        );
        assert_eq!(
            Serializer::Char(CharRepresentation::Int32).serialize_constant(&Value::from("a")),
            Ok(Value::Int32(97))
        );
        assert!(Serializer::Int32.serialize_constant(&Value::from("x")).is_err());
    }

    #[test]
    fn dictionaries_enumerate_as_key_value_pairs() {
        let dictionary = Serializer::Dictionary {
            representation: DictionaryRepresentation::ArrayOfArrays,
            key: Box::new(Serializer::String),
            value: Box::new(Serializer::Int32),
        };
        assert!(matches!(
            dictionary.item(),
            Some(Serializer::KeyValuePair { positional: true, .. })
        ));
    }
}
