//! Registry configuration files.
//!
//! ```json
//! {
//!   "discriminator": { "field": "_t", "convention": "hierarchical" },
//!   "classes": [
//!     { "name": "Person", "members": [
//!         { "name": "Id", "type": "int" },
//!         { "name": "Name", "type": "string", "element": "name" },
//!         { "name": "Price", "type": "decimal", "representation": "string" },
//!         { "name": "Scores", "type": "Dictionary<string, int>", "representation": "arrayOfDocuments" }
//!     ] },
//!     { "name": "Employee", "base": "Person", "discriminator": "emp", "members": [] }
//!   ]
//! }
//! ```

use std::{collections::HashMap, fs, path::Path};

use serde::Deserialize;
use thiserror::Error;

use super::{DiscriminatorConvention, SerializerRegistry};
use crate::serializer::{
    CharRepresentation, ClassMap, DecimalRepresentation, DictionaryRepresentation, Serializer,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read registry configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid registry configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown type '{type_name}' for member '{member}'")]
    UnknownType { type_name: String, member: String },

    #[error("invalid type syntax '{0}'")]
    InvalidType(String),

    #[error("representation '{representation}' does not apply to '{type_name}'")]
    InvalidRepresentation { representation: String, type_name: String },

    #[error("class '{0}' is defined in terms of itself")]
    Cycle(String),

    #[error("class '{0}' is defined more than once")]
    Duplicate(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default)]
    pub discriminator: Option<DiscriminatorConfig>,
    #[serde(default)]
    pub classes: Vec<ClassConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscriminatorConfig {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub convention: Option<ConventionConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConventionConfig {
    Scalar,
    Hierarchical,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassConfig {
    pub name: String,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub members: Vec<MemberConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemberConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub element: Option<String>,
    #[serde(default)]
    pub representation: Option<String>,
}

impl RegistryConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Build a registry, resolving class references in dependency order.
    pub fn build(&self) -> Result<SerializerRegistry, ConfigError> {
        let mut registry = SerializerRegistry::new();
        if let Some(discriminator) = &self.discriminator {
            if let Some(field) = &discriminator.field {
                registry = registry.with_discriminator_field(field.clone());
            }
            if let Some(convention) = discriminator.convention {
                registry = registry.with_convention(match convention {
                    ConventionConfig::Scalar => DiscriminatorConvention::Scalar,
                    ConventionConfig::Hierarchical => DiscriminatorConvention::Hierarchical,
                });
            }
        }

        let mut classes = HashMap::new();
        for class in &self.classes {
            if classes.insert(class.name.as_str(), class).is_some() {
                return Err(ConfigError::Duplicate(class.name.clone()));
            }
        }

        let mut resolver = Resolver {
            classes,
            registry,
            in_progress: Vec::new(),
        };
        for class in &self.classes {
            resolver.resolve_class(&class.name)?;
        }
        Ok(resolver.registry)
    }
}

struct Resolver<'c> {
    classes: HashMap<&'c str, &'c ClassConfig>,
    registry: SerializerRegistry,
    in_progress: Vec<String>,
}

impl Resolver<'_> {
    fn resolve_class(&mut self, name: &str) -> Result<(), ConfigError> {
        if self.registry.class(name).is_some() {
            return Ok(());
        }
        if self.in_progress.iter().any(|n| n == name) {
            return Err(ConfigError::Cycle(name.to_string()));
        }
        let Some(class) = self.classes.get(name).copied() else {
            return Ok(());
        };
        self.in_progress.push(name.to_string());

        if let Some(base) = &class.base {
            self.resolve_class(base)?;
        }
        let mut builder = ClassMap::builder(&class.name);
        if let Some(base) = &class.base {
            builder = builder.base_type(base);
        }
        if let Some(discriminator) = &class.discriminator {
            builder = builder.discriminator(discriminator);
        }
        for member in &class.members {
            let serializer = self.resolve_type(&member.type_name, member)?;
            let serializer = apply_representation(serializer, member)?;
            builder = match &member.element {
                Some(element) => builder.member_element(&member.name, element, serializer),
                None => builder.member(&member.name, serializer),
            };
        }

        self.in_progress.pop();
        self.registry.register(builder.build());
        Ok(())
    }

    fn resolve_type(&mut self, text: &str, member: &MemberConfig) -> Result<Serializer, ConfigError> {
        let text = text.trim();
        if let Some(inner) = text.strip_suffix('?') {
            return Ok(Serializer::nullable(self.resolve_type(inner, member)?));
        }
        if let Some(inner) = text.strip_suffix("[]") {
            return Ok(Serializer::array(self.resolve_type(inner, member)?));
        }
        if let Some((generic, args)) = split_generic(text)? {
            return match (generic, args.as_slice()) {
                ("List" | "IList" | "IEnumerable" | "ICollection" | "HashSet", [item]) => {
                    Ok(Serializer::array(self.resolve_type(item, member)?))
                }
                ("Dictionary" | "IDictionary" | "IReadOnlyDictionary", [key, value]) => {
                    Ok(Serializer::Dictionary {
                        representation: DictionaryRepresentation::Document,
                        key: Box::new(self.resolve_type(key, member)?),
                        value: Box::new(self.resolve_type(value, member)?),
                    })
                }
                ("Nullable", [inner]) => Ok(Serializer::nullable(self.resolve_type(inner, member)?)),
                _ => Err(ConfigError::InvalidType(text.to_string())),
            };
        }
        match text {
            "int" | "Int32" => Ok(Serializer::Int32),
            "long" | "Int64" => Ok(Serializer::Int64),
            "double" | "Double" => Ok(Serializer::Double),
            "decimal" | "Decimal" => Ok(Serializer::Decimal(DecimalRepresentation::Decimal128)),
            "string" | "String" => Ok(Serializer::String),
            "char" | "Char" => Ok(Serializer::Char(CharRepresentation::Int32)),
            "bool" | "Boolean" => Ok(Serializer::Boolean),
            "DateTime" => Ok(Serializer::DateTime),
            name => {
                self.resolve_class(name)?;
                self.registry.lookup(name).ok_or_else(|| ConfigError::UnknownType {
                    type_name: name.to_string(),
                    member: member.name.clone(),
                })
            }
        }
    }
}

/// Split `Name<A, B<C>>` into `("Name", ["A", "B<C>"])`.
fn split_generic(text: &str) -> Result<Option<(&str, Vec<&str>)>, ConfigError> {
    let Some(open) = text.find('<') else {
        return Ok(None);
    };
    let Some(inner) = text[open + 1..].strip_suffix('>') else {
        return Err(ConfigError::InvalidType(text.to_string()));
    };
    let mut args = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth -= 1,
            ',' if depth == 0 => {
                args.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    args.push(inner[start..].trim());
    Ok(Some((text[..open].trim(), args)))
}

fn apply_representation(serializer: Serializer, member: &MemberConfig) -> Result<Serializer, ConfigError> {
    let Some(representation) = member.representation.as_deref() else {
        return Ok(serializer);
    };
    let invalid = || ConfigError::InvalidRepresentation {
        representation: representation.to_string(),
        type_name: member.type_name.clone(),
    };
    match serializer {
        Serializer::Nullable(inner) => Ok(Serializer::nullable(apply_representation(*inner, member)?)),
        Serializer::Decimal(_) => match representation.to_ascii_lowercase().as_str() {
            "string" => Ok(Serializer::Decimal(DecimalRepresentation::String)),
            "decimal128" => Ok(Serializer::Decimal(DecimalRepresentation::Decimal128)),
            _ => Err(invalid()),
        },
        Serializer::Char(_) => match representation.to_ascii_lowercase().as_str() {
            "string" => Ok(Serializer::Char(CharRepresentation::String)),
            "int32" => Ok(Serializer::Char(CharRepresentation::Int32)),
            _ => Err(invalid()),
        },
        Serializer::Dictionary { key, value, .. } => {
            let representation = match representation.to_ascii_lowercase().as_str() {
                "document" => DictionaryRepresentation::Document,
                "arrayofarrays" => DictionaryRepresentation::ArrayOfArrays,
                "arrayofdocuments" => DictionaryRepresentation::ArrayOfDocuments,
                _ => return Err(invalid()),
            };
            Ok(Serializer::Dictionary { representation, key, value })
        }
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_classes_in_dependency_order() {
        let config = RegistryConfig::from_json(
            r#"{
                "discriminator": { "convention": "hierarchical" },
                "classes": [
                    { "name": "Order", "members": [
                        { "name": "Lines", "type": "List<Line>" },
                        { "name": "Scores", "type": "Dictionary<string, int>", "representation": "arrayOfArrays" }
                    ] },
                    { "name": "Line", "members": [ { "name": "Price", "type": "decimal", "representation": "string" } ] }
                ]
            }"#,
        )
        .unwrap();
        let registry = config.build().unwrap();
        assert_eq!(registry.convention(), DiscriminatorConvention::Hierarchical);
        let order = registry.lookup("Order").unwrap();
        let (_, lines) = order.member("Lines").unwrap();
        let (_, price) = lines.item().unwrap().member("Price").unwrap();
        assert_eq!(price, Serializer::Decimal(DecimalRepresentation::String));
    }

    #[test]
    fn rejects_self_referencing_bases() {
        let config = RegistryConfig::from_json(
            r#"{ "classes": [ { "name": "A", "base": "B" }, { "name": "B", "base": "A" } ] }"#,
        )
        .unwrap();
        assert!(matches!(config.build(), Err(ConfigError::Cycle(_))));
    }

    #[test]
    fn reports_unknown_member_types() {
        let config = RegistryConfig::from_json(
            r#"{ "classes": [ { "name": "A", "members": [ { "name": "X", "type": "Missing" } ] } ] }"#,
        )
        .unwrap();
        assert!(matches!(config.build(), Err(ConfigError::UnknownType { .. })));
    }
}
