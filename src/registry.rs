//! The serializer registry: class maps, per-type overrides and the
//! discriminator convention.
//!
//! Registration happens before any query is translated; translation only
//! reads the registry through a shared reference.

pub mod config;

use std::{collections::HashMap, sync::Arc};

use crate::{
    ast::TypeRef,
    serializer::{CharRepresentation, ClassMap, DecimalRepresentation, Serializer},
};

pub use config::{ConfigError, RegistryConfig};

/// How the discriminator of a polymorphic document is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscriminatorConvention {
    /// `_t : 'Cat'`
    #[default]
    Scalar,
    /// `_t : ['Animal', 'Cat']` for types below the root
    Hierarchical,
}

/// Maps type names to serializers.
///
/// # Examples
///
/// ```
/// use docstage::{ClassMap, Serializer, SerializerRegistry};
///
/// let mut registry = SerializerRegistry::new();
/// registry.register(ClassMap::builder("Person").member("Name", Serializer::String).build());
/// assert!(registry.lookup("Person").is_some());
/// assert_eq!(registry.lookup("BsonDocument"), Some(Serializer::Any));
/// ```
#[derive(Debug, Clone)]
pub struct SerializerRegistry {
    classes: HashMap<String, Arc<ClassMap>>,
    /// Registration order, for deterministic subtype listings
    order: Vec<String>,
    overrides: HashMap<String, Serializer>,
    discriminator_field: String,
    convention: DiscriminatorConvention,
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        SerializerRegistry {
            classes: HashMap::new(),
            order: Vec::new(),
            overrides: HashMap::new(),
            discriminator_field: "_t".to_string(),
            convention: DiscriminatorConvention::default(),
        }
    }
}

impl SerializerRegistry {
    pub fn new() -> Self {
        SerializerRegistry::default()
    }

    pub fn with_convention(mut self, convention: DiscriminatorConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn with_discriminator_field(mut self, field: impl Into<String>) -> Self {
        self.discriminator_field = field.into();
        self
    }

    /// Register a class map. Members of an already registered base type are
    /// inherited unless the class maps them itself.
    pub fn register(&mut self, mut map: ClassMap) -> &mut Self {
        if let Some(base) = map.base_type.as_ref().and_then(|b| self.classes.get(b)) {
            let inherited: Vec<_> = base
                .members
                .iter()
                .filter(|m| map.member(&m.member_name).is_none())
                .cloned()
                .collect();
            map.members.splice(0..0, inherited);
        }
        let name = map.type_name.clone();
        if !self.classes.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.classes.insert(name, Arc::new(map));
        self
    }

    /// Register an explicit serializer for a type, taking precedence over its class map.
    pub fn register_override(&mut self, type_name: impl Into<String>, serializer: Serializer) -> &mut Self {
        self.overrides.insert(type_name.into(), serializer);
        self
    }

    pub fn discriminator_field(&self) -> &str {
        &self.discriminator_field
    }

    pub fn convention(&self) -> DiscriminatorConvention {
        self.convention
    }

    pub fn class(&self, type_name: &str) -> Option<&Arc<ClassMap>> {
        self.classes.get(type_name)
    }

    /// Serializer registered for a type name.
    pub fn lookup(&self, type_name: &str) -> Option<Serializer> {
        if let Some(serializer) = self.overrides.get(type_name) {
            return Some(serializer.clone());
        }
        if let Some(map) = self.classes.get(type_name) {
            return Some(Serializer::Class(map.clone()));
        }
        match type_name {
            "BsonDocument" | "object" | "Object" | "dynamic" => Some(Serializer::Any),
            _ => None,
        }
    }

    /// Serializer for a type named in a cast, `is` test or generic argument.
    pub fn resolve_type(&self, type_ref: &TypeRef) -> Option<Serializer> {
        Some(match type_ref {
            TypeRef::Int32 => Serializer::Int32,
            TypeRef::Int64 => Serializer::Int64,
            TypeRef::Double => Serializer::Double,
            TypeRef::Decimal => Serializer::Decimal(DecimalRepresentation::Decimal128),
            TypeRef::String => Serializer::String,
            TypeRef::Char => Serializer::Char(CharRepresentation::String),
            TypeRef::Boolean => Serializer::Boolean,
            TypeRef::DateTime => Serializer::DateTime,
            TypeRef::Object => Serializer::Any,
            TypeRef::Named(name) => return self.lookup(name),
            TypeRef::Nullable(inner) => Serializer::nullable(self.resolve_type(inner)?),
        })
    }

    /// True when `type_name` is `ancestor` or derives from it.
    pub fn is_assignable(&self, type_name: &str, ancestor: &str) -> bool {
        let mut current = Some(type_name);
        let mut depth = 0;
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            depth += 1;
            if depth > self.classes.len() {
                return false;
            }
            current = self.classes.get(name).and_then(|m| m.base_type.as_deref());
        }
        false
    }

    /// Registered types deriving (directly or not) from `type_name`, in registration order.
    pub fn subtypes_of(&self, type_name: &str) -> Vec<&ClassMap> {
        self.order
            .iter()
            .filter(|name| name.as_str() != type_name && self.is_assignable(name, type_name))
            .filter_map(|name| self.classes.get(name).map(|m| m.as_ref()))
            .collect()
    }

    /// Discriminator values a document of type `type_name` (or a subtype) may carry.
    pub fn discriminator_values(&self, type_name: &str) -> Vec<String> {
        let own = match self.classes.get(type_name) {
            Some(map) => map.discriminator_value().to_string(),
            None => type_name.to_string(),
        };
        let mut values = vec![own];
        values.extend(
            self.subtypes_of(type_name)
                .into_iter()
                .map(|m| m.discriminator_value().to_string()),
        );
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn animals() -> SerializerRegistry {
        let mut registry = SerializerRegistry::new();
        registry
            .register(ClassMap::builder("Animal").member("Name", Serializer::String).build())
            .register(
                ClassMap::builder("Cat")
                    .base_type("Animal")
                    .member("Lives", Serializer::Int32)
                    .build(),
            )
            .register(ClassMap::builder("Lion").base_type("Cat").build());
        registry
    }

    #[test]
    fn derived_classes_inherit_base_members() {
        let registry = animals();
        let lion = registry.class("Lion").unwrap();
        assert!(lion.member("Name").is_some());
        assert!(lion.member("Lives").is_some());
    }

    #[test]
    fn discriminator_values_include_subtypes() {
        let registry = animals();
        assert_eq!(registry.discriminator_values("Cat"), vec!["Cat", "Lion"]);
        assert_eq!(registry.discriminator_values("Lion"), vec!["Lion"]);
    }
}
