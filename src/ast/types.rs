use std::fmt;

/// A type named in a query: cast targets, `is` tests and generic arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Int32,
    Int64,
    Double,
    Decimal,
    String,
    Char,
    Boolean,
    DateTime,
    Object,
    /// A class or interface resolved through the serializer registry
    Named(String),
    Nullable(Box<TypeRef>),
}

impl TypeRef {
    /// Resolve a type keyword or CLR name (`int`, `Int32`, `decimal?`, `Cat`).
    pub fn from_name(name: &str) -> TypeRef {
        if let Some(inner) = name.strip_suffix('?') {
            return TypeRef::Nullable(Box::new(TypeRef::from_name(inner)));
        }
        match name.strip_prefix("System.").unwrap_or(name) {
            "int" | "Int32" => TypeRef::Int32,
            "long" | "Int64" => TypeRef::Int64,
            "double" | "Double" => TypeRef::Double,
            "decimal" | "Decimal" => TypeRef::Decimal,
            "string" | "String" => TypeRef::String,
            "char" | "Char" => TypeRef::Char,
            "bool" | "Boolean" => TypeRef::Boolean,
            "DateTime" => TypeRef::DateTime,
            "object" | "Object" => TypeRef::Object,
            other => TypeRef::Named(other.to_string()),
        }
    }

    pub fn is_numeric(&self) -> bool {
        match self {
            TypeRef::Int32 | TypeRef::Int64 | TypeRef::Double | TypeRef::Decimal => true,
            TypeRef::Nullable(inner) => inner.is_numeric(),
            _ => false,
        }
    }

    /// The type with any nullable wrapper removed.
    pub fn underlying(&self) -> &TypeRef {
        match self {
            TypeRef::Nullable(inner) => inner.underlying(),
            other => other,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Int32 => write!(f, "int"),
            TypeRef::Int64 => write!(f, "long"),
            TypeRef::Double => write!(f, "double"),
            TypeRef::Decimal => write!(f, "decimal"),
            TypeRef::String => write!(f, "string"),
            TypeRef::Char => write!(f, "char"),
            TypeRef::Boolean => write!(f, "bool"),
            TypeRef::DateTime => write!(f, "DateTime"),
            TypeRef::Object => write!(f, "object"),
            TypeRef::Named(name) => write!(f, "{}", name),
            TypeRef::Nullable(inner) => write!(f, "{}?", inner),
        }
    }
}
