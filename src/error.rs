use thiserror::Error;

use crate::{ast::Expr, capabilities::ServerVersion, parser::ParseError};

/// Errors raised while translating a query. No partial pipeline accompanies an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TranslationError {
    /// The expression has no translation and client fallback is not permitted
    #[error("expression not supported: {expression} because {reason}")]
    Unsupported { expression: String, reason: String },

    /// A member cannot be resolved against the serializer in scope
    #[error("member '{member}' of '{type_name}' cannot be resolved to a document field")]
    AmbiguousMember { member: String, type_name: String },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    /// A query source used inside a per-document expression
    #[error("query source '{0}' cannot be used inside a lambda body")]
    NestedQuerySource(String),

    #[error("{feature} requires server version {required} (target is {actual})")]
    FeatureNotSupported {
        feature: String,
        required: ServerVersion,
        actual: ServerVersion,
    },

    #[error("cannot serialize {value} as {serializer}")]
    Serialization { value: String, serializer: String },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Build an [`TranslationError::Unsupported`] naming `expr`.
pub fn unsupported(expr: &Expr, reason: impl Into<String>) -> TranslationError {
    TranslationError::Unsupported {
        expression: expr.to_string(),
        reason: reason.into(),
    }
}
