pub mod ast;
pub mod capabilities;
pub mod environment;
pub mod error;
pub mod evaluator;
pub mod execution;
pub mod lexer;
pub mod mql;
pub mod normalizer;
pub mod optimizer;
pub mod output;
pub mod parser;
pub mod registry;
pub mod residual;
pub mod serializer;
pub mod transform;
pub mod translate;
pub mod value;

#[cfg(feature = "cli")]
pub mod cli;

pub use ast::{BinOp, Expr, Token, TypeRef, UnaryOp};
pub use capabilities::{Capabilities, Feature, ServerVersion, TranslationOptions};
pub use environment::{Environment, HostFunction};
pub use error::TranslationError;
pub use evaluator::{EvalContext, EvalError, Evaluator};
pub use execution::{DocumentCursor, ExecutableQuery, ExecutionAdapter, ExecutionError, QueryResult};
pub use lexer::{LexError, Lexer};
pub use mql::Stage;
pub use output::{to_json, to_json_pretty, to_shell};
pub use parser::{ParseError, Parser, parse_query};
pub use registry::{DiscriminatorConvention, SerializerRegistry};
pub use serializer::{ClassMap, Serializer};
pub use translate::QueryTranslator;
pub use value::{Document, Value};
