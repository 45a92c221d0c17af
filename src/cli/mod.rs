//! CLI support for docstage
//!
//! The binary's subcommands are thin wrappers over these functions, so other
//! tools can translate or run queries the same way without spawning it.

mod check;
mod run;
mod translate;

pub use check::{CheckResult, execute_check};
pub use run::{RunOptions, execute_run};
pub use translate::execute_translate;

use std::{fs, io, path::PathBuf};

use crate::{
    Capabilities, Environment, ServerVersion, SerializerRegistry, TranslationOptions, Value,
    execution::ExecutionError, parser::ParseError, registry::config::ConfigError, translate::QueryTranslator,
    TranslationError,
};

/// Settings shared by every subcommand that translates.
#[derive(Debug, Clone, Default)]
pub struct TranslateOptions {
    /// The query text
    pub query: String,
    /// Registry configuration file
    pub schema: Option<PathBuf>,
    /// Target server version, `major.minor`
    pub server_version: Option<String>,
    /// Run untranslatable operators on the client
    pub client_fallback: bool,
    /// `name=json` captured values
    pub captures: Vec<String>,
    /// `name=collection:Type` query sources
    pub sources: Vec<String>,
}

impl TranslateOptions {
    pub fn registry(&self) -> Result<SerializerRegistry, CliError> {
        match &self.schema {
            Some(path) => Ok(crate::registry::config::RegistryConfig::from_path(path)?.build()?),
            None => Ok(SerializerRegistry::new()),
        }
    }

    pub fn environment(&self) -> Result<Environment, CliError> {
        let mut env = Environment::new();
        for capture in &self.captures {
            let (name, json) = split_assignment(capture)?;
            let value: serde_json::Value = serde_json::from_str(json)?;
            env = env.with_capture(name, Value::from(value));
        }
        for source in &self.sources {
            let (name, target) = split_assignment(source)?;
            let (collection, document_type) = target
                .split_once(':')
                .ok_or_else(|| CliError::InvalidArgument(format!("expected collection:Type, found '{}'", target)))?;
            env = env.with_source(name, collection, document_type);
        }
        Ok(env)
    }

    pub fn capabilities(&self) -> Result<Capabilities, CliError> {
        match &self.server_version {
            Some(version) => {
                let version: ServerVersion = version.parse().map_err(CliError::InvalidArgument)?;
                Ok(Capabilities::for_version(version))
            }
            None => Ok(Capabilities::default()),
        }
    }

    /// Translate the query with these settings.
    pub fn translate(&self) -> Result<crate::ExecutableQuery, CliError> {
        let registry = self.registry()?;
        let env = self.environment()?;
        let translator = QueryTranslator::new(&registry)
            .with_capabilities(self.capabilities()?)
            .with_options(TranslationOptions {
                enable_client_side_fallback: self.client_fallback,
            });
        Ok(translator.translate_text(&self.query, &env)?)
    }
}

fn split_assignment(text: &str) -> Result<(&str, &str), CliError> {
    text.split_once('=')
        .ok_or_else(|| CliError::InvalidArgument(format!("expected name=value, found '{}'", text)))
}

/// Errors that can occur during CLI operations
#[derive(Debug)]
pub enum CliError {
    /// Parser error
    Parse(ParseError),
    /// Translation error
    Translation(TranslationError),
    /// Execution error
    Execution(ExecutionError),
    /// Registry configuration error
    Config(ConfigError),
    /// JSON parsing error
    Json(serde_json::Error),
    /// IO error
    Io(io::Error),
    /// Malformed command-line value
    InvalidArgument(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Parse(e) => write!(f, "Parse error: {}", e),
            CliError::Translation(e) => write!(f, "Translation error: {}", e),
            CliError::Execution(e) => write!(f, "Execution error: {}", e),
            CliError::Config(e) => write!(f, "Schema error: {}", e),
            CliError::Json(e) => write!(f, "Invalid JSON: {}", e),
            CliError::Io(e) => write!(f, "IO error: {}", e),
            CliError::InvalidArgument(message) => write!(f, "Invalid argument: {}", message),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Parse(e) => Some(e),
            CliError::Translation(e) => Some(e),
            CliError::Execution(e) => Some(e),
            CliError::Config(e) => Some(e),
            CliError::Json(e) => Some(e),
            CliError::Io(e) => Some(e),
            CliError::InvalidArgument(_) => None,
        }
    }
}

impl From<ParseError> for CliError {
    fn from(e: ParseError) -> Self {
        CliError::Parse(e)
    }
}

impl From<TranslationError> for CliError {
    fn from(e: TranslationError) -> Self {
        CliError::Translation(e)
    }
}

impl From<ExecutionError> for CliError {
    fn from(e: ExecutionError) -> Self {
        CliError::Execution(e)
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Json(e)
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        CliError::Io(e)
    }
}

/// Read a file, or stdin when the path is `-`.
pub(crate) fn read_input(path: &PathBuf) -> Result<String, CliError> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        io::Read::read_to_string(&mut io::stdin(), &mut buffer)?;
        return Ok(buffer);
    }
    Ok(fs::read_to_string(path)?)
}
