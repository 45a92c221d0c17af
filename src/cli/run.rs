//! Execute queries against JSON data with the in-memory engine

use std::path::PathBuf;

use tracing::debug;

use super::{CliError, TranslateOptions, read_input};
use crate::{
    Value,
    execution::{QueryResult, memory::InMemoryAdapter},
};

/// Options for the run command
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub translate: TranslateOptions,
    /// JSON data: an array of documents for the queried collection, or an
    /// object mapping collection names to arrays. `-` reads stdin.
    pub data: PathBuf,
}

/// Translate a query, run it over the data file and return the results.
pub fn execute_run(options: &RunOptions) -> Result<QueryResult, CliError> {
    let query = options.translate.translate()?;
    let data: serde_json::Value = serde_json::from_str(&read_input(&options.data)?)?;

    let mut adapter = InMemoryAdapter::new();
    match data {
        serde_json::Value::Object(collections) => {
            for (name, documents) in collections {
                adapter.insert(name, documents_of(documents)?);
            }
        }
        documents => adapter.insert(query.collection.clone(), documents_of(documents)?),
    }
    debug!(collection = %query.collection, stages = query.stages.len(), "running query");
    Ok(query.execute(&adapter)?)
}

fn documents_of(json: serde_json::Value) -> Result<Vec<Value>, CliError> {
    match json {
        serde_json::Value::Array(items) => Ok(items.into_iter().map(Value::from).collect()),
        other => Err(CliError::InvalidArgument(format!(
            "expected an array of documents, found {}",
            other
        ))),
    }
}
