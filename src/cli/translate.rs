//! Print the pipeline a query translates to

use super::{CliError, TranslateOptions};

/// Translate a query and return its stages, one shell-text line each.
///
/// A query that splits for client evaluation gets a trailing comment line
/// naming the steps left to the client.
pub fn execute_translate(options: &TranslateOptions) -> Result<Vec<String>, CliError> {
    let query = options.translate()?;
    let mut lines = query.pipeline_text();
    if let Some(residual) = &query.residual {
        lines.push(format!("// then {} client step(s)", residual.steps().len()));
    }
    Ok(lines)
}
