//! Validate query syntax without translating

use super::CliError;
use crate::{Expr, parse_query};

/// Result of a check operation
#[derive(Debug)]
pub enum CheckResult {
    /// The query parsed; carries its canonical text
    Valid(Expr),
}

/// Parse a query and report its canonical form.
pub fn execute_check(query: &str) -> Result<CheckResult, CliError> {
    let expr = parse_query(query)?;
    Ok(CheckResult::Valid(expr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_the_parsed_chain() {
        let CheckResult::Valid(expr) = execute_check("docs.Where(x => x.A == 1)").unwrap();
        assert_eq!(expr.to_string(), "docs.Where(x => x.A == 1)");
    }

    #[test]
    fn rejects_unbalanced_parentheses() {
        assert!(matches!(execute_check("docs.Where(x => x.A == 1"), Err(CliError::Parse(_))));
    }
}
