use std::collections::HashMap;

use crate::{
    capabilities::{Capabilities, TranslationOptions},
    environment::Environment,
    mql::AggExpr,
    registry::SerializerRegistry,
    serializer::Serializer,
};

/// What a lambda parameter stands for.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// The pipeline document, or a field of it when the documents are
    /// wrapped (`_v`). An empty path is the whole document.
    Path(String),
    /// The array element an `$elemMatch` tests
    Element,
    /// A `$map`, `$filter`, `$reduce` or `$let` variable
    Variable(String),
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub parameter: String,
    pub binding: Binding,
    pub serializer: Serializer,
}

impl Symbol {
    /// The symbol as an aggregation expression.
    pub fn to_expr(&self) -> Option<AggExpr> {
        match &self.binding {
            Binding::Path(path) if path.is_empty() => Some(AggExpr::root()),
            Binding::Path(path) => Some(AggExpr::field(path.clone())),
            Binding::Variable(name) => Some(AggExpr::var(name.clone())),
            Binding::Element => None,
        }
    }
}

/// State threaded through the translation of one query.
///
/// Created per top-level query and never shared; the registry and the
/// environment are only read.
pub struct TranslationContext<'q> {
    pub registry: &'q SerializerRegistry,
    pub capabilities: &'q Capabilities,
    pub options: TranslationOptions,
    pub env: &'q Environment,
    symbols: Vec<Symbol>,
    counters: HashMap<&'static str, usize>,
}

impl<'q> TranslationContext<'q> {
    pub fn new(
        registry: &'q SerializerRegistry,
        capabilities: &'q Capabilities,
        options: TranslationOptions,
        env: &'q Environment,
    ) -> Self {
        TranslationContext {
            registry,
            capabilities,
            options,
            env,
            symbols: Vec::new(),
            counters: HashMap::new(),
        }
    }

    pub fn lookup(&self, parameter: &str) -> Option<&Symbol> {
        self.symbols.iter().rev().find(|s| s.parameter == parameter)
    }

    /// Run `f` with `symbols` in scope.
    pub fn scoped<T>(&mut self, symbols: Vec<Symbol>, f: impl FnOnce(&mut Self) -> T) -> T {
        let depth = self.symbols.len();
        self.symbols.extend(symbols);
        let result = f(self);
        self.symbols.truncate(depth);
        result
    }

    /// A variable name for `parameter` that no enclosing scope already uses.
    ///
    /// Server variables must start with a lowercase letter, so leading
    /// underscores are dropped and other names get a `v` prefix.
    pub fn variable_name(&self, parameter: &str) -> String {
        let trimmed = parameter.trim_start_matches('_');
        let base = match trimmed.chars().next() {
            Some(c) if c.is_ascii_lowercase() => trimmed.to_string(),
            Some(c) if c.is_ascii_uppercase() => {
                let mut name = c.to_ascii_lowercase().to_string();
                name.push_str(&trimmed[1..]);
                name
            }
            _ => format!("v{}", trimmed),
        };
        let in_use = |name: &str| {
            matches!(name, "this" | "value" | "current" | "root")
                || self
                    .symbols
                    .iter()
                    .any(|s| matches!(&s.binding, Binding::Variable(v) if v == name))
        };
        if !in_use(&base) {
            return base;
        }
        (0..)
            .map(|i| format!("{}{}", base, i))
            .find(|candidate| !in_use(candidate))
            .unwrap_or(base)
    }

    /// Next number for a synthesized name family (`__agg`, `_key`).
    pub fn next_index(&mut self, family: &'static str) -> usize {
        let counter = self.counters.entry(family).or_insert(0);
        let index = *counter;
        *counter += 1;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadowed_variables_get_a_numeric_suffix() {
        let registry = SerializerRegistry::new();
        let capabilities = Capabilities::default();
        let env = Environment::new();
        let mut ctx = TranslationContext::new(&registry, &capabilities, TranslationOptions::default(), &env);
        let outer = Symbol {
            parameter: "x".into(),
            binding: Binding::Variable("x".into()),
            serializer: Serializer::Any,
        };
        let name = ctx.scoped(vec![outer], |ctx| ctx.variable_name("x"));
        assert_eq!(name, "x0");
        assert_eq!(ctx.variable_name("_p0"), "p0");
        assert_eq!(ctx.variable_name("X"), "x");
    }
}
