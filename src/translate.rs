//! # Query Translation
//!
//! Turns a query expression into an [`ExecutableQuery`]:
//!
//! 1. **Normalize** - resolve names, fold closed subtrees, canonicalize idioms
//! 2. **Plan** - translate the operator chain into server stages and client steps
//! 3. **Optimize** - fuse, merge and simplify the stage list
//!
//! The submodules hold the translators for each layer:
//!
//! - **[context]** - symbol table and per-query state
//! - **[expression]** - per-document expressions to aggregation expressions
//! - **[methods]** - method and static-call translators
//! - **[filter]** - predicates to `$match` filters
//! - **[pipeline]** - query operators to stages
//! - **[client]** - lambdas prepared for client-side evaluation

pub mod client;
pub mod context;
pub mod expression;
pub mod filter;
pub mod methods;
pub mod pipeline;

use std::sync::Arc;

use tracing::debug;

use crate::{
    ast::Expr,
    capabilities::{Capabilities, TranslationOptions},
    environment::Environment,
    error::TranslationError,
    execution::ExecutableQuery,
    normalizer::normalize,
    optimizer::Optimizer,
    parser::parse_query,
    registry::SerializerRegistry,
    residual::ResidualFunction,
};

use context::TranslationContext;
use pipeline::plan_query;

/// Translates queries against one serializer registry.
///
/// # Examples
///
/// ```
/// use docstage::{Environment, QueryTranslator, SerializerRegistry, Value};
/// use docstage::serializer::{ClassMap, Serializer};
///
/// let mut registry = SerializerRegistry::new();
/// registry.register(
///     ClassMap::builder("Person")
///         .member("Id", Serializer::Int32)
///         .member("X", Serializer::Int32)
///         .build(),
/// );
/// let env = Environment::new()
///     .with_source("docs", "people", "Person")
///     .with_capture("obj", Value::Array(vec![1.into(), 2.into(), 3.into()]));
///
/// let query = QueryTranslator::new(&registry)
///     .translate_text("docs.Where(x => obj.Any(y => x.X == y))", &env)
///     .unwrap();
/// assert_eq!(query.pipeline_text(), vec!["{ $match : { X : { $in : [1, 2, 3] } } }"]);
/// ```
#[derive(Debug, Clone)]
pub struct QueryTranslator<'r> {
    registry: &'r SerializerRegistry,
    capabilities: Capabilities,
    options: TranslationOptions,
}

impl<'r> QueryTranslator<'r> {
    pub fn new(registry: &'r SerializerRegistry) -> Self {
        QueryTranslator {
            registry,
            capabilities: Capabilities::default(),
            options: TranslationOptions::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_options(mut self, options: TranslationOptions) -> Self {
        self.options = options;
        self
    }

    /// Translate a query expression.
    ///
    /// Either the whole query translates or an error is returned; no partial
    /// pipeline is ever produced.
    pub fn translate(&self, expr: &Expr, env: &Environment) -> Result<ExecutableQuery, TranslationError> {
        let normalized = normalize(expr, env)?;
        let mut ctx = TranslationContext::new(self.registry, &self.capabilities, self.options, env);
        let plan = plan_query(&mut ctx, &normalized)?;
        let unwrap = plan.unwrap().then(|| "_v".to_string());

        let optimized = Optimizer::new().optimize(plan.steps);
        for (index, stage) in optimized.stages.iter().enumerate() {
            debug!(index, stage = %stage, "emitted stage");
        }
        let residual = if optimized.client.is_empty() {
            None
        } else {
            Some(ResidualFunction::new(Arc::new(env.clone()), optimized.client))
        };

        Ok(ExecutableQuery {
            collection: plan.collection,
            stages: optimized.stages,
            residual,
            unwrap,
            reduction: plan.reduction,
        })
    }

    /// Parse query text and translate it.
    pub fn translate_text(&self, text: &str, env: &Environment) -> Result<ExecutableQuery, TranslationError> {
        let expr = parse_query(text)?;
        self.translate(&expr, env)
    }
}
