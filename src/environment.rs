//! The capture environment a query is translated in: values closed over by
//! the query, the named collections it may start from, and host functions it
//! may call.

use std::{collections::HashMap, fmt, sync::Arc};

use crate::ast::SourceRef;
use crate::evaluator::EvalError;
use crate::value::Value;

type HostFn = dyn Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync;

/// A function implemented by the caller.
///
/// Host functions never run on the server. A pure host function called with
/// constant arguments is folded during normalization; any other call forces
/// the surrounding operator onto the client (when fallback is enabled).
#[derive(Clone)]
pub struct HostFunction {
    name: String,
    pure: bool,
    func: Arc<HostFn>,
}

impl HostFunction {
    pub fn new(
        name: impl Into<String>,
        pure: bool,
        func: impl Fn(&[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    ) -> Self {
        HostFunction {
            name: name.into(),
            pure,
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_pure(&self) -> bool {
        self.pure
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, EvalError> {
        (self.func)(args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("pure", &self.pure)
            .finish_non_exhaustive()
    }
}

/// Names visible to a query besides its own lambda parameters.
///
/// # Examples
///
/// ```
/// use docstage::{Environment, Value};
///
/// let env = Environment::new()
///     .with_source("docs", "people", "Person")
///     .with_capture("obj", Value::Array(vec![1.into(), 2.into(), 3.into()]));
/// assert!(env.source("docs").is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Environment {
    captures: HashMap<String, Value>,
    sources: HashMap<String, SourceRef>,
    functions: HashMap<String, HostFunction>,
}

impl Environment {
    pub fn new() -> Self {
        Environment::default()
    }

    pub fn with_capture(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.captures.insert(name.into(), value.into());
        self
    }

    pub fn with_source(
        mut self,
        name: impl Into<String>,
        collection: impl Into<String>,
        document_type: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.sources.insert(
            name.clone(),
            SourceRef {
                name,
                collection: collection.into(),
                document_type: document_type.into(),
            },
        );
        self
    }

    pub fn with_function(mut self, function: HostFunction) -> Self {
        self.functions.insert(function.name.clone(), function);
        self
    }

    pub fn capture(&self, name: &str) -> Option<&Value> {
        self.captures.get(name)
    }

    pub fn source(&self, name: &str) -> Option<&SourceRef> {
        self.sources.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&HostFunction> {
        self.functions.get(name)
    }
}
