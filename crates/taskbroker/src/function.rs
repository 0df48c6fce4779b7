//! Named function calls and the worker-side function registry
//!
//! Closures cannot cross a process boundary, so a submitted callable is a
//! function name plus JSON arguments. Workers resolve the name against their
//! own [`FunctionRegistry`]; the broker never looks inside a [`Call`].

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RemoteError;

/// A function invocation: name, positional args, keyword args
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub function: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Call {
    /// Call `function` with no arguments
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Replace all positional arguments
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Add keyword arguments the call does not set itself
    pub fn merge_defaults(&mut self, defaults: &Map<String, Value>) {
        for (key, value) in defaults {
            if !self.kwargs.contains_key(key) {
                self.kwargs.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Arguments as seen by a registered function
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Fetch a parameter by position, falling back to its keyword name
    ///
    /// A missing or ill-typed parameter is a `TypeError`.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, RemoteError> {
        let value = self
            .args
            .get(index)
            .or_else(|| self.kwargs.get(name))
            .ok_or_else(|| {
                RemoteError::type_error(format!("missing required argument '{}'", name))
            })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            RemoteError::type_error(format!("argument '{}' has the wrong type: {}", name, e))
        })
    }

    /// Like [`CallArgs::get`], but a missing parameter is `None`
    pub fn get_opt<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, RemoteError> {
        if self.args.get(index).is_none() && !self.kwargs.contains_key(name) {
            return Ok(None);
        }
        self.get(index, name).map(Some)
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }
}

/// Registered function type
pub type FunctionFn = Arc<dyn Fn(&CallArgs) -> Result<Value, RemoteError> + Send + Sync>;

/// Registry mapping function names to implementations
///
/// # Example
///
/// ```
/// use taskbroker::{Call, FunctionRegistry};
/// use serde_json::json;
///
/// let functions = FunctionRegistry::new();
/// functions.register("square", |args| {
///     let x: i64 = args.get(0, "x")?;
///     Ok(json!(x * x))
/// });
///
/// assert_eq!(functions.execute(&Call::new("square").arg(3)), Ok(json!(9)));
/// ```
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, FunctionFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under `name`, replacing any previous one
    pub fn register<F>(&self, name: &str, function: F)
    where
        F: Fn(&CallArgs) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.functions
            .write()
            .insert(name.to_string(), Arc::new(function));
        tracing::debug!(function = %name, "Registered function");
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Run a call to completion on the current thread
    ///
    /// Unknown names are a `NameError`; a panicking function is reported as
    /// a `Panic` error instead of unwinding into the caller.
    pub fn execute(&self, call: &Call) -> Result<Value, RemoteError> {
        let function = self
            .functions
            .read()
            .get(&call.function)
            .cloned()
            .ok_or_else(|| {
                RemoteError::new(
                    "NameError",
                    format!("function '{}' is not registered", call.function),
                )
            })?;

        let args = CallArgs::new(call.args.clone(), call.kwargs.clone());
        match catch_unwind(AssertUnwindSafe(|| function(&args))) {
            Ok(result) => result,
            Err(payload) => Err(RemoteError::new("Panic", panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "function panicked".to_string()
    }
}
