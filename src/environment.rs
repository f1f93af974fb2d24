mod expressions;
mod services;

pub use expressions::{DefaultExpressions, Expressions, is_truthy};
pub use services::Services;

use crate::{
    error::{Error, Result},
    timers::Timers,
};
use serde_json::{Map, Value, json};
use std::{fmt::Display, rc::Rc};

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Maximum number of parallel loop iterations started at once.
    pub batch_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self { batch_size: 50 }
    }
}

/// Shared services of a running process: variables, settings, expressions and timers.
///
/// ```
/// use virvel::{Environment, Settings};
/// use serde_json::json;
///
/// let environment = Environment::new()
///     .variables(json!({ "cardinality": 3 }))
///     .settings(Settings { batch_size: 2 })
///     .service("isDone", |scope| Ok(json!(scope["loopOutput"].as_array().is_some_and(|o| o.len() > 1))));
/// ```
pub struct Environment {
    variables: Value,
    settings: Settings,
    services: Services,
    expressions: Rc<dyn Expressions>,
    timers: Timers,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            variables: Value::Object(Map::new()),
            settings: Default::default(),
            services: Default::default(),
            expressions: Rc::new(DefaultExpressions),
            timers: Default::default(),
        }
    }
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Register a service callable as `${environment.services.<name>()}`.
    pub fn service<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Value) -> Result<Value> + 'static,
    {
        self.services.add(name, func);
        self
    }

    /// Replace the default expression resolver.
    pub fn expressions(mut self, expressions: impl Expressions + 'static) -> Self {
        self.expressions = Rc::new(expressions);
        self
    }

    /// Share a timer registry with other environments.
    pub fn timers(mut self, timers: Timers) -> Self {
        self.timers = timers;
        self
    }

    pub fn get_variables(&self) -> &Value {
        &self.variables
    }

    pub fn get_settings(&self) -> &Settings {
        &self.settings
    }

    pub fn get_timers(&self) -> &Timers {
        &self.timers
    }

    /// Resolve expression. `scope` must be an object, `environment` is added to it.
    pub fn resolve_expression(&self, expression: &str, scope: Value) -> Result<Value> {
        let mut scope = match scope {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::Expression(format!(
                    "scope must be an object, got {other}"
                )));
            }
        };
        scope.insert(
            "environment".into(),
            json!({
                "variables": self.variables,
                "settings": { "batchSize": self.settings.batch_size },
            }),
        );
        self.expressions
            .resolve(expression, &Value::Object(scope), &self.services)
    }

    pub fn logger(&self, scope: &str) -> Logger {
        Logger {
            target: format!("virvel:{scope}"),
        }
    }
}

/// `log` facade with a per element type target.
#[derive(Debug, Clone)]
pub struct Logger {
    target: String,
}

impl Logger {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn debug(&self, message: impl Display) {
        log::debug!(target: self.target.as_str(), "{message}");
    }

    pub fn warn(&self, message: impl Display) {
        log::warn!(target: self.target.as_str(), "{message}");
    }

    pub fn error(&self, message: impl Display) {
        log::error!(target: self.target.as_str(), "{message}");
    }
}
