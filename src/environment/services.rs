use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;

type ServiceCallback = Box<dyn Fn(&Value) -> Result<Value>>;

/// Named functions callable from expressions as `${environment.services.name()}`.
#[derive(Default)]
pub struct Services {
    callbacks: Vec<ServiceCallback>,
    map: HashMap<String, usize>,
}

impl Services {
    pub(super) fn add<F>(&mut self, name: impl Into<String>, callback: F)
    where
        F: Fn(&Value) -> Result<Value> + 'static,
    {
        let name = name.into();
        if self
            .map
            .insert(name.clone(), self.callbacks.len())
            .is_some()
        {
            log::warn!(r#"Installed service "{name}" multiple times"#);
        }
        self.callbacks.push(Box::new(callback));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Call service with the expression scope.
    pub fn call(&self, name: &str, scope: &Value) -> Result<Value> {
        match self.map.get(name).and_then(|index| self.callbacks.get(*index)) {
            Some(func) => func(scope),
            None => Err(Error::UnknownService(name.into())),
        }
    }
}
