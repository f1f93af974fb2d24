use crate::{
    broker::Broker,
    environment::{Environment, Logger},
    error::Result,
    message::Message,
};
use serde_json::{Value, json};
use std::{collections::HashMap, fmt::Display, rc::Rc};

/// Compensation activity reached through an association.
pub trait Association {
    fn id(&self) -> &str;

    /// Collected message is handed over for compensation.
    fn take(&self, message: &Message);

    /// Compensation was discarded.
    fn discard(&self, message: &Message);

    /// Every collected message was conveyed.
    fn complete(&self, _message: &Message) {}
}

/// Referenced element, e.g. an escalation or a signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    id: String,
    element_type: String,
    name: Option<String>,
}

impl Element {
    pub fn new(id: impl Into<String>, element_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            element_type: element_type.into(),
            name: None,
        }
    }

    /// Name can be an expression, it is resolved against the execute message.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn element_type(&self) -> &str {
        &self.element_type
    }

    pub fn resolve(&self, environment: &Environment, message: &Message) -> Result<Value> {
        let name = match &self.name {
            Some(name) => environment.resolve_expression(name, message.to_scope()?)?,
            None => Value::Null,
        };
        let message_type = self
            .element_type
            .rsplit(':')
            .next()
            .unwrap_or(&self.element_type)
            .to_lowercase();
        Ok(json!({
            "id": self.id,
            "type": self.element_type,
            "messageType": message_type,
            "name": name,
        }))
    }
}

/// Graph lookups available to activities.
#[derive(Default)]
pub struct Context {
    elements: HashMap<String, Element>,
    associations: HashMap<String, Vec<Rc<dyn Association>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element(mut self, element: Element) -> Self {
        if let Some(previous) = self.elements.insert(element.id.clone(), element) {
            log::warn!(r#"Installed element "{}" multiple times"#, previous.id);
        }
        self
    }

    /// Association from `source_id` to a compensation activity.
    pub fn association(mut self, source_id: impl Into<String>, association: impl Association + 'static) -> Self {
        self.associations
            .entry(source_id.into())
            .or_default()
            .push(Rc::new(association));
        self
    }

    pub fn get_element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn outbound_associations(&self, source_id: &str) -> Vec<Rc<dyn Association>> {
        self.associations.get(source_id).cloned().unwrap_or_default()
    }
}

/// The activity an event definition or loop is bound to.
#[derive(Clone)]
pub struct Activity {
    id: String,
    activity_type: String,
    is_throwing: bool,
    attached_to: Option<String>,
    broker: Broker,
    environment: Rc<Environment>,
    context: Rc<Context>,
}

impl Activity {
    pub fn new(
        id: impl Into<String>,
        activity_type: impl Into<String>,
        broker: &Broker,
        environment: Rc<Environment>,
        context: Rc<Context>,
    ) -> Self {
        Self {
            id: id.into(),
            activity_type: activity_type.into(),
            is_throwing: false,
            attached_to: None,
            broker: broker.clone(),
            environment,
            context,
        }
    }

    pub fn throwing(mut self) -> Self {
        self.is_throwing = true;
        self
    }

    /// Boundary event attached to `activity_id`.
    pub fn attached_to(mut self, activity_id: impl Into<String>) -> Self {
        self.attached_to = Some(activity_id.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn activity_type(&self) -> &str {
        &self.activity_type
    }

    pub fn is_throwing(&self) -> bool {
        self.is_throwing
    }

    pub fn get_attached_to(&self) -> Option<&str> {
        self.attached_to.as_deref()
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn get_element(&self, id: &str) -> Option<&Element> {
        self.context.get_element(id)
    }

    pub fn outbound_associations(&self) -> Vec<Rc<dyn Association>> {
        self.context.outbound_associations(&self.id)
    }

    pub fn logger(&self, scope: &str) -> Logger {
        self.environment.logger(scope)
    }
}

impl Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.id, self.activity_type)
    }
}
