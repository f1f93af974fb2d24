//! Catch and throw event definitions.
//!
//! A definition is built once per activity and executed once per run of that
//! activity. Catching definitions wait for a signal on the `api` exchange,
//! throwing definitions publish their signal on the `event` exchange and
//! complete right away. A durable queue per definition keeps signals that
//! arrive before the definition is executed.
//!
//! Every consumer tag a definition opens is derived from the execution id, so
//! [`EventDefinition::stop`] can always cancel all of them.
mod cancel;
mod compensate;
mod escalation;
mod link;
mod timer;

pub use cancel::CancelEventDefinition;
pub use compensate::{COMPENSATE_EXCHANGE, CompensateEventDefinition};
pub use escalation::EscalationEventDefinition;
pub use link::LinkEventDefinition;
pub use timer::{TimerEventDefinition, parse_duration};

use crate::{
    activity::Activity,
    api::{EVENT_EXCHANGE, EXECUTE_COMPLETED, EXECUTE_DISCARD, EXECUTION_EXCHANGE},
    environment::Logger,
    error::Result,
    message::{Content, Message, Properties, shift_parent},
};
use serde_json::Value;
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

pub trait EventDefinition {
    fn state(&self) -> &DefinitionState;

    fn execute(&self, message: &Message) -> Result<()>;

    /// Cancel every listener opened by the current execution.
    fn stop(&self);

    fn id(&self) -> &str {
        self.state().id()
    }

    fn definition_type(&self) -> &str {
        self.state().definition_type()
    }

    fn is_throwing(&self) -> bool {
        self.state().activity().is_throwing()
    }

    fn is_completed(&self) -> bool {
        self.state().is_completed()
    }

    fn execution_id(&self) -> Option<String> {
        self.state().execution_id()
    }
}

/// State shared by all definition kinds.
pub struct DefinitionState {
    id: String,
    definition_type: &'static str,
    activity: Activity,
    completed: Cell<bool>,
    message: RefCell<Option<Message>>,
    logger: Logger,
}

impl DefinitionState {
    fn new(activity: &Activity, definition_type: &'static str, scope: &str) -> Self {
        Self {
            id: activity.id().to_string(),
            definition_type,
            activity: activity.clone(),
            completed: Cell::new(false),
            message: RefCell::new(None),
            logger: activity.logger(scope),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition_type(&self) -> &str {
        self.definition_type
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    pub fn is_completed(&self) -> bool {
        self.completed.get()
    }

    pub fn execution_id(&self) -> Option<String> {
        self.message
            .borrow()
            .as_ref()
            .and_then(|message| message.content.execution_id.clone())
    }

    /// Store the execute message. `None` if a redelivered message finds the definition completed.
    fn begin(&self, message: &Message) -> Result<Option<String>> {
        let execution_id = message.content.execution_id()?.to_string();
        if !message.fields.redelivered {
            self.completed.set(false);
        } else if self.completed.get() {
            self.debug(&execution_id, "already completed, ignoring redelivered execute");
            return Ok(None);
        }
        self.message.replace(Some(message.clone()));
        Ok(Some(execution_id))
    }

    /// Mark completed. Returns false if it already was.
    fn complete(&self) -> bool {
        !self.completed.replace(true)
    }

    fn execute_message(&self) -> Option<Message> {
        self.message.borrow().clone()
    }

    fn publish_completed(&self, output: Option<Value>, state: &str) {
        let Some(message) = self.execute_message() else {
            return;
        };
        let mut content = message.content;
        content.output = output;
        content.state = Some(state.into());
        self.activity.broker().publish(
            EXECUTION_EXCHANGE,
            EXECUTE_COMPLETED,
            content,
            Properties::default(),
        );
    }

    fn publish_discard(&self) {
        let Some(message) = self.execute_message() else {
            return;
        };
        self.activity.broker().publish(
            EXECUTION_EXCHANGE,
            EXECUTE_DISCARD,
            message.content,
            Properties::default(),
        );
    }

    /// Publish the throw signal for the parent scope, then complete.
    fn throw(&self, message: &Message, routing_key: &str, signal: Content, message_type: &str) {
        self.debug(
            message.content.execution_id.as_deref().unwrap_or_default(),
            format!("throw {message_type}"),
        );
        self.activity.broker().publish(
            EVENT_EXCHANGE,
            routing_key,
            signal,
            Properties::typed(message_type).delegated(),
        );
        self.activity.broker().publish(
            EXECUTION_EXCHANGE,
            EXECUTE_COMPLETED,
            message.content.clone(),
            Properties::default(),
        );
    }

    fn cancel_all(&self, tags: &[String]) {
        let broker = self.activity.broker();
        for tag in tags {
            broker.cancel(tag);
        }
    }

    fn debug(&self, execution_id: &str, message: impl std::fmt::Display) {
        self.logger
            .debug(format!("<{execution_id} ({})> {message}", self.id));
    }
}

/// Content addressed to the parent execution, one level up the scope tree.
fn parent_content(content: &Content) -> Result<Content> {
    let parent = content.parent()?;
    let mut signal = content.clone();
    signal.execution_id = Some(parent.execution_id.clone());
    signal.parent = shift_parent(Some(parent));
    Ok(signal)
}

/// Broker callback holding a weak reference to its owner.
fn listener<T: 'static>(inner: &Rc<T>, handler: fn(&T, &str, &Message)) -> impl Fn(&str, &Message) + 'static {
    let weak = Rc::downgrade(inner);
    move |routing_key, message| {
        if let Some(inner) = weak.upgrade() {
            handler(&inner, routing_key, message);
        }
    }
}
