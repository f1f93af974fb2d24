use super::{DefinitionState, EventDefinition, listener, parent_content};
use crate::{
    activity::Activity,
    api::{ACTIVITY_CATCH, ACTIVITY_ESCALATE, ACTIVITY_WAIT, API_EXCHANGE, ApiType, EVENT_EXCHANGE},
    broker::{ConsumeOptions, QueueOptions},
    error::Result,
    message::{Message, Properties},
};
use serde_json::{Value, json};
use std::rc::Rc;

struct Inner {
    state: DefinitionState,
    reference: Option<String>,
    queue_name: String,
}

/// Escalation by reference to an escalation element, or anonymous.
pub struct EscalationEventDefinition {
    inner: Rc<Inner>,
}

impl EscalationEventDefinition {
    pub fn new(activity: &Activity, escalation_ref: Option<&str>) -> Self {
        let queue_name = format!(
            "escalate-{}-{}-q",
            activity.id(),
            escalation_ref.unwrap_or("anonymous")
        );
        if !activity.is_throwing() {
            let broker = activity.broker();
            broker.assert_queue(&queue_name, QueueOptions::durable());
            broker.bind_queue(&queue_name, API_EXCHANGE, "*.escalate.#", 0);
        }

        Self {
            inner: Rc::new(Inner {
                state: DefinitionState::new(activity, "bpmn:EscalationEventDefinition", "escalation"),
                reference: escalation_ref.map(String::from),
                queue_name,
            }),
        }
    }

    pub fn escalation_ref(&self) -> Option<&str> {
        self.inner.reference.as_deref()
    }
}

impl EventDefinition for EscalationEventDefinition {
    fn state(&self) -> &DefinitionState {
        &self.inner.state
    }

    fn execute(&self, message: &Message) -> Result<()> {
        if self.is_throwing() {
            self.inner.execute_throw(message)
        } else {
            execute_catch(&self.inner, message)
        }
    }

    fn stop(&self) {
        self.inner.stop();
    }
}

fn execute_catch(inner: &Rc<Inner>, message: &Message) -> Result<()> {
    let info = inner.reference_info(message)?;
    let wait = parent_content(&message.content)?.with("escalation", info);
    let Some(execution_id) = inner.state.begin(message)? else {
        return Ok(());
    };
    let broker = inner.state.activity().broker();

    broker.consume(
        &inner.queue_name,
        listener(inner, Inner::on_escalate),
        ConsumeOptions::tag(format!("_onescalate-{execution_id}")),
    );
    if inner.state.is_completed() {
        return Ok(());
    }

    broker.subscribe_tmp(
        API_EXCHANGE,
        &format!("activity.#.{execution_id}"),
        listener(inner, Inner::on_api),
        ConsumeOptions::tag(format!("_api-{execution_id}")),
    );
    if let Some(parent) = &message.content.parent {
        broker.subscribe_tmp(
            API_EXCHANGE,
            &format!("activity.#.{}", parent.execution_id),
            listener(inner, Inner::on_parent_api),
            ConsumeOptions::tag(format!("_api-parent-{execution_id}")),
        );
    }

    inner.state.debug(&execution_id, "expect escalation");
    broker.publish(EVENT_EXCHANGE, ACTIVITY_WAIT, wait, Properties::default());
    Ok(())
}

impl Inner {
    /// Escalation element info, resolved against the execute message.
    fn reference_info(&self, message: &Message) -> Result<Value> {
        let activity = self.state.activity();
        if let Some(element) = self
            .reference
            .as_deref()
            .and_then(|reference| activity.get_element(reference))
        {
            return element.resolve(activity.environment(), message);
        }

        Ok(json!({
            "id": self.reference,
            "messageType": "escalation",
            "name": self.reference.as_deref().unwrap_or("anonymous escalation"),
        }))
    }

    fn execute_throw(&self, message: &Message) -> Result<()> {
        let info = self.reference_info(message)?;
        let signal = parent_content(&message.content)?
            .with_message(info)
            .with_state("throw");
        if self.state.begin(message)?.is_none() {
            return Ok(());
        }
        self.state.complete();
        self.state.throw(message, ACTIVITY_ESCALATE, signal, "escalate");
        Ok(())
    }

    fn on_escalate(&self, _: &str, message: &Message) {
        if self.state.is_completed() {
            return;
        }

        let escalation = message.content.message.as_ref();
        if let Some(reference) = &self.reference {
            let id = escalation.and_then(|info| info.get("id")).and_then(Value::as_str);
            if id != Some(reference.as_str()) {
                return;
            }
        }

        if !self.state.complete() {
            return;
        }
        self.stop();

        let Some(execute) = self.state.execute_message() else {
            return;
        };
        let execution_id = execute.content.execution_id.clone().unwrap_or_default();
        self.state.debug(&execution_id, "escalation caught");

        if let Ok(mut catch) = parent_content(&execute.content) {
            catch.message = escalation.cloned();
            catch.state = Some("catch".into());
            self.state.activity().broker().publish(
                EVENT_EXCHANGE,
                ACTIVITY_CATCH,
                catch,
                Properties::typed("catch"),
            );
        }
        self.state.publish_completed(escalation.cloned(), "catch");
    }

    fn on_api(&self, routing_key: &str, message: &Message) {
        match ApiType::from(message.properties.message_type.as_deref()) {
            ApiType::Escalate => self.on_escalate(routing_key, message),
            ApiType::Discard => self.discard(),
            ApiType::Stop => self.stop(),
            _ => {}
        }
    }

    fn on_parent_api(&self, _: &str, message: &Message) {
        match ApiType::from(message.properties.message_type.as_deref()) {
            ApiType::Discard => self.discard(),
            ApiType::Stop => self.stop(),
            _ => {}
        }
    }

    fn discard(&self) {
        if !self.state.complete() {
            return;
        }
        self.stop();
        self.state.publish_discard();
    }

    fn stop(&self) {
        let Some(execution_id) = self.state.execution_id() else {
            return;
        };
        self.state.cancel_all(&[
            format!("_onescalate-{execution_id}"),
            format!("_api-{execution_id}"),
            format!("_api-parent-{execution_id}"),
        ]);
    }
}
