use super::{DefinitionState, EventDefinition, listener, parent_content};
use crate::{
    activity::Activity,
    api::{
        ACTIVITY_CATCH, ACTIVITY_DISCARD, ACTIVITY_LINK, ACTIVITY_LINK_DISCARD, ACTIVITY_WAIT, API_EXCHANGE,
        ApiType, EVENT_EXCHANGE,
    },
    broker::{ConsumeOptions, QueueOptions},
    error::Result,
    message::{Message, Properties},
};
use serde_json::{Value, json};
use std::rc::Rc;

struct Inner {
    state: DefinitionState,
    link_name: String,
    queue_name: String,
}

/// Continues flow from a throwing link to the catching link with the same name.
pub struct LinkEventDefinition {
    inner: Rc<Inner>,
}

impl LinkEventDefinition {
    pub fn new(activity: &Activity, link_name: impl Into<String>) -> Self {
        let link_name = link_name.into();
        let queue_name = format!("link-{}-{link_name}-q", activity.id());
        let inner = Rc::new(Inner {
            state: DefinitionState::new(activity, "bpmn:LinkEventDefinition", "link"),
            link_name,
            queue_name,
        });

        let broker = activity.broker();
        if activity.is_throwing() {
            // A throwing link that is discarded before it is reached still releases the catching link, once
            broker.subscribe_tmp(
                EVENT_EXCHANGE,
                ACTIVITY_DISCARD,
                listener(&inner, Inner::on_discarded),
                ConsumeOptions::tag(inner.discard_tag()),
            );
        } else {
            broker.assert_queue(&inner.queue_name, QueueOptions::durable());
            broker.bind_queue(&inner.queue_name, API_EXCHANGE, "*.link.#", 0);
        }

        Self { inner }
    }

    pub fn link_name(&self) -> &str {
        &self.inner.link_name
    }
}

impl EventDefinition for LinkEventDefinition {
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
    let wait = parent_content(&message.content)?.with("link", inner.reference());
    inner.stop();
    let Some(execution_id) = inner.state.begin(message)? else {
        return Ok(());
    };
    let broker = inner.state.activity().broker();

    broker.consume(
        &inner.queue_name,
        listener(inner, Inner::on_link),
        ConsumeOptions::tag(format!("_api-link-{execution_id}")),
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
            &format!("activity.stop.{}", parent.execution_id),
            listener(inner, Inner::on_api),
            ConsumeOptions::tag(format!("_api-parent-{execution_id}")),
        );
    }

    inner
        .state
        .debug(&execution_id, format!("expect link {}", inner.link_name));
    broker.publish(EVENT_EXCHANGE, ACTIVITY_WAIT, wait, Properties::default());
    Ok(())
}

impl Inner {
    fn discard_tag(&self) -> String {
        format!("_link-parent-discard-{}", self.state.id())
    }

    fn reference(&self) -> Value {
        json!({ "linkName": self.link_name })
    }

    fn execute_throw(&self, message: &Message) -> Result<()> {
        let signal = parent_content(&message.content)?
            .with_message(self.reference())
            .with_state("throw");
        if self.state.begin(message)?.is_none() {
            return Ok(());
        }
        self.state.complete();
        self.state.throw(message, ACTIVITY_LINK, signal, "link");
        Ok(())
    }

    fn on_discarded(&self, _: &str, message: &Message) {
        if message.content.id.as_deref() != Some(self.state.id()) {
            return;
        }
        self.state.activity().broker().cancel(&self.discard_tag());
        let signal = parent_content(&message.content).unwrap_or_else(|_| message.content.clone());
        self.state.activity().broker().publish(
            EVENT_EXCHANGE,
            ACTIVITY_LINK_DISCARD,
            signal.with_message(self.reference()).with_state("discard"),
            Properties::typed("link").delegated(),
        );
    }

    fn on_link(&self, _: &str, message: &Message) {
        if self.state.is_completed() {
            return;
        }

        let link = message.content.message.as_ref();
        let link_name = link.and_then(|link| link.get("linkName")).and_then(Value::as_str);
        if link_name != Some(self.link_name.as_str()) {
            return;
        }

        if message.content.state.as_deref() == Some("discard") {
            self.discard();
            return;
        }

        if !self.state.complete() {
            return;
        }
        self.stop();
        self.state.activity().broker().purge_queue(&self.queue_name);

        let Some(execute) = self.state.execute_message() else {
            return;
        };
        if let Ok(mut catch) = parent_content(&execute.content) {
            catch.message = link.cloned();
            catch.state = Some("catch".into());
            self.state.activity().broker().publish(
                EVENT_EXCHANGE,
                ACTIVITY_CATCH,
                catch,
                Properties::typed("catch"),
            );
        }
        self.state.publish_completed(link.cloned(), "catch");
    }

    fn on_api(&self, routing_key: &str, message: &Message) {
        match ApiType::from(message.properties.message_type.as_deref()) {
            ApiType::Link => self.on_link(routing_key, message),
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
        self.state.activity().broker().purge_queue(&self.queue_name);
        self.state.publish_discard();
    }

    fn stop(&self) {
        let mut tags = Vec::new();
        if self.state.activity().is_throwing() {
            tags.push(self.discard_tag());
        }
        if let Some(execution_id) = self.state.execution_id() {
            tags.extend([
                format!("_api-link-{execution_id}"),
                format!("_api-{execution_id}"),
                format!("_api-parent-{execution_id}"),
            ]);
        }
        self.state.cancel_all(&tags);
    }
}
