use super::{DefinitionState, EventDefinition, listener, parent_content};
use crate::{
    activity::Activity,
    api::{
        ACTIVITY_COMPENSATE, ACTIVITY_DETACH, API_EXCHANGE, ApiType, EVENT_EXCHANGE, EXECUTE_COMPLETED,
        EXECUTE_DETACH, EXECUTE_ERROR, EXECUTION_EXCHANGE,
    },
    broker::{ConsumeOptions, QueueOptions},
    error::Result,
    message::{Message, Properties},
};
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

pub const COMPENSATE_EXCHANGE: &str = "compensate";

struct Inner {
    state: DefinitionState,
    queue_name: String,
    collect_queue_name: String,
    compensation: RefCell<Option<Message>>,
    this: Weak<Inner>,
}

/// Collects completed executions of the activity it is attached to and
/// conveys them to the associated compensation activities when compensation
/// is requested.
pub struct CompensateEventDefinition {
    inner: Rc<Inner>,
}

impl CompensateEventDefinition {
    pub fn new(activity: &Activity) -> Self {
        let queue_name = format!("compensate-{}-q", activity.id());
        if !activity.is_throwing() {
            let broker = activity.broker();
            broker.assert_queue(&queue_name, QueueOptions::durable());
            broker.bind_queue(&queue_name, API_EXCHANGE, "*.compensate.#", 400);
        }

        Self {
            inner: Rc::new_cyclic(|this| Inner {
                state: DefinitionState::new(activity, "bpmn:CompensateEventDefinition", "compensate"),
                collect_queue_name: format!("compensate-{}-collect-q", activity.id()),
                queue_name,
                compensation: RefCell::new(None),
                this: this.clone(),
            }),
        }
    }
}

impl EventDefinition for CompensateEventDefinition {
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
    let detach = parent_content(&message.content)?.with("bindExchange", COMPENSATE_EXCHANGE);
    let Some(execution_id) = inner.state.begin(message)? else {
        return Ok(());
    };
    let broker = inner.state.activity().broker();

    broker.assert_exchange(COMPENSATE_EXCHANGE);
    broker.assert_queue(&inner.collect_queue_name, QueueOptions::durable());
    broker.subscribe_tmp(
        COMPENSATE_EXCHANGE,
        "execute.#",
        listener(inner, Inner::on_collect),
        ConsumeOptions::tag(format!("_oncollect-{execution_id}")),
    );

    broker.publish(
        EXECUTION_EXCHANGE,
        EXECUTE_DETACH,
        message
            .content
            .clone()
            .with("sourceExchange", EXECUTION_EXCHANGE)
            .with("bindExchange", COMPENSATE_EXCHANGE),
        Properties::default(),
    );

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

    broker.consume(
        &inner.queue_name,
        listener(inner, Inner::on_compensate),
        ConsumeOptions::tag(format!("_oncompensate-{execution_id}")),
    );
    if inner.state.is_completed() {
        return Ok(());
    }

    inner.state.debug(&execution_id, "expect compensate");
    broker.publish(EVENT_EXCHANGE, ACTIVITY_DETACH, detach, Properties::default());
    Ok(())
}

impl Inner {
    fn execute_throw(&self, message: &Message) -> Result<()> {
        let signal = parent_content(&message.content)?.with_state("throw");
        if self.state.begin(message)?.is_none() {
            return Ok(());
        }
        self.state.complete();
        self.state
            .throw(message, ACTIVITY_COMPENSATE, signal, "compensate");
        Ok(())
    }

    fn on_collect(&self, routing_key: &str, message: &Message) {
        if routing_key == EXECUTE_COMPLETED || routing_key == EXECUTE_ERROR {
            self.state
                .activity()
                .broker()
                .send_to_queue(&self.collect_queue_name, message.clone());
        }
    }

    fn on_compensate(&self, _: &str, message: &Message) {
        if !self.state.complete() {
            return;
        }
        self.stop();
        self.compensation.replace(Some(message.clone()));

        let broker = self.state.activity().broker();
        if broker.message_count(&self.collect_queue_name) == 0 {
            self.finish();
            return;
        }

        let Some(execution_id) = self.state.execution_id() else {
            return;
        };
        self.state.debug(
            &execution_id,
            format!(
                "compensate {} collected messages",
                broker.message_count(&self.collect_queue_name)
            ),
        );
        let weak = self.this.clone();
        broker.consume(
            &self.collect_queue_name,
            move |routing_key, message| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_convey(routing_key, message);
                }
            },
            ConsumeOptions::tag(format!("_convey-messages-{execution_id}")),
        );
    }

    fn on_convey(&self, _: &str, message: &Message) {
        for association in self.state.activity().outbound_associations() {
            association.take(message);
        }
        if self
            .state
            .activity()
            .broker()
            .message_count(&self.collect_queue_name)
            == 0
        {
            self.finish();
        }
    }

    fn finish(&self) {
        self.stop();
        let Some(compensation) = self.compensation.take() else {
            return;
        };
        for association in self.state.activity().outbound_associations() {
            association.complete(&compensation);
        }
        self.state
            .publish_completed(compensation.content.message, "catch");
    }

    fn on_api(&self, routing_key: &str, message: &Message) {
        match ApiType::from(message.properties.message_type.as_deref()) {
            ApiType::Compensate => self.on_compensate(routing_key, message),
            ApiType::Discard => self.discard(message),
            ApiType::Stop => self.stop(),
            _ => {}
        }
    }

    fn on_parent_api(&self, _: &str, message: &Message) {
        match ApiType::from(message.properties.message_type.as_deref()) {
            ApiType::Discard => self.discard(message),
            ApiType::Stop => self.stop(),
            _ => {}
        }
    }

    fn discard(&self, message: &Message) {
        if !self.state.complete() {
            return;
        }
        for association in self.state.activity().outbound_associations() {
            association.discard(message);
        }
        self.stop();
        self.state
            .activity()
            .broker()
            .purge_queue(&self.collect_queue_name);
        self.state.publish_discard();
    }

    fn stop(&self) {
        let Some(execution_id) = self.state.execution_id() else {
            return;
        };
        self.state.cancel_all(&[
            format!("_oncollect-{execution_id}"),
            format!("_api-{execution_id}"),
            format!("_api-parent-{execution_id}"),
            format!("_oncompensate-{execution_id}"),
            format!("_convey-messages-{execution_id}"),
        ]);
    }
}
