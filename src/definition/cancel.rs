use super::{DefinitionState, EventDefinition, listener, parent_content};
use crate::{
    activity::Activity,
    api::{ACTIVITY_CANCEL, API_EXCHANGE, ApiType, EXECUTE_EXPECT, EXECUTION_EXCHANGE},
    broker::{ConsumeOptions, QueueOptions},
    error::Result,
    message::{Message, Properties},
};
use std::rc::Rc;

struct Inner {
    state: DefinitionState,
    queue_name: String,
}

/// Completes when the activity it is attached to is cancelled.
pub struct CancelEventDefinition {
    inner: Rc<Inner>,
}

impl CancelEventDefinition {
    pub fn new(activity: &Activity) -> Self {
        let queue_name = format!("cancel-{}-q", activity.id());
        if !activity.is_throwing() {
            let broker = activity.broker();
            broker.assert_queue(&queue_name, QueueOptions::durable());
            broker.bind_queue(&queue_name, API_EXCHANGE, "*.cancel.#", 0);
        }

        Self {
            inner: Rc::new(Inner {
                state: DefinitionState::new(activity, "bpmn:CancelEventDefinition", "cancel"),
                queue_name,
            }),
        }
    }
}

impl EventDefinition for CancelEventDefinition {
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
    let Some(execution_id) = inner.state.begin(message)? else {
        return Ok(());
    };
    let broker = inner.state.activity().broker();

    broker.consume(
        &inner.queue_name,
        listener(inner, Inner::on_cancel),
        ConsumeOptions::tag(format!("_oncancel-{execution_id}")),
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

    let exchange_key = format!("execute.canceled.{execution_id}");
    broker.subscribe_once(
        EXECUTION_EXCHANGE,
        &exchange_key,
        listener(inner, Inner::on_cancel),
        ConsumeOptions::tag(format!("_onattached-cancel-{execution_id}")),
    );
    broker.publish(
        EXECUTION_EXCHANGE,
        EXECUTE_EXPECT,
        message
            .content
            .clone()
            .with("pattern", "#.cancel")
            .with("exchange", EXECUTION_EXCHANGE)
            .with("exchangeKey", exchange_key),
        Properties::default(),
    );
    Ok(())
}

impl Inner {
    fn execute_throw(&self, message: &Message) -> Result<()> {
        if self.state.begin(message)?.is_none() {
            return Ok(());
        }
        let signal = parent_content(&message.content)?;
        self.state.complete();
        self.state.throw(message, ACTIVITY_CANCEL, signal, "cancel");
        Ok(())
    }

    fn on_cancel(&self, _: &str, message: &Message) {
        if !self.state.complete() {
            return;
        }
        self.stop();
        if let Some(execution_id) = self.state.execution_id() {
            self.state.debug(&execution_id, "cancel caught");
        }
        self.state
            .publish_completed(message.content.message.clone(), "cancel");
    }

    fn on_api(&self, routing_key: &str, message: &Message) {
        match ApiType::from(message.properties.message_type.as_deref()) {
            ApiType::Cancel => self.on_cancel(routing_key, message),
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
            format!("_oncancel-{execution_id}"),
            format!("_api-{execution_id}"),
            format!("_api-parent-{execution_id}"),
            format!("_onattached-cancel-{execution_id}"),
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        activity::Context,
        api::{EVENT_EXCHANGE, EXECUTE_COMPLETED, EXECUTE_DISCARD},
        broker::{Broker, tests::record},
        definition::tests::{activity, execute_message},
        message::Content,
    };
    use serde_json::json;

    fn open_consumers(broker: &Broker) -> Vec<String> {
        broker
            .consumer_tags()
            .into_iter()
            .filter(|tag| !tag.starts_with("_test-"))
            .collect()
    }

    fn cancel_signal(broker: &Broker, routing_key: &str) {
        broker.publish(
            API_EXCHANGE,
            routing_key,
            Content::new("task", "task_1").with_message(json!({ "reason": "cancelled" })),
            Properties::typed("cancel"),
        );
    }

    #[test]
    fn completes_on_cancel_signal() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let completed = record(&broker, EXECUTION_EXCHANGE, EXECUTE_COMPLETED);
        let definition = CancelEventDefinition::new(&activity(&broker, "event", Context::new()));

        definition.execute(&execute_message("event", "event_1"))?;
        assert!(!definition.is_completed());
        assert_eq!(
            open_consumers(&broker),
            [
                "_api-event_1",
                "_api-parent-event_1",
                "_onattached-cancel-event_1",
                "_oncancel-event_1"
            ]
        );

        cancel_signal(&broker, "activity.cancel.event_1");
        cancel_signal(&broker, "activity.cancel.event_1");

        assert!(definition.is_completed());
        let completed = completed.borrow();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].content.execution_id.as_deref(), Some("event_1"));
        assert_eq!(completed[0].content.state.as_deref(), Some("cancel"));
        assert_eq!(completed[0].content.output, Some(json!({ "reason": "cancelled" })));
        assert!(open_consumers(&broker).is_empty());
        Ok(())
    }

    #[test]
    fn signal_before_execute_completes_synchronously() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let definition = CancelEventDefinition::new(&activity(&broker, "event", Context::new()));

        cancel_signal(&broker, "process.cancel");
        definition.execute(&execute_message("event", "event_1"))?;

        assert!(definition.is_completed());
        assert!(open_consumers(&broker).is_empty());
        let executions = executions.borrow();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].routing_key(), EXECUTE_COMPLETED);
        Ok(())
    }

    #[test]
    fn execute_again_rearms() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let definition = CancelEventDefinition::new(&activity(&broker, "event", Context::new()));

        definition.execute(&execute_message("event", "event_1"))?;
        cancel_signal(&broker, "activity.cancel.event_1");
        assert!(definition.is_completed());

        definition.execute(&execute_message("event", "event_2"))?;
        assert!(!definition.is_completed());
        assert_eq!(definition.execution_id().as_deref(), Some("event_2"));
        assert!(broker.get_consumer("_oncancel-event_2"));

        definition.execute(&execute_message("event", "event_2").redelivered())?;
        assert!(broker.get_consumer("_oncancel-event_2"));
        Ok(())
    }

    #[test]
    fn expect_negotiates_cancel_routing_key() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let definition = CancelEventDefinition::new(
            &activity(&broker, "event", Context::new()).attached_to("transaction"),
        );

        definition.execute(&execute_message("event", "event_1"))?;
        let expect = executions.borrow()[0].clone();
        assert_eq!(expect.routing_key(), EXECUTE_EXPECT);
        assert_eq!(expect.content.get("pattern"), Some(&json!("#.cancel")));
        assert_eq!(expect.content.get("exchangeKey"), Some(&json!("execute.canceled.event_1")));

        broker.publish(
            EXECUTION_EXCHANGE,
            "execute.canceled.event_1",
            Content::new("transaction", "transaction_1"),
            Properties::default(),
        );
        assert!(definition.is_completed());
        assert_eq!(executions.borrow().last().map(|m| m.routing_key().to_string()).as_deref(), Some(EXECUTE_COMPLETED));
        assert!(open_consumers(&broker).is_empty());
        Ok(())
    }

    #[test]
    fn stop_and_discard() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let discarded = record(&broker, EXECUTION_EXCHANGE, EXECUTE_DISCARD);
        let definition = CancelEventDefinition::new(&activity(&broker, "event", Context::new()));

        definition.execute(&execute_message("event", "event_1"))?;
        broker.publish(API_EXCHANGE, "activity.stop.process_1", Content::default(), Properties::typed("stop"));
        assert!(open_consumers(&broker).is_empty());
        assert!(!definition.is_completed());
        assert!(discarded.borrow().is_empty());

        definition.execute(&execute_message("event", "event_2"))?;
        broker.publish(API_EXCHANGE, "activity.discard.event_2", Content::default(), Properties::typed("discard"));
        broker.publish(API_EXCHANGE, "activity.discard.event_2", Content::default(), Properties::typed("discard"));
        assert!(open_consumers(&broker).is_empty());
        assert_eq!(discarded.borrow().len(), 1);
        Ok(())
    }

    #[test]
    fn throw_publishes_cancel_to_parent() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let events = record(&broker, EVENT_EXCHANGE, ACTIVITY_CANCEL);
        let completed = record(&broker, EXECUTION_EXCHANGE, EXECUTE_COMPLETED);
        let definition = CancelEventDefinition::new(&activity(&broker, "end", Context::new()).throwing());

        definition.execute(&execute_message("end", "end_1"))?;

        let events = events.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content.execution_id.as_deref(), Some("process_1"));
        assert_eq!(events[0].content.parent, None);
        assert!(events[0].properties.delegate);
        assert_eq!(events[0].properties.message_type.as_deref(), Some("cancel"));
        assert_eq!(completed.borrow().len(), 1);
        assert!(definition.is_completed());
        assert_eq!(broker.message_count("cancel-end-q"), 0);
        Ok(())
    }
}
