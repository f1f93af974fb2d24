use super::{Inner, LoopExecution};
use crate::{
    api::{EXECUTE_ITERATION_BATCH, EXECUTE_START, EXECUTION_EXCHANGE},
    error::Error,
    message::{Message, Properties},
};
use serde_json::Value;
use std::rc::Rc;

pub(super) fn execute(inner: &Rc<Inner>, execution: &LoopExecution, message: &Message) {
    let Some(bound) = execution.settings.bound() else {
        return inner.publish_error(
            &execution.execution_id,
            &message.content,
            Error::UnboundedParallelLoop(inner.activity.id().to_string()),
        );
    };

    inner.subscribe(&execution.execution_id);

    if message.fields.redelivered {
        execution.restore(&message.content);
        let (index, running) = {
            let progress = execution.progress.borrow();
            (progress.index, progress.running)
        };
        inner.debug(
            &execution.execution_id,
            format!("resume at index {index} with {running} running"),
        );
        if running == 0 {
            continue_or_finalize(inner, execution, bound);
        }
        return;
    }

    start_batch(inner, execution, bound);
}

pub(super) fn on_completed(inner: &Inner, execution: &LoopExecution, index: usize, message: &Message) {
    let Some(bound) = execution.settings.bound() else {
        return;
    };
    if index >= bound {
        return;
    }
    let output = message.content.output.clone().unwrap_or(Value::Null);
    if !execution.record(index, output) {
        return;
    }
    let running = {
        let mut progress = execution.progress.borrow_mut();
        progress.running = progress.running.saturating_sub(1);
        progress.running
    };
    inner.publish_iteration_completed(execution, index);

    match inner.is_condition_met(
        inner.behaviour.completion_condition.as_deref(),
        message,
        &execution.output(),
    ) {
        Ok(true) => return inner.finalize(execution),
        Ok(false) => {}
        Err(err) => {
            return inner.publish_error(&execution.execution_id, &execution.settings.content, err);
        }
    }

    if running == 0 {
        continue_or_finalize(inner, execution, bound);
    }
}

fn continue_or_finalize(inner: &Inner, execution: &LoopExecution, bound: usize) {
    if execution.progress.borrow().index >= bound {
        inner.finalize(execution);
    } else {
        start_batch(inner, execution, bound);
    }
}

/// Fan out the next `batch_size` iterations.
fn start_batch(inner: &Inner, execution: &LoopExecution, bound: usize) {
    let batch_size = inner
        .activity
        .environment()
        .get_settings()
        .batch_size
        .max(1);
    let (start, end) = {
        let mut progress = execution.progress.borrow_mut();
        let start = progress.index;
        let end = bound.min(start + batch_size);
        progress.index = end;
        progress.running += end - start;
        (start, end)
    };
    if start >= end {
        return inner.finalize(execution);
    }

    inner.debug(
        &execution.execution_id,
        format!("start iterations {start}..{end} of {bound}"),
    );

    let broker = inner.activity.broker();
    broker.publish(
        EXECUTION_EXCHANGE,
        EXECUTE_ITERATION_BATCH,
        execution.placeholder("iteration.batch"),
        Properties::default(),
    );

    for index in start..end {
        if execution.is_finalized() {
            break;
        }
        broker.publish(
            EXECUTION_EXCHANGE,
            EXECUTE_START,
            execution.iteration_content(inner, index).with("keep", true),
            Properties::default(),
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        api::{
            API_EXCHANGE, EXECUTE_COMPLETED, EXECUTE_ERROR, EXECUTE_ITERATION_BATCH, EXECUTE_ITERATION_COMPLETED,
            EXECUTE_START, EXECUTION_EXCHANGE,
        },
        broker::{Broker, tests::record},
        environment::{Environment, Settings},
        loop_characteristics::{
            LoopBehaviour, LoopCharacteristics,
            tests::{activity, complete_iterations, root_content, root_message},
        },
        message::{Content, Message, Parent, Properties},
    };
    use serde_json::{Value, json};

    fn started(messages: &[Message]) -> Vec<Message> {
        messages
            .iter()
            .filter(|message| message.routing_key() == EXECUTE_START)
            .cloned()
            .collect()
    }

    fn root_completions(messages: &[Message]) -> Vec<Message> {
        messages
            .iter()
            .filter(|message| {
                message.routing_key() == EXECUTE_COMPLETED && message.content.execution_id.as_deref() == Some("task_1")
            })
            .cloned()
            .collect()
    }

    fn complete(broker: &Broker, iteration: &Message, output: Value) {
        broker.publish(
            EXECUTION_EXCHANGE,
            EXECUTE_COMPLETED,
            iteration.content.clone().with_output(output),
            Properties::default(),
        );
    }

    #[test]
    fn starts_all_iterations_up_front() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let characteristics =
            LoopCharacteristics::new(&activity(&broker, Environment::new()), LoopBehaviour::parallel().cardinality(3));

        characteristics.execute(&root_message(root_content()))?;

        let routing_keys: Vec<_> = executions
            .borrow()
            .iter()
            .map(|message| message.routing_key().to_string())
            .collect();
        assert_eq!(
            routing_keys,
            [EXECUTE_ITERATION_BATCH, EXECUTE_START, EXECUTE_START, EXECUTE_START]
        );

        let batch = executions.borrow()[0].clone();
        assert!(batch.content.flag("preventComplete"));
        assert_eq!(batch.content.index, Some(3));
        assert_eq!(batch.content.get("running"), Some(&json!(3)));

        let iterations = started(&executions.borrow());
        assert!(iterations.iter().all(|message| message.content.flag("keep")));
        assert_eq!(iterations[2].content.execution_id.as_deref(), Some("task_1_2"));
        Ok(())
    }

    #[test]
    fn output_is_collected_by_index() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let characteristics =
            LoopCharacteristics::new(&activity(&broker, Environment::new()), LoopBehaviour::parallel().cardinality(3));

        characteristics.execute(&root_message(root_content()))?;
        let iterations = started(&executions.borrow());

        complete(&broker, &iterations[2], json!("c"));
        complete(&broker, &iterations[0], json!("a"));
        assert!(root_completions(&executions.borrow()).is_empty());
        complete(&broker, &iterations[1], json!("b"));

        let completions = root_completions(&executions.borrow());
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].content.output, Some(json!(["a", "b", "c"])));

        let iteration_completed = executions
            .borrow()
            .iter()
            .filter(|message| message.routing_key() == EXECUTE_ITERATION_COMPLETED)
            .count();
        assert_eq!(iteration_completed, 3);

        // Late duplicate is ignored
        complete(&broker, &iterations[1], json!("again"));
        assert_eq!(root_completions(&executions.borrow()).len(), 1);
        assert_eq!(broker.consumer_count(), 1);
        Ok(())
    }

    #[test]
    fn duplicate_completion_is_recorded_once() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let characteristics =
            LoopCharacteristics::new(&activity(&broker, Environment::new()), LoopBehaviour::parallel().cardinality(2));

        characteristics.execute(&root_message(root_content()))?;
        let iterations = started(&executions.borrow());

        complete(&broker, &iterations[0], json!(1));
        complete(&broker, &iterations[0], json!(2));
        assert!(root_completions(&executions.borrow()).is_empty());

        complete(&broker, &iterations[1], json!(3));
        assert_eq!(root_completions(&executions.borrow())[0].content.output, Some(json!([1, 3])));
        Ok(())
    }

    #[test]
    fn completion_condition_finalizes_early() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let environment = Environment::new().service("two", |scope| {
            let done = scope["loopOutput"]
                .as_array()
                .is_some_and(|output| output.iter().filter(|value| !value.is_null()).count() >= 2);
            Ok(json!(done))
        });
        let behaviour = LoopBehaviour::parallel()
            .cardinality(3)
            .completion_condition("${environment.services.two()}");
        let characteristics = LoopCharacteristics::new(&activity(&broker, environment), behaviour);

        characteristics.execute(&root_message(root_content()))?;
        let iterations = started(&executions.borrow());
        assert_eq!(iterations.len(), 3);

        complete(&broker, &iterations[0], json!("a"));
        complete(&broker, &iterations[1], json!("b"));

        let completions = root_completions(&executions.borrow());
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].content.output, Some(json!(["a", "b"])));

        complete(&broker, &iterations[2], json!("c"));
        assert_eq!(root_completions(&executions.borrow()).len(), 1);
        Ok(())
    }

    #[test]
    fn batch_size_limits_running_iterations() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let environment = Environment::new().settings(Settings { batch_size: 2 });
        let characteristics =
            LoopCharacteristics::new(&activity(&broker, environment), LoopBehaviour::parallel().cardinality(5));

        characteristics.execute(&root_message(root_content()))?;
        assert_eq!(started(&executions.borrow()).len(), 2);

        let first = started(&executions.borrow());
        complete(&broker, &first[0], json!(0));
        assert_eq!(started(&executions.borrow()).len(), 2);
        complete(&broker, &first[1], json!(1));
        assert_eq!(started(&executions.borrow()).len(), 4);

        let batches: Vec<_> = executions
            .borrow()
            .iter()
            .filter(|message| message.routing_key() == EXECUTE_ITERATION_BATCH)
            .map(|message| message.content.index)
            .collect();
        assert_eq!(batches, [Some(2), Some(4)]);

        let second = started(&executions.borrow());
        complete(&broker, &second[3], json!(3));
        complete(&broker, &second[2], json!(2));
        let last = started(&executions.borrow());
        assert_eq!(last.len(), 5);
        assert_eq!(last[4].content.execution_id.as_deref(), Some("task_1_4"));
        complete(&broker, &last[4], json!(4));

        let completions = root_completions(&executions.borrow());
        assert_eq!(completions[0].content.output, Some(json!([0, 1, 2, 3, 4])));
        Ok(())
    }

    #[test]
    fn synchronous_iterations_complete_the_loop() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        complete_iterations(&broker, |index| json!(index + 1));
        let environment = Environment::new().settings(Settings { batch_size: 2 });
        let behaviour = LoopBehaviour::parallel().collection("${content.list}", None);
        let characteristics = LoopCharacteristics::new(&activity(&broker, environment), behaviour);

        characteristics.execute(&root_message(root_content().with("list", json!(["x", "y", "z"]))))?;

        let executions = executions.borrow();
        let items: Vec<_> = started(&executions)
            .iter()
            .filter_map(|message| message.content.get("item").cloned())
            .collect();
        assert_eq!(items, [json!("x"), json!("y"), json!("z")]);
        let completions = root_completions(&executions);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].content.output, Some(json!([1, 2, 3])));
        Ok(())
    }

    #[test]
    fn empty_collection_completes_immediately() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let behaviour = LoopBehaviour::parallel().collection("${content.list}", None);
        let characteristics = LoopCharacteristics::new(&activity(&broker, Environment::new()), behaviour);

        characteristics.execute(&root_message(root_content().with("list", json!([]))))?;

        let executions = executions.borrow();
        assert!(started(&executions).is_empty());
        assert_eq!(root_completions(&executions)[0].content.output, Some(json!([])));
        assert_eq!(broker.consumer_count(), 1);
        Ok(())
    }

    #[test]
    fn unbounded_loop_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let errors = record(&broker, EXECUTION_EXCHANGE, EXECUTE_ERROR);
        let behaviour = LoopBehaviour::parallel().completion_condition("${true}");
        let characteristics = LoopCharacteristics::new(&activity(&broker, Environment::new()), behaviour);

        characteristics.execute(&root_message(root_content()))?;

        assert_eq!(errors.borrow().len(), 1);
        assert_eq!(broker.consumer_count(), 1);
        Ok(())
    }

    #[test]
    fn redelivered_batch_resumes_without_starting() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let characteristics =
            LoopCharacteristics::new(&activity(&broker, Environment::new()), LoopBehaviour::parallel().cardinality(2));

        let placeholder = root_content()
            .with_output(json!(["a"]))
            .with("running", 1)
            .with("preventComplete", true);
        let placeholder = Content {
            index: Some(2),
            ..placeholder
        };
        let mut message = root_message(placeholder).redelivered();
        message.fields.routing_key = EXECUTE_ITERATION_BATCH.into();

        characteristics.execute(&message)?;
        assert!(started(&executions.borrow()).is_empty());

        let iteration = Message::new(
            EXECUTION_EXCHANGE,
            EXECUTE_START,
            Content {
                index: Some(1),
                is_multi_instance: true,
                ..Content::new("task", "task_1_1")
                    .with_parent(Some(Parent::new("task", "task_1")))
            },
        );
        complete(&broker, &iteration, json!("b"));

        let completions = root_completions(&executions.borrow());
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].content.output, Some(json!(["a", "b"])));
        Ok(())
    }

    #[test]
    fn resumes_from_latest_placeholder_after_partial_completion() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let activity = activity(&broker, Environment::new());
        let characteristics = LoopCharacteristics::new(&activity, LoopBehaviour::parallel().cardinality(3));

        characteristics.execute(&root_message(root_content()))?;
        let iterations = started(&executions.borrow());
        complete(&broker, &iterations[0], json!("a"));
        broker.publish(API_EXCHANGE, "activity.stop.task_1", Content::default(), Properties::typed("stop"));
        assert_eq!(broker.consumer_count(), 1);

        let latest = executions.borrow().last().cloned().ok_or("placeholder")?;
        assert_eq!(latest.routing_key(), EXECUTE_ITERATION_COMPLETED);
        assert_eq!(latest.content.index, Some(3));
        assert_eq!(latest.content.get("completedIndex"), Some(&json!(0)));
        assert_eq!(latest.content.get("running"), Some(&json!(2)));
        assert_eq!(latest.content.get("recorded"), Some(&json!([0])));
        assert_eq!(latest.content.output, Some(json!(["a"])));
        executions.borrow_mut().clear();

        let recovered = LoopCharacteristics::new(&activity, LoopBehaviour::parallel().cardinality(3));
        recovered.execute(&latest.redelivered())?;
        assert!(started(&executions.borrow()).is_empty());

        // Completed before the stop, must not count twice
        complete(&broker, &iterations[0], json!("again"));
        complete(&broker, &iterations[2], json!("c"));
        assert!(root_completions(&executions.borrow()).is_empty());
        complete(&broker, &iterations[1], json!("b"));

        let completions = root_completions(&executions.borrow());
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].content.output, Some(json!(["a", "b", "c"])));
        assert!(started(&executions.borrow()).is_empty());
        Ok(())
    }

    #[test]
    fn redelivered_completion_of_batch_starts_next_batch_once() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let activity = activity(&broker, Environment::new().settings(Settings { batch_size: 2 }));
        let characteristics = LoopCharacteristics::new(&activity, LoopBehaviour::parallel().cardinality(3));

        characteristics.execute(&root_message(root_content()))?;
        let iterations = started(&executions.borrow());
        complete(&broker, &iterations[0], json!(0));
        characteristics.stop();

        let mut latest = executions
            .borrow()
            .iter()
            .rev()
            .find(|message| message.routing_key() == EXECUTE_ITERATION_COMPLETED)
            .cloned()
            .ok_or("placeholder")?;
        // Second child of the batch completed while the loop was stopped
        latest.content.output = Some(json!([0, 1]));
        latest.content.extra.insert("running".into(), json!(0));
        latest.content.extra.insert("recorded".into(), json!([0, 1]));
        executions.borrow_mut().clear();

        let recovered = LoopCharacteristics::new(&activity, LoopBehaviour::parallel().cardinality(3));
        recovered.execute(&latest.redelivered())?;

        let restarted = started(&executions.borrow());
        assert_eq!(restarted.len(), 1);
        assert_eq!(restarted[0].content.execution_id.as_deref(), Some("task_1_2"));

        complete(&broker, &restarted[0], json!(2));
        let completions = root_completions(&executions.borrow());
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].content.output, Some(json!([0, 1, 2])));
        Ok(())
    }

    #[test]
    fn stop_cancels_listeners() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let characteristics =
            LoopCharacteristics::new(&activity(&broker, Environment::new()), LoopBehaviour::parallel().cardinality(2));

        characteristics.execute(&root_message(root_content()))?;
        assert_eq!(broker.consumer_count(), 3);

        broker.publish(API_EXCHANGE, "activity.discard.task_1", Content::default(), Properties::typed("discard"));
        assert_eq!(broker.consumer_count(), 1);

        let iterations = started(&executions.borrow());
        complete(&broker, &iterations[0], json!(1));
        complete(&broker, &iterations[1], json!(2));
        assert!(root_completions(&executions.borrow()).is_empty());

        characteristics.execute(&root_message(root_content()))?;
        characteristics.stop();
        assert_eq!(broker.consumer_count(), 1);
        Ok(())
    }
}
