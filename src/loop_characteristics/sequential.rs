use super::{Inner, LoopExecution};
use crate::{
    api::{EXECUTE_ITERATION_COMPLETED, EXECUTE_ITERATION_NEXT, EXECUTE_START, EXECUTION_EXCHANGE},
    message::{Message, Properties},
};
use serde_json::Value;
use std::rc::Rc;

pub(super) fn execute(inner: &Rc<Inner>, execution: &LoopExecution, message: &Message) {
    let content = &message.content;
    let (index, resume) = match (message.fields.redelivered, message.routing_key()) {
        // The iteration may still be running
        (true, EXECUTE_ITERATION_NEXT) => (content.index.unwrap_or_default(), true),
        (true, EXECUTE_ITERATION_COMPLETED) => {
            let completed = content
                .get("completedIndex")
                .and_then(Value::as_u64)
                .and_then(|index| usize::try_from(index).ok())
                .or(content.index)
                .unwrap_or_default();
            (completed + 1, false)
        }
        _ => (0, false),
    };
    if index > 0 || resume {
        execution.restore(content);
        execution.progress.borrow_mut().recorded.extend(0..index);
        inner.debug(&execution.execution_id, format!("resume at iteration {index}"));
    }

    inner.subscribe(&execution.execution_id);
    start_next(inner, execution, index, resume);
}

pub(super) fn on_completed(inner: &Inner, execution: &LoopExecution, index: usize, message: &Message) {
    // Only the running iteration counts
    if index != execution.progress.borrow().index {
        return;
    }
    let output = message.content.output.clone().unwrap_or(Value::Null);
    if !execution.record(index, output) {
        return;
    }
    execution.progress.borrow_mut().running = 0;
    inner.publish_iteration_completed(execution, index);

    match inner.is_condition_met(
        inner.behaviour.completion_condition.as_deref(),
        message,
        &execution.output(),
    ) {
        Ok(true) => inner.finalize(execution),
        Ok(false) => start_next(inner, execution, index + 1, false),
        Err(err) => inner.publish_error(&execution.execution_id, &execution.settings.content, err),
    }
}

fn start_next(inner: &Inner, execution: &LoopExecution, index: usize, ignore_if_executing: bool) {
    if execution
        .settings
        .bound()
        .is_some_and(|bound| index >= bound)
    {
        return inner.finalize(execution);
    }

    let start = Message::new(
        EXECUTION_EXCHANGE,
        EXECUTE_START,
        execution.iteration_content(inner, index),
    );
    match inner.is_condition_met(
        inner.behaviour.start_condition.as_deref(),
        &start,
        &execution.output(),
    ) {
        Ok(true) => return inner.finalize(execution),
        Ok(false) => {}
        Err(err) => {
            return inner.publish_error(&execution.execution_id, &execution.settings.content, err);
        }
    }

    {
        let mut progress = execution.progress.borrow_mut();
        progress.index = index;
        progress.running = 1;
    }
    inner.debug(&execution.execution_id, format!("start iteration {index}"));

    let broker = inner.activity.broker();
    broker.publish(
        EXECUTION_EXCHANGE,
        EXECUTE_ITERATION_NEXT,
        execution.placeholder("iteration.next"),
        Properties::default(),
    );

    let mut content = start.content;
    if ignore_if_executing {
        content = content.with("ignoreIfExecuting", true);
    }
    broker.publish(EXECUTION_EXCHANGE, EXECUTE_START, content, Properties::default());
}
