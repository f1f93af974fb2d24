//! Multi-instance loop scheduler.
//!
//! One root execution of an activity with loop characteristics is turned into
//! child executions `<executionId>_<index>`, run one at a time or fanned out in
//! batches. Child outputs are collected by index and published with the root
//! `execute.completed`. Progress is carried by the `execute.iteration.next` and
//! `execute.iteration.batch` placeholder messages, a redelivered placeholder
//! resumes the loop without starting what is already running.
mod parallel;
mod sequential;

use crate::{
    activity::Activity,
    api::{API_EXCHANGE, ApiType, EXECUTE_COMPLETED, EXECUTE_ERROR, EXECUTE_ITERATION_COMPLETED, EXECUTION_EXCHANGE},
    broker::ConsumeOptions,
    environment::{Logger, is_truthy},
    error::{Error, Result},
    message::{Content, Message, Parent, Properties, unshift_parent},
};
use serde_json::Value;
use std::{
    cell::RefCell,
    collections::{BTreeSet, HashMap},
    fmt::Display,
    rc::Rc,
};

// Placeholder keys that must not leak into iteration content
const PLACEHOLDER_KEYS: [&str; 6] = [
    "preventComplete",
    "running",
    "recorded",
    "completedIndex",
    "keep",
    "ignoreIfExecuting",
];

/// What drives the loop, first configured wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopType {
    Collection,
    CompletionCondition,
    StartCondition,
    Cardinality,
}

impl Display for LoopType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoopType::Collection => "collection",
            LoopType::CompletionCondition => "completion condition",
            LoopType::StartCondition => "start condition",
            LoopType::Cardinality => "cardinality",
        };
        write!(f, "{name}")
    }
}

/// Loop characteristics of an activity.
///
/// Cardinality is either a number or an expression resolving to one. Collection
/// and conditions are expressions evaluated against the execute message, the
/// conditions also see the collected output as `loopOutput`.
#[derive(Debug, Clone, Default)]
pub struct LoopBehaviour {
    pub is_sequential: bool,
    pub loop_cardinality: Option<Value>,
    pub collection: Option<String>,
    pub element_variable: Option<String>,
    pub completion_condition: Option<String>,
    pub start_condition: Option<String>,
}

impl LoopBehaviour {
    pub fn sequential() -> Self {
        Self {
            is_sequential: true,
            ..Default::default()
        }
    }

    pub fn parallel() -> Self {
        Self::default()
    }

    pub fn cardinality(mut self, cardinality: impl Into<Value>) -> Self {
        self.loop_cardinality = Some(cardinality.into());
        self
    }

    /// Standard loop maximum, same as cardinality.
    pub fn loop_maximum(self, maximum: impl Into<Value>) -> Self {
        self.cardinality(maximum)
    }

    /// Iterate `collection`, each item is available to the iteration as `element_variable`.
    pub fn collection(mut self, collection: impl Into<String>, element_variable: Option<&str>) -> Self {
        self.collection = Some(collection.into());
        self.element_variable = element_variable.map(String::from);
        self
    }

    pub fn completion_condition(mut self, condition: impl Into<String>) -> Self {
        self.completion_condition = Some(condition.into());
        self
    }

    pub fn start_condition(mut self, condition: impl Into<String>) -> Self {
        self.start_condition = Some(condition.into());
        self
    }

    /// Standard loop. Tested before each iteration if `test_before`, otherwise after.
    pub fn loop_condition(mut self, condition: impl Into<String>, test_before: bool) -> Self {
        self.is_sequential = true;
        if test_before {
            self.start_condition(condition)
        } else {
            self.completion_condition(condition)
        }
    }

    pub fn get_loop_type(&self) -> Option<LoopType> {
        if self.collection.is_some() {
            Some(LoopType::Collection)
        } else if self.completion_condition.is_some() {
            Some(LoopType::CompletionCondition)
        } else if self.start_condition.is_some() {
            Some(LoopType::StartCondition)
        } else if self.loop_cardinality.is_some() {
            Some(LoopType::Cardinality)
        } else {
            None
        }
    }

    fn element_variable(&self) -> &str {
        self.element_variable.as_deref().unwrap_or("item")
    }
}

/// Resolved once per root execution.
struct LoopSettings {
    cardinality: Option<usize>,
    collection: Option<Vec<Value>>,
    content: Content,
    parent: Parent,
}

impl LoopSettings {
    /// Number of iterations, if known up front.
    fn bound(&self) -> Option<usize> {
        self.cardinality
            .or_else(|| self.collection.as_ref().map(Vec::len))
    }
}

#[derive(Default)]
struct Progress {
    output: Vec<Value>,
    recorded: BTreeSet<usize>,
    index: usize,
    running: usize,
    finalized: bool,
}

/// Per root execution context.
struct LoopExecution {
    execution_id: String,
    settings: LoopSettings,
    progress: RefCell<Progress>,
}

impl LoopExecution {
    fn new(inner: &Inner, message: &Message, execution_id: &str) -> Result<Self> {
        let scope = message.to_scope()?;
        let cardinality = inner.cardinality(&scope)?;
        let collection = inner.collection(&scope)?;

        let mut content = message.content.clone();
        content.output = None;
        content.state = None;
        content.index = None;
        for key in PLACEHOLDER_KEYS {
            content.extra.remove(key);
        }
        content
            .extra
            .insert("isSequential".into(), inner.behaviour.is_sequential.into());
        if let Some(cardinality) = cardinality {
            content
                .extra
                .insert("loopCardinality".into(), cardinality.into());
        }

        Ok(Self {
            execution_id: execution_id.to_string(),
            settings: LoopSettings {
                cardinality,
                collection,
                parent: unshift_parent(message.content.parent.as_ref(), &message.content),
                content,
            },
            progress: Default::default(),
        })
    }

    /// Content of iteration `index`.
    fn iteration_content(&self, inner: &Inner, index: usize) -> Content {
        let mut content = self.settings.content.clone();
        content.execution_id = Some(format!("{}_{index}", self.execution_id));
        content.is_root_scope = false;
        content.is_multi_instance = true;
        content.index = Some(index);
        content.parent = Some(self.settings.parent.clone());
        if let Some(item) = self
            .settings
            .collection
            .as_ref()
            .and_then(|collection| collection.get(index))
        {
            content
                .extra
                .insert(inner.behaviour.element_variable().into(), item.clone());
        }
        content
    }

    /// Root content carrying the complete progress, any placeholder is enough to resume from.
    fn placeholder(&self, state: &str) -> Content {
        let progress = self.progress.borrow();
        let mut content = self.settings.content.clone();
        content.index = Some(progress.index);
        content.output = Some(Value::Array(progress.output.clone()));
        content.state = Some(state.into());
        let recorded: Vec<usize> = progress.recorded.iter().copied().collect();
        content
            .with("preventComplete", true)
            .with("running", progress.running)
            .with("recorded", recorded)
    }

    /// Restore progress persisted in a redelivered placeholder.
    fn restore(&self, content: &Content) {
        let mut progress = self.progress.borrow_mut();
        if let Some(Value::Array(output)) = &content.output {
            progress.output = output.clone();
        }
        if let Some(index) = content.index {
            progress.index = index;
        }
        if let Some(running) = content.get("running").and_then(Value::as_u64) {
            progress.running = usize::try_from(running).unwrap_or_default();
        }
        if let Some(Value::Array(recorded)) = content.get("recorded") {
            progress.recorded = recorded
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|index| usize::try_from(index).ok())
                .collect();
        }
    }

    /// Record iteration output. False if the index was already recorded or the loop is done.
    fn record(&self, index: usize, output: Value) -> bool {
        let mut progress = self.progress.borrow_mut();
        if progress.finalized || !progress.recorded.insert(index) {
            return false;
        }
        if progress.output.len() <= index {
            progress.output.resize(index + 1, Value::Null);
        }
        progress.output[index] = output;
        true
    }

    fn output(&self) -> Vec<Value> {
        self.progress.borrow().output.clone()
    }

    fn is_finalized(&self) -> bool {
        self.progress.borrow().finalized
    }
}

struct Inner {
    activity: Activity,
    behaviour: LoopBehaviour,
    loop_type: Option<LoopType>,
    executions: RefCell<HashMap<String, Rc<LoopExecution>>>,
    logger: Logger,
}

/// Runs the activity body once per iteration.
///
/// ```
/// let characteristics = LoopCharacteristics::new(&activity, LoopBehaviour::sequential().cardinality(3));
/// characteristics.execute(&message)?;
/// ```
pub struct LoopCharacteristics {
    inner: Rc<Inner>,
}

impl LoopCharacteristics {
    pub fn new(activity: &Activity, behaviour: LoopBehaviour) -> Self {
        Self {
            inner: Rc::new(Inner {
                activity: activity.clone(),
                loop_type: behaviour.get_loop_type(),
                behaviour,
                executions: Default::default(),
                logger: activity.logger("loop"),
            }),
        }
    }

    /// `None` if nothing drives the loop, the activity then runs once.
    pub fn loop_type(&self) -> Option<LoopType> {
        self.inner.loop_type
    }

    pub fn is_sequential(&self) -> bool {
        self.inner.behaviour.is_sequential
    }

    /// Intercept a root scope execute message. Other messages are ignored.
    pub fn execute(&self, message: &Message) -> Result<()> {
        let Some(loop_type) = self.inner.loop_type else {
            return Ok(());
        };
        if !message.content.is_root_scope {
            return Ok(());
        }
        let execution_id = message.content.execution_id()?.to_string();

        let execution = match LoopExecution::new(&self.inner, message, &execution_id) {
            Ok(execution) => Rc::new(execution),
            Err(err) => {
                self.inner.publish_error(&execution_id, &message.content, err);
                return Ok(());
            }
        };
        self.inner.debug(
            &execution_id,
            format!(
                "{} {loop_type} loop",
                if self.is_sequential() { "sequential" } else { "parallel" }
            ),
        );

        self.inner
            .executions
            .borrow_mut()
            .insert(execution_id, Rc::clone(&execution));

        if self.is_sequential() {
            sequential::execute(&self.inner, &execution, message);
        } else {
            parallel::execute(&self.inner, &execution, message);
        }
        Ok(())
    }

    /// Cancel the listeners of every running loop. Queued messages are kept.
    pub fn stop(&self) {
        let running: Vec<String> = self.inner.executions.borrow().keys().cloned().collect();
        for execution_id in running {
            self.inner.stop_execution(&execution_id);
        }
    }
}

impl Inner {
    fn cardinality(&self, scope: &Value) -> Result<Option<usize>> {
        let Some(cardinality) = &self.behaviour.loop_cardinality else {
            return Ok(None);
        };
        let resolved = match cardinality {
            Value::String(expression) => self
                .activity
                .environment()
                .resolve_expression(expression, scope.clone())?,
            value => value.clone(),
        };

        let count = match &resolved {
            Value::Number(number) => number
                .as_u64()
                .or_else(|| {
                    number
                        .as_f64()
                        .filter(|value| value.fract() == 0.0 && *value >= 0.0)
                        .map(|value| value as u64)
                })
                .and_then(|count| usize::try_from(count).ok()),
            Value::String(text) => text.trim().parse::<usize>().ok(),
            _ => None,
        };
        count.map(Some).ok_or_else(|| Error::InvalidLoopCardinality {
            id: self.activity.id().to_string(),
            value: resolved.to_string(),
        })
    }

    fn collection(&self, scope: &Value) -> Result<Option<Vec<Value>>> {
        let Some(expression) = &self.behaviour.collection else {
            return Ok(None);
        };
        match self
            .activity
            .environment()
            .resolve_expression(expression, scope.clone())?
        {
            Value::Array(collection) => Ok(Some(collection)),
            other => Err(Error::InvalidCollection {
                id: self.activity.id().to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// Condition evaluated against `message` with the collected output as `loopOutput`.
    fn is_condition_met(&self, condition: Option<&str>, message: &Message, output: &[Value]) -> Result<bool> {
        let Some(condition) = condition else {
            return Ok(false);
        };
        let mut scope = message.to_scope()?;
        if let Value::Object(map) = &mut scope {
            map.insert("loopOutput".into(), Value::Array(output.to_vec()));
        }
        let value = self
            .activity
            .environment()
            .resolve_expression(condition, scope)?;
        Ok(is_truthy(&value))
    }

    fn execution(&self, execution_id: &str) -> Option<Rc<LoopExecution>> {
        self.executions.borrow().get(execution_id).cloned()
    }

    fn subscribe(self: &Rc<Self>, execution_id: &str) {
        let broker = self.activity.broker();

        let weak = Rc::downgrade(self);
        let root = execution_id.to_string();
        broker.subscribe_tmp(
            API_EXCHANGE,
            &format!("activity.*.{execution_id}"),
            move |_, message| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_api(&root, message);
                }
            },
            ConsumeOptions::tag(format!("_api-multi-instance-tag-{execution_id}")).priority(400),
        );

        let weak = Rc::downgrade(self);
        let root = execution_id.to_string();
        broker.subscribe_tmp(
            EXECUTION_EXCHANGE,
            "execute.#",
            move |routing_key, message| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_execution(&root, routing_key, message);
                }
            },
            ConsumeOptions::tag(format!("_execute-q-multi-instance-tag-{execution_id}")).priority(300),
        );
    }

    fn on_api(&self, execution_id: &str, message: &Message) {
        match ApiType::from(message.properties.message_type.as_deref()) {
            ApiType::Stop | ApiType::Discard => self.stop_execution(execution_id),
            _ => {}
        }
    }

    fn on_execution(self: &Rc<Self>, execution_id: &str, routing_key: &str, message: &Message) {
        if routing_key != EXECUTE_COMPLETED {
            return;
        }
        let content = &message.content;
        if !content.is_multi_instance || content.is_root_scope {
            return;
        }
        if content.parent.as_ref().map(|parent| parent.execution_id.as_str()) != Some(execution_id) {
            return;
        }
        let Some(index) = content.index else {
            return;
        };
        let Some(execution) = self.execution(execution_id) else {
            return;
        };

        if self.behaviour.is_sequential {
            sequential::on_completed(self, &execution, index, message);
        } else {
            parallel::on_completed(self, &execution, index, message);
        }
    }

    /// Publish the iteration completed placeholder after recording `index`.
    fn publish_iteration_completed(&self, execution: &LoopExecution, index: usize) {
        self.activity.broker().publish(
            EXECUTION_EXCHANGE,
            EXECUTE_ITERATION_COMPLETED,
            execution
                .placeholder("iteration.completed")
                .with("completedIndex", index),
            Properties::default(),
        );
    }

    fn finalize(&self, execution: &LoopExecution) {
        {
            let mut progress = execution.progress.borrow_mut();
            if progress.finalized {
                return;
            }
            progress.finalized = true;
        }
        self.stop_execution(&execution.execution_id);

        let output = execution.output();
        self.debug(
            &execution.execution_id,
            format!("loop completed with {} iterations", output.len()),
        );
        self.activity.broker().publish(
            EXECUTION_EXCHANGE,
            EXECUTE_COMPLETED,
            execution
                .settings
                .content
                .clone()
                .with_output(Value::Array(output)),
            Properties::default(),
        );
    }

    fn stop_execution(&self, execution_id: &str) {
        let broker = self.activity.broker();
        broker.cancel(&format!("_api-multi-instance-tag-{execution_id}"));
        broker.cancel(&format!("_execute-q-multi-instance-tag-{execution_id}"));
        self.executions.borrow_mut().remove(execution_id);
    }

    fn publish_error(&self, execution_id: &str, content: &Content, error: Error) {
        self.logger
            .error(format!("<{execution_id} ({})> {error}", self.activity.id()));
        if let Some(execution) = self.execution(execution_id) {
            execution.progress.borrow_mut().finalized = true;
        }
        self.stop_execution(execution_id);
        self.activity.broker().publish(
            EXECUTION_EXCHANGE,
            EXECUTE_ERROR,
            content.clone().with("error", error.to_value()),
            Properties::default(),
        );
    }

    fn debug(&self, execution_id: &str, message: impl Display) {
        self.logger
            .debug(format!("<{execution_id} ({})> {message}", self.activity.id()));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        activity::Context,
        api::EXECUTE_START,
        broker::Broker,
        environment::{Environment, Settings},
    };
    use serde_json::json;

    pub(crate) fn activity(broker: &Broker, environment: Environment) -> Activity {
        Activity::new(
            "task",
            "bpmn:Task",
            broker,
            Rc::new(environment),
            Rc::new(Context::new()),
        )
    }

    pub(crate) fn root_message(content: Content) -> Message {
        let content = Content {
            is_root_scope: true,
            ..content
        };
        Message::new(EXECUTION_EXCHANGE, EXECUTE_START, content)
    }

    pub(crate) fn root_content() -> Content {
        Content::new("task", "task_1").with_parent(Some(Parent::new("process", "process_1")))
    }

    /// Completes every started iteration with `output(index)` from inside the start handler.
    pub(crate) fn complete_iterations(broker: &Broker, output: fn(usize) -> Value) {
        let inner = broker.clone();
        broker.subscribe_tmp(
            EXECUTION_EXCHANGE,
            EXECUTE_START,
            move |_, message| {
                if message.content.is_root_scope {
                    return;
                }
                let index = message.content.index.unwrap_or_default();
                inner.publish(
                    EXECUTION_EXCHANGE,
                    EXECUTE_COMPLETED,
                    message.content.clone().with_output(output(index)),
                    Properties::default(),
                );
            },
            ConsumeOptions::tag("_iteration"),
        );
    }

    #[test]
    fn loop_type_first_configured_wins() {
        assert_eq!(LoopBehaviour::parallel().get_loop_type(), None);
        assert_eq!(
            LoopBehaviour::parallel().cardinality(3).get_loop_type(),
            Some(LoopType::Cardinality)
        );
        assert_eq!(
            LoopBehaviour::parallel()
                .cardinality(3)
                .start_condition("${false}")
                .get_loop_type(),
            Some(LoopType::StartCondition)
        );
        assert_eq!(
            LoopBehaviour::sequential()
                .completion_condition("${true}")
                .collection("${list}", None)
                .get_loop_type(),
            Some(LoopType::Collection)
        );

        let standard = LoopBehaviour::parallel().loop_condition("${done}", true);
        assert!(standard.is_sequential);
        assert_eq!(standard.get_loop_type(), Some(LoopType::StartCondition));
        let standard = LoopBehaviour::parallel().loop_condition("${done}", false).loop_maximum(5);
        assert_eq!(standard.get_loop_type(), Some(LoopType::CompletionCondition));
        assert_eq!(standard.loop_cardinality, Some(json!(5)));
    }

    #[test]
    fn inert_without_loop_type() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = crate::broker::tests::record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let characteristics = LoopCharacteristics::new(&activity(&broker, Environment::new()), LoopBehaviour::sequential());

        assert_eq!(characteristics.loop_type(), None);
        characteristics.execute(&root_message(root_content()))?;
        assert!(executions.borrow().is_empty());
        assert_eq!(broker.consumer_count(), 1);
        Ok(())
    }

    #[test]
    fn ignores_iteration_messages() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let executions = crate::broker::tests::record(&broker, EXECUTION_EXCHANGE, "execute.#");
        let characteristics =
            LoopCharacteristics::new(&activity(&broker, Environment::new()), LoopBehaviour::sequential().cardinality(2));

        let iteration = Message::new(EXECUTION_EXCHANGE, EXECUTE_START, root_content());
        characteristics.execute(&iteration)?;
        assert!(executions.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn resolves_cardinality_and_collection() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let environment = Environment::new()
            .variables(json!({ "count": "4", "list": ["a", "b"] }))
            .settings(Settings { batch_size: 10 });
        let behaviour = LoopBehaviour::parallel()
            .cardinality("${environment.variables.count}")
            .collection("${environment.variables.list}", Some("letter"));
        let characteristics = LoopCharacteristics::new(&activity(&broker, environment), behaviour);

        let message = root_message(root_content());
        let execution = LoopExecution::new(&characteristics.inner, &message, "task_1")?;
        assert_eq!(execution.settings.cardinality, Some(4));
        assert_eq!(execution.settings.bound(), Some(4));
        assert_eq!(execution.settings.content.get("loopCardinality"), Some(&json!(4)));

        let iteration = execution.iteration_content(&characteristics.inner, 1);
        assert_eq!(iteration.execution_id.as_deref(), Some("task_1_1"));
        assert_eq!(iteration.get("letter"), Some(&json!("b")));
        assert!(iteration.is_multi_instance);
        assert!(!iteration.is_root_scope);
        let parent = iteration.parent.as_ref().ok_or("parent")?;
        assert_eq!(parent.execution_id, "task_1");
        assert_eq!(parent.path[0].execution_id, "process_1");

        assert!(execution.iteration_content(&characteristics.inner, 3).get("letter").is_none());
        Ok(())
    }

    #[test]
    fn record_is_once_per_index() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let characteristics =
            LoopCharacteristics::new(&activity(&broker, Environment::new()), LoopBehaviour::parallel().cardinality(3));
        let message = root_message(root_content());
        let execution = LoopExecution::new(&characteristics.inner, &message, "task_1")?;

        assert!(execution.record(2, json!("c")));
        assert!(!execution.record(2, json!("again")));
        assert!(execution.record(0, json!("a")));
        assert_eq!(execution.output(), [json!("a"), Value::Null, json!("c")]);

        execution.progress.borrow_mut().finalized = true;
        assert!(!execution.record(1, json!("b")));
        Ok(())
    }

    #[test]
    fn non_numeric_cardinality_publishes_error() -> Result<(), Box<dyn std::error::Error>> {
        let broker = Broker::new();
        let errors = crate::broker::tests::record(&broker, EXECUTION_EXCHANGE, EXECUTE_ERROR);
        let behaviour = LoopBehaviour::sequential().cardinality("${content.missing}");
        let characteristics = LoopCharacteristics::new(&activity(&broker, Environment::new()), behaviour);

        characteristics.execute(&root_message(root_content()))?;

        let errors = errors.borrow();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].content.execution_id.as_deref(), Some("task_1"));
        assert_eq!(errors[0].content.get("error").and_then(|e| e.get("type")), Some(&json!("RunError")));
        assert_eq!(broker.consumer_count(), 1);
        Ok(())
    }
}
