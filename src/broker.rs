//! In-process, single threaded message broker.
//!
//! Topic exchanges route published messages to bound queues by pattern. Queues
//! hand messages to their highest priority consumer. Durable queues keep
//! messages until a consumer attaches, which is how a signal published before
//! anyone listens is still caught later.
//!
//! Delivery is synchronous and run to completion. A publish made outside of a
//! consumer callback drains every queue before it returns. A publish made from
//! inside a callback is delivered after that callback returns, in publish order.
mod queue;
mod routing;

pub use queue::QueueOptions;
pub use routing::Pattern;

use crate::{
    api::{API_EXCHANGE, EVENT_EXCHANGE, EXECUTION_EXCHANGE},
    message::{Content, Fields, Message, Properties},
};
use log::{debug, warn};
use queue::Queue;
use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    rc::Rc,
};

/// Consumer callback, receives routing key and message.
pub type Callback = Rc<dyn Fn(&str, &Message)>;

#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub consumer_tag: Option<String>,
    pub priority: i32,
}

impl ConsumeOptions {
    pub fn tag(consumer_tag: impl Into<String>) -> Self {
        Self {
            consumer_tag: Some(consumer_tag.into()),
            priority: 0,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

struct Binding {
    queue: String,
    pattern: Pattern,
    priority: i32,
}

struct Consumer {
    queue: String,
    callback: Callback,
    once: bool,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, Queue>,
    consumers: HashMap<String, Consumer>,
    // One entry per enqueued message, names the queue to look at
    ready: VecDeque<String>,
    dispatching: bool,
    sequence: usize,
}

impl State {
    fn next_tag(&mut self, prefix: &str) -> String {
        self.sequence += 1;
        format!("{prefix}-{}", self.sequence)
    }

    /// False if the queue is unknown, or not durable and without consumers.
    fn enqueue(&mut self, queue_name: &str, message: Message) -> bool {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return false;
        };
        if !queue.options.durable && queue.consumers.is_empty() {
            debug!("dropped {} on {queue_name}, no consumer", message.routing_key());
            return false;
        }
        queue.messages.push_back(message);
        self.ready.push_back(queue_name.to_string());
        true
    }

    fn remove_consumer(&mut self, tag: &str) -> bool {
        let Some(consumer) = self.consumers.remove(tag) else {
            return false;
        };

        let delete = match self.queues.get_mut(&consumer.queue) {
            Some(queue) => {
                queue.remove_consumer(tag);
                queue.options.auto_delete && queue.consumers.is_empty()
            }
            None => false,
        };

        if delete {
            self.delete_queue(&consumer.queue);
        }
        true
    }

    fn delete_queue(&mut self, queue_name: &str) {
        self.queues.remove(queue_name);
        for bindings in self.exchanges.values_mut() {
            bindings.retain(|binding| binding.queue != queue_name);
        }
    }

    fn next_delivery(&mut self) -> Option<(Callback, Message)> {
        while let Some(queue_name) = self.ready.pop_front() {
            let Some(queue) = self.queues.get_mut(&queue_name) else {
                continue;
            };
            let Some(tag) = queue.first_consumer().map(String::from) else {
                continue;
            };
            let Some(mut message) = queue.messages.pop_front() else {
                continue;
            };
            let Some(consumer) = self.consumers.get(&tag) else {
                continue;
            };

            message.fields.consumer_tag = Some(tag.clone());
            let callback = Rc::clone(&consumer.callback);
            let once = consumer.once;
            if once {
                self.remove_consumer(&tag);
            }
            return Some((callback, message));
        }
        None
    }
}

// Resets the dispatching flag even if a callback unwinds
struct DispatchGuard<'a>(&'a RefCell<State>);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.try_borrow_mut() {
            state.dispatching = false;
        }
    }
}

/// Cheap to clone handle to a shared broker.
#[derive(Clone)]
pub struct Broker {
    state: Rc<RefCell<State>>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// Broker with the `execution`, `event` and `api` exchanges asserted.
    pub fn new() -> Self {
        let broker = Self {
            state: Default::default(),
        };
        broker.assert_exchange(EXECUTION_EXCHANGE);
        broker.assert_exchange(EVENT_EXCHANGE);
        broker.assert_exchange(API_EXCHANGE);
        broker
    }

    pub fn assert_exchange(&self, name: &str) {
        self.state
            .borrow_mut()
            .exchanges
            .entry(name.to_string())
            .or_default();
    }

    pub fn assert_queue(&self, name: &str, options: QueueOptions) {
        self.state
            .borrow_mut()
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Queue::new(options));
    }

    /// Bind queue to exchange. Higher priority bindings receive a message first.
    pub fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str, priority: i32) {
        let mut state = self.state.borrow_mut();
        let bindings = state.exchanges.entry(exchange.to_string()).or_default();
        if bindings
            .iter()
            .any(|binding| binding.queue == queue && binding.pattern.as_str() == pattern)
        {
            return;
        }

        let position = bindings
            .iter()
            .position(|binding| binding.priority < priority)
            .unwrap_or(bindings.len());
        bindings.insert(
            position,
            Binding {
                queue: queue.to_string(),
                pattern: Pattern::new(pattern),
                priority,
            },
        );
    }

    pub fn publish(&self, exchange: &str, routing_key: &str, content: Content, properties: Properties) {
        {
            let mut state = self.state.borrow_mut();
            let Some(bindings) = state.exchanges.get(exchange) else {
                warn!("Publish to unknown exchange {exchange} with {routing_key}");
                return;
            };

            let mut targets: Vec<String> = Vec::new();
            for binding in bindings {
                if binding.pattern.matches(routing_key) && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }

            if targets.is_empty() && properties.mandatory {
                warn!("Mandatory message {routing_key} on {exchange} was not routed");
            }

            for queue_name in targets {
                let message = Message {
                    fields: Fields {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        ..Default::default()
                    },
                    content: content.clone(),
                    properties: properties.clone(),
                };
                state.enqueue(&queue_name, message);
            }
        }
        self.dispatch();
    }

    /// Put a message straight into a queue, keeping its fields.
    pub fn send_to_queue(&self, queue: &str, message: Message) {
        let queued = self.state.borrow_mut().enqueue(queue, message);
        if queued {
            self.dispatch();
        } else {
            warn!("Send to {queue} was not queued");
        }
    }

    /// Consume a queue, asserting it if missing. A consumer with the same tag is replaced.
    pub fn consume<F>(&self, queue: &str, callback: F, options: ConsumeOptions) -> String
    where
        F: Fn(&str, &Message) + 'static,
    {
        self.add_consumer(queue, Rc::new(callback), options, false)
    }

    /// Consume a temporary queue bound to `exchange` by `pattern`. Cancelling it deletes the queue.
    pub fn subscribe_tmp<F>(&self, exchange: &str, pattern: &str, callback: F, options: ConsumeOptions) -> String
    where
        F: Fn(&str, &Message) + 'static,
    {
        self.subscribe(exchange, pattern, Rc::new(callback), options, false)
    }

    /// Same as [`Broker::subscribe_tmp`] but cancelled after the first delivery.
    pub fn subscribe_once<F>(&self, exchange: &str, pattern: &str, callback: F, options: ConsumeOptions) -> String
    where
        F: Fn(&str, &Message) + 'static,
    {
        self.subscribe(exchange, pattern, Rc::new(callback), options, true)
    }

    /// Cancel consumer by tag. Unknown tags are ignored.
    pub fn cancel(&self, consumer_tag: &str) -> bool {
        let removed = self.state.borrow_mut().remove_consumer(consumer_tag);
        if removed {
            debug!("cancelled consumer {consumer_tag}");
        }
        removed
    }

    pub fn purge_queue(&self, queue: &str) -> usize {
        let mut state = self.state.borrow_mut();
        state
            .queues
            .get_mut(queue)
            .map(|queue| queue.messages.drain(..).count())
            .unwrap_or_default()
    }

    pub fn message_count(&self, queue: &str) -> usize {
        self.state
            .borrow()
            .queues
            .get(queue)
            .map(|queue| queue.messages.len())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self) -> usize {
        self.state.borrow().consumers.len()
    }

    pub fn get_consumer(&self, consumer_tag: &str) -> bool {
        self.state.borrow().consumers.contains_key(consumer_tag)
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.state.borrow().consumers.keys().cloned().collect();
        tags.sort();
        tags
    }

    fn subscribe(&self, exchange: &str, pattern: &str, callback: Callback, options: ConsumeOptions, once: bool) -> String {
        let (tag, queue_name) = {
            let mut state = self.state.borrow_mut();
            let tag = match &options.consumer_tag {
                Some(tag) => tag.clone(),
                None => state.next_tag("smq.ctag"),
            };
            (tag.clone(), format!("{tag}-tmp-q"))
        };

        // Replacing a consumer deletes its temporary queue, so cancel before asserting a new one
        self.cancel(&tag);
        self.assert_queue(&queue_name, QueueOptions::temporary());
        self.bind_queue(&queue_name, exchange, pattern, options.priority);
        self.add_consumer(
            &queue_name,
            callback,
            ConsumeOptions {
                consumer_tag: Some(tag),
                ..options
            },
            once,
        )
    }

    fn add_consumer(&self, queue: &str, callback: Callback, options: ConsumeOptions, once: bool) -> String {
        let tag = {
            let mut state = self.state.borrow_mut();
            let tag = match options.consumer_tag {
                Some(tag) => tag,
                None => state.next_tag("smq.ctag"),
            };

            if state.consumers.contains_key(&tag) {
                state.remove_consumer(&tag);
            }

            let queue_name = queue.to_string();
            let pending = {
                let queue = state
                    .queues
                    .entry(queue_name.clone())
                    .or_insert_with(|| Queue::new(QueueOptions::default()));
                queue.add_consumer(tag.clone(), options.priority);
                queue.messages.len()
            };

            state.consumers.insert(
                tag.clone(),
                Consumer {
                    queue: queue_name.clone(),
                    callback,
                    once,
                },
            );
            for _ in 0..pending {
                state.ready.push_back(queue_name.clone());
            }
            tag
        };

        self.dispatch();
        tag
    }

    fn dispatch(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }

        let _guard = DispatchGuard(&self.state);
        loop {
            let next = self.state.borrow_mut().next_delivery();
            let Some((callback, message)) = next else {
                break;
            };
            callback(message.routing_key(), &message);
        }
    }
}
