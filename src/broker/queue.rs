use crate::message::Message;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Keeps messages until a consumer attaches.
    pub durable: bool,
    /// Deleted, bindings included, when the last consumer is cancelled.
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }

    pub fn temporary() -> Self {
        Self {
            durable: false,
            auto_delete: true,
        }
    }
}

#[derive(Debug)]
pub(super) struct Queue {
    pub(super) options: QueueOptions,
    pub(super) messages: VecDeque<Message>,
    // Consumer tags, highest priority first
    pub(super) consumers: Vec<(String, i32)>,
}

impl Queue {
    pub(super) fn new(options: QueueOptions) -> Self {
        Self {
            options,
            messages: Default::default(),
            consumers: Default::default(),
        }
    }

    pub(super) fn add_consumer(&mut self, tag: String, priority: i32) {
        let position = self
            .consumers
            .iter()
            .position(|(_, existing)| *existing < priority)
            .unwrap_or(self.consumers.len());
        self.consumers.insert(position, (tag, priority));
    }

    pub(super) fn remove_consumer(&mut self, tag: &str) {
        self.consumers.retain(|(existing, _)| existing != tag);
    }

    pub(super) fn first_consumer(&self) -> Option<&str> {
        self.consumers.first().map(|(tag, _)| tag.as_str())
    }
}
