//! # Virvel
//!
//! `Virvel` is the event and loop machinery of a message driven BPMN 2.0 engine.
//! Activities talk to each other through an in-process [`Broker`] with topic
//! exchanges and queues, and this crate supplies the parts that react to that traffic.
//!
//! - Catch and throw event definitions: cancel, compensate, escalation, link and timer.
//! - Multi-instance loop characteristics, sequential or parallel in batches.
//! - A timer registry that tracks every pending timeout.
//! - Expressions and services resolved from the [`Environment`].
//!
//! Everything runs on one thread. A publish is delivered to completion before it
//! returns, and a publish from inside a consumer is delivered right after that
//! consumer returns.
//!
//! This is not a complete BPMN engine. Parsing diagrams and running processes is left to the host.
//!
//! ## Example
//!
//! ### Cargo.toml
//! ```toml
//! [dependencies]
//! virvel = "0.1"
//! log = "0.4"
//! pretty_env_logger = "0.5"
//! ```
//! ### main.rs
//!
//! ```
//! use std::rc::Rc;
//! use virvel::{
//!     Activity, Broker, Content, Context, Environment, LoopBehaviour, LoopCharacteristics, Message, Properties,
//!     api::{EXECUTE_COMPLETED, EXECUTE_START, EXECUTION_EXCHANGE},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     pretty_env_logger::init();
//!
//!     let broker = Broker::new();
//!     let activity = Activity::new("task", "bpmn:Task", &broker, Rc::new(Environment::new()), Rc::new(Context::new()));
//!
//!     // Complete every iteration as soon as it starts
//!     let inner = broker.clone();
//!     broker.subscribe_tmp(EXECUTION_EXCHANGE, EXECUTE_START, move |_, message| {
//!         if !message.content.is_root_scope {
//!             let output = message.content.index.unwrap_or_default() * 2;
//!             inner.publish(EXECUTION_EXCHANGE, EXECUTE_COMPLETED, message.content.clone().with_output(output), Properties::default());
//!         }
//!     }, Default::default());
//!
//!     let characteristics = LoopCharacteristics::new(&activity, LoopBehaviour::sequential().cardinality(3));
//!     let content = Content { is_root_scope: true, ..Content::new("task", "task_1") };
//!     characteristics.execute(&Message::new(EXECUTION_EXCHANGE, EXECUTE_START, content))?;
//!     Ok(())
//! }
//! ```

pub mod api;
mod activity;
mod broker;
mod definition;
mod environment;
mod error;
mod loop_characteristics;
mod message;
mod timers;

pub use activity::{Activity, Association, Context, Element};
pub use broker::{Broker, Callback, ConsumeOptions, Pattern, QueueOptions};
pub use definition::{
    COMPENSATE_EXCHANGE, CancelEventDefinition, CompensateEventDefinition, DefinitionState, EscalationEventDefinition,
    EventDefinition, LinkEventDefinition, TimerEventDefinition, parse_duration,
};
pub use environment::{DefaultExpressions, Environment, Expressions, Logger, Services, Settings, is_truthy};
pub use error::{Error, Result};
pub use loop_characteristics::{LoopBehaviour, LoopCharacteristics, LoopType};
pub use message::{Content, Fields, Message, Parent, ParentFrame, Properties, push_parent, shift_parent, unshift_parent};
pub use timers::{MAX_DELAY, RegisteredTimers, Timer, TimerCallback, TimerRef, Timers};
