//! Priority message bus with a component registry and liveness monitoring.
//!
//! Components register with the bus, subscribe to message types, and exchange
//! typed [`Message`](switchboard_core::Message)s. Delivery is strictly by
//! priority, FIFO within a priority, with optional request/reply correlation.
//!
//! # Main types
//!
//! - [`MessageBus`]: Bounded priority queue plus the single delivery loop.
//! - [`ComponentRegistry`]: Known components, their capabilities and last heartbeat.
//! - [`LivenessMonitor`]: Background sweep that evicts silent components.
//! - [`MessageHandler`]: Per-type hook run by the delivery loop before routing.
//! - [`Mailbox`]: A connected component's inbox.

/// The bus and its delivery loop.
pub mod bus;
/// Message handler trait and closure adapter.
pub mod handler;
/// Periodic eviction of stale components.
pub mod liveness;
/// Per-component inboxes.
pub mod mailbox;
/// Priority queue of undelivered messages.
pub mod queue;
/// Component registry.
pub mod registry;

pub use bus::{BusStatus, MessageBus, BUS_ID};
pub use handler::{handler_fn, FnHandler, MessageHandler};
pub use liveness::LivenessMonitor;
pub use mailbox::Mailbox;
pub use queue::MessageQueue;
pub use registry::{Component, ComponentRegistration, ComponentRegistry, ComponentStatus};
