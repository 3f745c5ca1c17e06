//! Core types and error definitions for the switchboard.
//!
//! This crate provides the foundational types shared across all switchboard
//! crates: the error taxonomy, the typed message model routed by the bus, and
//! the runtime configuration.
//!
//! # Main types
//!
//! - [`SwitchboardError`]: Unified error enum for all switchboard subsystems.
//! - [`SwitchboardResult`]: Convenience alias for `Result<T, SwitchboardError>`.
//! - [`Message`]: A routed message with priority, receiver, and typed payload.
//! - [`MessagePayload`]: Sum type of every message body; determines [`MessageType`].
//! - [`Priority`]: Ordered delivery priority (`Low < Normal < High < Critical`).
//! - [`SwitchboardConfig`]: TOML-backed configuration with defaults.

/// Runtime configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Message model.
pub mod message;

pub use config::{BusConfig, DispatchConfig, LearningConfig, LivenessConfig, SwitchboardConfig};
pub use error::{SwitchboardError, SwitchboardResult};
pub use message::{
    ComponentEvent, FeedbackDetails, FeedbackLevel, LearningFeedback, Message, MessagePayload,
    MessageType, Priority, Recipient, TaskAssignment, TaskResult, UnregisterReason, BROADCAST,
};
