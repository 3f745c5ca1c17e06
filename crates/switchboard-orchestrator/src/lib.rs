//! Task dispatch and orchestration on top of the switchboard bus.
//!
//! Turns free-text requests into tracked tasks, assigns each to the
//! best-scoring agent, records results, and feeds them back into agent scores.
//!
//! # Main types
//!
//! - [`BrainHub`]: Wires agents and the dispatcher onto the bus and runs the background loops.
//! - [`TaskDispatcher`]: Task store, agent pool, and task state machine.
//! - [`TaskClassifier`]: Derives task type and complexity from a description.
//! - [`AgentMatcher`]: Scores agents against a task.
//! - [`LearningLoop`]: Periodic score re-weighting from recent feedback.

/// Keyword-based task classification.
pub mod classifier;
/// Task store and lifecycle.
pub mod dispatcher;
/// The Brain Hub orchestrator.
pub mod hub;
/// Periodic learning cycle.
pub mod learning;
/// Agent scoring.
pub mod matcher;
/// Shared task and agent types.
pub mod types;

pub use classifier::{Classification, TaskClassifier, LEVEL_KEY};
pub use dispatcher::{DispatcherStatus, TaskDispatcher};
pub use hub::{assignment_message, BrainHub, AGENT_COMPONENT_TYPE, DISPATCHER_ID, HUB_ID};
pub use learning::LearningLoop;
pub use matcher::AgentMatcher;
pub use types::{unit_score, AgentCapability, AgentMatch, LearningReport, Task, TaskStatus, TaskType};
