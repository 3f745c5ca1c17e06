use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`SwitchboardError`].
pub type SwitchboardResult<T> = Result<T, SwitchboardError>;

/// Top-level error type for the switchboard.
///
/// Every variant except [`SwitchboardError::InvalidTaskTransition`] is local and
/// recoverable: it degrades functionality (a dropped message, a task left
/// pending) without taking the process down.
#[derive(Error, Debug)]
pub enum SwitchboardError {
    /// A component tried to register under an id that is still live.
    #[error("Component already registered: {0}")]
    AlreadyRegistered(String),

    /// No component with this id is registered.
    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    /// The id is empty or reserved (e.g. `broadcast`).
    #[error("Invalid component id: '{0}'")]
    InvalidComponentId(String),

    /// A message was addressed to a receiver the registry does not know.
    #[error("Unknown receiver '{receiver}' for message {message_id}")]
    UnknownReceiver {
        /// The undeliverable message.
        message_id: Uuid,
        /// The receiver named on the message.
        receiver: String,
    },

    /// A message handler returned an error or panicked.
    #[error("Handler for {message_type} failed: {reason}")]
    HandlerFailure {
        /// Display name of the message type whose handler failed.
        message_type: String,
        /// Error text reported by the handler.
        reason: String,
    },

    /// No reply arrived for a request before its deadline.
    #[error("No reply to message {message_id} within {timeout_ms}ms")]
    ReplyTimeout {
        /// The request that went unanswered.
        message_id: Uuid,
        /// How long the caller waited.
        timeout_ms: u64,
    },

    /// A reply waiter is already registered for this message id.
    #[error("A reply waiter already exists for message {0}")]
    DuplicateWaiter(Uuid),

    /// The bounded message queue is full.
    #[error("Message queue full ({capacity} messages)")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// The bus has been shut down and no longer accepts messages.
    #[error("Message bus is closed")]
    BusClosed,

    /// A task state change that the lifecycle does not allow.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTaskTransition {
        /// The task the transition was attempted on.
        task_id: Uuid,
        /// Status the task was in.
        from: String,
        /// Status that was requested.
        to: String,
    },

    /// No registered agent can take the task.
    #[error("No agent available for task {0}")]
    NoAgentAvailable(Uuid),

    /// No task with this id exists.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchboardError {
    /// Whether the caller can carry on after this error.
    ///
    /// An invalid task transition is a contract violation by the caller and
    /// should be treated as a logic error; everything else is recoverable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SwitchboardError::InvalidTaskTransition { .. })
    }
}
