use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Receiver sentinel that addresses every subscriber of a message type.
pub const BROADCAST: &str = "broadcast";

/// Delivery priority. Declaration order is the ordering: `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background traffic (heartbeats, feedback).
    Low,
    /// Regular task traffic.
    #[default]
    Normal,
    /// Errors and membership changes.
    High,
    /// Must jump the queue.
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// The closed set of message kinds routed by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Work handed to an agent.
    TaskAssignment,
    /// An agent's answer to an assignment.
    TaskResult,
    /// Scored feedback sent back to an agent.
    LearningFeedback,
    /// A component joined the bus.
    ComponentRegistered,
    /// A component left the bus or was evicted.
    ComponentUnregistered,
    /// Liveness signal from a component.
    Heartbeat,
    /// Free-form request, usually awaiting a reply.
    Request,
    /// Free-form reply to a request.
    Response,
    /// Failure report addressed back to a sender.
    Error,
}

impl MessageType {
    /// All message types, in declaration order.
    pub const ALL: [MessageType; 9] = [
        MessageType::TaskAssignment,
        MessageType::TaskResult,
        MessageType::LearningFeedback,
        MessageType::ComponentRegistered,
        MessageType::ComponentUnregistered,
        MessageType::Heartbeat,
        MessageType::Request,
        MessageType::Response,
        MessageType::Error,
    ];

    /// Priority used when the sender does not pick one.
    pub fn default_priority(&self) -> Priority {
        match self {
            MessageType::Error | MessageType::ComponentUnregistered => Priority::High,
            MessageType::TaskAssignment
            | MessageType::TaskResult
            | MessageType::ComponentRegistered
            | MessageType::Request
            | MessageType::Response => Priority::Normal,
            MessageType::LearningFeedback | MessageType::Heartbeat => Priority::Low,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::TaskAssignment => "task_assignment",
            MessageType::TaskResult => "task_result",
            MessageType::LearningFeedback => "learning_feedback",
            MessageType::ComponentRegistered => "component_registered",
            MessageType::ComponentUnregistered => "component_unregistered",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Error => "error",
        };
        f.write_str(name)
    }
}

/// Who a message is addressed to.
///
/// Serialized as a plain string; the string `"broadcast"` is reserved for
/// [`Recipient::Broadcast`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Recipient {
    /// A single registered component.
    Component(String),
    /// Every subscriber of the message's type, except the sender.
    Broadcast,
}

impl Recipient {
    /// The component id, or `None` for a broadcast.
    pub fn component_id(&self) -> Option<&str> {
        match self {
            Recipient::Component(id) => Some(id),
            Recipient::Broadcast => None,
        }
    }
}

impl From<String> for Recipient {
    fn from(value: String) -> Self {
        if value == BROADCAST {
            Recipient::Broadcast
        } else {
            Recipient::Component(value)
        }
    }
}

impl From<&str> for Recipient {
    fn from(value: &str) -> Self {
        Recipient::from(value.to_string())
    }
}

impl From<Recipient> for String {
    fn from(value: Recipient) -> Self {
        match value {
            Recipient::Component(id) => id,
            Recipient::Broadcast => BROADCAST.to_string(),
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::Component(id) => f.write_str(id),
            Recipient::Broadcast => f.write_str(BROADCAST),
        }
    }
}

/// Work handed to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: Uuid,
    pub description: String,
    /// Classified task type tag, e.g. `code-generation`.
    pub task_type: String,
    pub complexity: f64,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

/// What an agent publishes once it has worked on an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub agent_id: String,
    pub result: String,
    /// Agent's own confidence in the result, in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default)]
    pub insights: Vec<String>,
    /// `false` marks an explicit failure; the task then ends up `Failed`.
    #[serde(default = "default_success")]
    pub success: bool,
}

fn default_success() -> bool {
    true
}

/// Coarse rating bucket used in feedback summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackLevel {
    Excellent,
    Good,
    NeedsImprovement,
}

impl FeedbackLevel {
    /// Bucket a score in `[0, 1]`.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            FeedbackLevel::Excellent
        } else if score >= 0.5 {
            FeedbackLevel::Good
        } else {
            FeedbackLevel::NeedsImprovement
        }
    }
}

/// Accuracy/speed/clarity summary attached to [`LearningFeedback`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackDetails {
    pub accuracy: FeedbackLevel,
    pub speed: FeedbackLevel,
    pub clarity: FeedbackLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl FeedbackDetails {
    /// Derive all three buckets from a single feedback score.
    pub fn from_score(score: f64) -> Self {
        let level = FeedbackLevel::from_score(score);
        Self {
            accuracy: level,
            speed: level,
            clarity: level,
            comment: None,
        }
    }
}

/// Feedback for an agent about one finished task. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningFeedback {
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub feedback_score: f64,
    pub details: FeedbackDetails,
}

/// Why a component left the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnregisterReason {
    /// The component (or an operator) asked to leave.
    Explicit,
    /// The liveness monitor evicted it.
    LivenessTimeout,
}

/// Membership change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentEvent {
    pub component_id: String,
    pub component_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<UnregisterReason>,
}

/// Typed message body. The variant determines the [`MessageType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    TaskAssignment(TaskAssignment),
    TaskResult(TaskResult),
    LearningFeedback(LearningFeedback),
    ComponentRegistered(ComponentEvent),
    ComponentUnregistered(ComponentEvent),
    Heartbeat,
    Request { body: serde_json::Value },
    Response { body: serde_json::Value },
    Error { error: String },
}

impl MessagePayload {
    /// The message type this payload travels as.
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::TaskAssignment(_) => MessageType::TaskAssignment,
            MessagePayload::TaskResult(_) => MessageType::TaskResult,
            MessagePayload::LearningFeedback(_) => MessageType::LearningFeedback,
            MessagePayload::ComponentRegistered(_) => MessageType::ComponentRegistered,
            MessagePayload::ComponentUnregistered(_) => MessageType::ComponentUnregistered,
            MessagePayload::Heartbeat => MessageType::Heartbeat,
            MessagePayload::Request { .. } => MessageType::Request,
            MessagePayload::Response { .. } => MessageType::Response,
            MessagePayload::Error { .. } => MessageType::Error,
        }
    }
}

/// A message routed by the bus.
///
/// Built by the sender, then owned by the bus once submitted. The bus only
/// touches `context` (enrichment at enqueue time) and, for broadcast fan-out,
/// stamps a fresh id and receiver on each per-subscriber copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    pub priority: Priority,
    /// Id of the sending component.
    pub sender: String,
    pub receiver: Recipient,
    pub payload: MessagePayload,
    /// Arbitrary key-value context, enriched by the bus on enqueue.
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Id of the message this one answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
}

impl Message {
    /// Creates a message at the payload type's default priority.
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<Recipient>,
        payload: MessagePayload,
    ) -> Self {
        let priority = payload.message_type().default_priority();
        Self {
            id: Uuid::new_v4(),
            priority,
            sender: sender.into(),
            receiver: receiver.into(),
            payload,
            context: HashMap::new(),
            timestamp: Utc::now(),
            correlation_id: None,
            reply_to: None,
        }
    }

    /// Creates a message addressed to every subscriber of its type.
    pub fn broadcast(sender: impl Into<String>, payload: MessagePayload) -> Self {
        Self::new(sender, Recipient::Broadcast, payload)
    }

    /// Creates a reply to `original`, addressed to its sender.
    ///
    /// Keeps the original priority and correlation id.
    pub fn reply(original: &Message, sender: impl Into<String>, payload: MessagePayload) -> Self {
        let mut reply = Self::new(sender, original.sender.clone(), payload);
        reply.priority = original.priority;
        reply.correlation_id = original.correlation_id.clone();
        reply.reply_to = Some(original.id);
        reply
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn in_reply_to(mut self, message_id: Uuid) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    /// The message type, derived from the payload.
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver == Recipient::Broadcast
    }

    /// Copy of this message for one broadcast subscriber: new id, same
    /// payload, context, and sender.
    pub fn copy_for(&self, subscriber: &str) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        copy.receiver = Recipient::Component(subscriber.to_string());
        copy
    }
}
