use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use switchboard_core::{SwitchboardError, SwitchboardResult};
use uuid::Uuid;

/// Lifecycle of a task.
///
/// `Pending -> InProgress -> {Completed, Failed}`, `{Pending, InProgress} ->
/// Cancelled`, and `InProgress -> Pending` when an assignment is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (Pending, Cancelled)
                | (InProgress, Cancelled)
        )
    }

    /// Completed, Failed and Cancelled accept no further changes.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Category derived from a task's description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    #[default]
    CodeGeneration,
    DataAnalysis,
    ApiTesting,
    Documentation,
    Research,
    Automation,
}

impl TaskType {
    /// Classification order: the first matching category wins.
    pub const ALL: [TaskType; 6] = [
        TaskType::CodeGeneration,
        TaskType::DataAnalysis,
        TaskType::ApiTesting,
        TaskType::Documentation,
        TaskType::Research,
        TaskType::Automation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::CodeGeneration => "code-generation",
            TaskType::DataAnalysis => "data-analysis",
            TaskType::ApiTesting => "api-testing",
            TaskType::Documentation => "documentation",
            TaskType::Research => "research",
            TaskType::Automation => "automation",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work tracked by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub user_id: String,
    pub description: String,
    pub task_type: TaskType,
    /// Estimated difficulty in `[0.1, 1.0]`.
    pub complexity: f64,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub status: TaskStatus,
    /// At most one agent at a time; cleared on release.
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub feedback_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Progress reported by the agent, `[0.0, 1.0]`.
    pub progress: f64,
}

impl Task {
    pub fn new(
        user_id: impl Into<String>,
        description: impl Into<String>,
        task_type: TaskType,
        complexity: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            description: description.into(),
            task_type,
            complexity,
            context: HashMap::new(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            assigned_at: None,
            result: None,
            feedback_score: None,
            created_at: now,
            updated_at: now,
            progress: 0.0,
        }
    }

    pub fn with_context(mut self, context: HashMap<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }

    /// Move to `next`, or fail with [`SwitchboardError::InvalidTaskTransition`]
    /// leaving the task untouched.
    pub fn transition_to(&mut self, next: TaskStatus) -> SwitchboardResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SwitchboardError::InvalidTaskTransition {
                task_id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Map a score into `[0.0, 1.0]`. NaN and infinities count as `0.0`.
pub fn unit_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Scoring record the matcher keeps per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    /// Blended from feedback; `[0.0, 1.0]`.
    pub performance_score: f64,
    /// Free-text area of expertise, matched as a substring of task descriptions.
    pub specialization: String,
    pub last_used: Option<DateTime<Utc>>,
}

impl AgentCapability {
    pub fn new(agent_id: impl Into<String>, specialization: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: Vec::new(),
            performance_score: 0.5,
            specialization: specialization.into(),
            last_used: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_performance(mut self, score: f64) -> Self {
        self.performance_score = unit_score(score);
        self
    }
}

/// The matcher's pick for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMatch {
    pub agent_id: String,
    pub score: f64,
}

/// Result of blending one agent's history into its score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningReport {
    pub agent_id: String,
    pub previous_score: f64,
    /// Mean of the recent feedback scores.
    pub historical_score: f64,
    pub new_score: f64,
    pub samples: usize,
}
