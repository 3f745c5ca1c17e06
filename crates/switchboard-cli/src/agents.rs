use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_bus::Mailbox;
use switchboard_core::{Message, MessagePayload, TaskAssignment, TaskResult};
use switchboard_orchestrator::{AgentCapability, BrainHub, TaskType, DISPATCHER_ID};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Stand-in agents used by `switchboard run`, one per task type.
pub struct SimulatedAgent {
    pub id: String,
    pub specialization: &'static str,
    pub task_type: TaskType,
}

impl SimulatedAgent {
    pub fn roster() -> Vec<SimulatedAgent> {
        TaskType::ALL
            .into_iter()
            .map(|task_type| SimulatedAgent {
                id: format!("sim-{task_type}"),
                specialization: specialization_for(task_type),
                task_type,
            })
            .collect()
    }

    pub fn capability(&self) -> AgentCapability {
        AgentCapability::new(&self.id, self.specialization)
            .with_capabilities([self.task_type.as_str()])
            .with_performance(0.6)
    }
}

fn specialization_for(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::CodeGeneration => "code",
        TaskType::DataAnalysis => "data",
        TaskType::ApiTesting => "api",
        TaskType::Documentation => "document",
        TaskType::Research => "research",
        TaskType::Automation => "automat",
    }
}

/// Harder tasks take longer and come back with less confidence.
pub fn simulated_confidence(complexity: f64) -> f64 {
    (0.95 - 0.3 * complexity).clamp(0.0, 1.0)
}

fn simulated_work(complexity: f64) -> Duration {
    Duration::from_millis((50.0 + 200.0 * complexity.clamp(0.0, 1.0)) as u64)
}

/// Run an agent until its mailbox closes: every assignment is answered with a
/// `TaskResult` addressed to the dispatcher.
pub fn spawn(hub: Arc<BrainHub>, mut mailbox: Mailbox) -> JoinHandle<()> {
    tokio::spawn(async move {
        let agent_id = mailbox.component_id().to_string();
        while let Some(message) = mailbox.recv().await {
            hub.bus().heartbeat(&agent_id).await;
            match message.payload {
                MessagePayload::TaskAssignment(assignment) => {
                    let result = work(&agent_id, &assignment).await;
                    if let Err(e) = hub.bus().send(result).await {
                        warn!(agent_id = %agent_id, error = %e, "Could not publish result");
                        break;
                    }
                }
                MessagePayload::LearningFeedback(feedback) => {
                    debug!(
                        agent_id = %agent_id,
                        task_id = %feedback.task_id,
                        score = feedback.feedback_score,
                        "Feedback received"
                    );
                }
                _ => {}
            }
        }
        info!(agent_id = %agent_id, "Simulated agent stopped");
    })
}

async fn work(agent_id: &str, assignment: &TaskAssignment) -> Message {
    let started = Instant::now();
    tokio::time::sleep(simulated_work(assignment.complexity)).await;
    Message::new(
        agent_id,
        DISPATCHER_ID,
        MessagePayload::TaskResult(TaskResult {
            task_id: assignment.task_id,
            agent_id: agent_id.to_string(),
            result: format!("[{agent_id}] {}: {}", assignment.task_type, assignment.description),
            confidence: simulated_confidence(assignment.complexity),
            processing_time_ms: started.elapsed().as_millis() as u64,
            insights: vec![format!("complexity {:.2}", assignment.complexity)],
            success: true,
        }),
    )
    .with_correlation_id(assignment.task_id.to_string())
}
