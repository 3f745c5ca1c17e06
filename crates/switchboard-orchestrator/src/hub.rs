use crate::dispatcher::{DispatcherStatus, TaskDispatcher};
use crate::learning::LearningLoop;
use crate::types::{AgentCapability, LearningReport, Task, TaskStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use switchboard_bus::{
    BusStatus, ComponentRegistration, ComponentRegistry, ComponentStatus, LivenessMonitor, Mailbox,
    MessageBus, MessageHandler,
};
use switchboard_core::{
    FeedbackDetails, LearningFeedback, Message, MessagePayload, MessageType, SwitchboardConfig,
    SwitchboardError, SwitchboardResult, TaskAssignment,
};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Component id of the hub on the bus.
pub const HUB_ID: &str = "brain_hub";
/// Component id of the dispatcher on the bus; agents address results here.
pub const DISPATCHER_ID: &str = "task_dispatcher";
/// Component type agents are registered under.
pub const AGENT_COMPONENT_TYPE: &str = "agent";

/// The orchestrator.
///
/// Wires the dispatcher onto the bus and drives the task loop:
/// `start_session` classifies, matches, assigns, and sends a `TaskAssignment`;
/// a `TaskResult` from the agent is recorded and answered with
/// `LearningFeedback`; a periodic learning cycle re-weights agent scores.
pub struct BrainHub {
    config: SwitchboardConfig,
    bus: Arc<MessageBus>,
    dispatcher: Arc<RwLock<TaskDispatcher>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BrainHub {
    /// Build the bus and dispatcher, register the hub's own components, and
    /// install the result and agent-loss handlers. Background loops are not
    /// running until [`start`](Self::start).
    pub async fn new(config: SwitchboardConfig) -> SwitchboardResult<Self> {
        config.validate()?;
        let registry = Arc::new(ComponentRegistry::new(config.liveness.timeout()));
        let bus = Arc::new(MessageBus::new(config.bus.clone(), registry));
        let dispatcher = Arc::new(RwLock::new(TaskDispatcher::new(
            &config.dispatch,
            config.learning.history_window,
        )));

        bus.register(ComponentRegistration::new(HUB_ID, "orchestrator"))
            .await?;
        bus.register(ComponentRegistration::new(DISPATCHER_ID, "dispatcher"))
            .await?;
        bus.subscribe(DISPATCHER_ID, MessageType::TaskResult).await?;
        for message_type in [
            MessageType::TaskAssignment,
            MessageType::LearningFeedback,
            MessageType::ComponentUnregistered,
        ] {
            bus.subscribe(HUB_ID, message_type).await?;
        }

        bus.set_handler(
            MessageType::TaskResult,
            Arc::new(ResultHandler {
                dispatcher: dispatcher.clone(),
                registry: bus.registry().clone(),
            }),
        )
        .await;
        bus.set_handler(
            MessageType::ComponentUnregistered,
            Arc::new(AgentLossHandler {
                dispatcher: dispatcher.clone(),
                registry: bus.registry().clone(),
            }),
        )
        .await;

        let (shutdown_tx, _) = watch::channel(false);
        info!(
            liveness_timeout_secs = config.liveness.timeout_secs,
            learning_interval_secs = config.learning.interval_secs,
            "Brain hub initialized"
        );
        Ok(Self {
            config,
            bus,
            dispatcher,
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Get a reference to the message bus.
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Get a reference to the dispatcher.
    pub fn dispatcher(&self) -> &Arc<RwLock<TaskDispatcher>> {
        &self.dispatcher
    }

    pub fn config(&self) -> &SwitchboardConfig {
        &self.config
    }

    // --- Agents ---

    /// Connect an agent to the bus and add it to the matching pool.
    ///
    /// The returned mailbox receives the agent's `TaskAssignment`s and
    /// `LearningFeedback`. Pending tasks are re-dispatched afterwards.
    pub async fn register_agent(&self, agent: AgentCapability) -> SwitchboardResult<Mailbox> {
        let registration = ComponentRegistration::new(&agent.agent_id, AGENT_COMPONENT_TYPE)
            .with_capabilities(agent.capabilities.iter().cloned())
            .with_metadata(
                "specialization",
                serde_json::json!(agent.specialization),
            )
            .with_metadata(
                "performance_score",
                serde_json::json!(agent.performance_score),
            );
        let mailbox = self.bus.connect(registration).await?;
        self.dispatcher.write().await.register_agent(agent);

        let dispatched = self.dispatch_pending().await?;
        if dispatched > 0 {
            info!(agent_id = %mailbox.component_id(), dispatched, "Pending tasks picked up by new agent");
        }
        Ok(mailbox)
    }

    /// Disconnect an agent. Its in-flight tasks are released and
    /// re-dispatched by the agent-loss handler.
    pub async fn unregister_agent(&self, agent_id: &str) -> SwitchboardResult<()> {
        self.bus.disconnect(agent_id).await?;
        Ok(())
    }

    // --- Sessions ---

    /// Create a task for `user_id` and hand it to the best agent.
    ///
    /// With no agent available the task stays Pending and is picked up by a
    /// later [`dispatch_pending`](Self::dispatch_pending).
    pub async fn start_session(
        &self,
        user_id: &str,
        goals: &str,
        context: HashMap<String, serde_json::Value>,
    ) -> SwitchboardResult<Uuid> {
        let (task_id, assignment) = {
            let mut dispatcher = self.dispatcher.write().await;
            let task_id = dispatcher.create_task(user_id, goals, context);
            match dispatcher.dispatch(task_id) {
                Ok((pick, task)) => {
                    sync_load(self.bus.registry(), &dispatcher, &pick.agent_id).await;
                    (task_id, Some(assignment_message(&task, &pick.agent_id)))
                }
                Err(SwitchboardError::NoAgentAvailable(_)) => {
                    warn!(task_id = %task_id, user_id, "No agent available, task left pending");
                    (task_id, None)
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(message) = assignment {
            self.send_assignment(task_id, message).await?;
        }
        Ok(task_id)
    }

    /// Try to assign every Pending task, oldest first. Returns how many were
    /// dispatched.
    pub async fn dispatch_pending(&self) -> SwitchboardResult<usize> {
        let assignments = {
            let mut dispatcher = self.dispatcher.write().await;
            let mut assignments = Vec::new();
            for task_id in dispatcher.pending_tasks() {
                match dispatcher.dispatch(task_id) {
                    Ok((pick, task)) => {
                        sync_load(self.bus.registry(), &dispatcher, &pick.agent_id).await;
                        assignments.push((task_id, assignment_message(&task, &pick.agent_id)));
                    }
                    Err(SwitchboardError::NoAgentAvailable(_)) => break,
                    Err(e) => warn!(task_id = %task_id, error = %e, "Dispatch failed"),
                }
            }
            assignments
        };

        let count = assignments.len();
        for (task_id, message) in assignments {
            self.send_assignment(task_id, message).await?;
        }
        Ok(count)
    }

    async fn send_assignment(&self, task_id: Uuid, message: Message) -> SwitchboardResult<()> {
        if let Err(e) = self.bus.send(message).await {
            warn!(task_id = %task_id, error = %e, "Could not enqueue assignment, releasing task");
            let mut dispatcher = self.dispatcher.write().await;
            let holder = dispatcher
                .get_task(task_id)
                .ok()
                .and_then(|task| task.assigned_agent.clone());
            if let Err(release_err) = dispatcher.release(task_id) {
                warn!(task_id = %task_id, error = %release_err, "Release after failed send also failed");
            }
            if let Some(agent_id) = holder {
                sync_load(self.bus.registry(), &dispatcher, &agent_id).await;
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> SwitchboardResult<Task> {
        let mut dispatcher = self.dispatcher.write().await;
        let task = dispatcher.cancel(task_id)?;
        if let Some(agent_id) = task.assigned_agent.as_deref() {
            sync_load(self.bus.registry(), &dispatcher, agent_id).await;
        }
        Ok(task)
    }

    pub async fn update_progress(&self, task_id: Uuid, progress: f64) -> SwitchboardResult<Task> {
        self.dispatcher
            .write()
            .await
            .update_progress(task_id, progress)
    }

    // --- Learning ---

    /// Blend recent feedback into every agent's score, then retry pending
    /// tasks with the updated scores.
    pub async fn run_learning_cycle(&self) -> SwitchboardResult<Vec<LearningReport>> {
        let reports = self
            .dispatcher
            .write()
            .await
            .apply_learning(self.config.learning.current_weight);
        for report in &reports {
            info!(
                agent_id = %report.agent_id,
                previous = report.previous_score,
                historical = report.historical_score,
                current = report.new_score,
                samples = report.samples,
                "Agent score re-weighted"
            );
        }
        let dispatched = self.dispatch_pending().await?;
        info!(agents = reports.len(), dispatched, "Learning cycle complete");
        Ok(reports)
    }

    // --- Status ---

    pub async fn channel_status(&self) -> BusStatus {
        self.bus.status().await
    }

    pub async fn dispatcher_status(&self) -> DispatcherStatus {
        self.dispatcher.read().await.status()
    }

    pub async fn task_status(&self, task_id: Uuid) -> SwitchboardResult<Task> {
        self.dispatcher.read().await.get_task(task_id).cloned()
    }

    pub async fn user_tasks(&self, user_id: &str) -> Vec<Task> {
        self.dispatcher.read().await.user_tasks(user_id)
    }

    // --- Lifecycle ---

    /// Spawn the delivery, liveness, learning and keepalive loops.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            warn!("Brain hub already started");
            return;
        }
        workers.push(self.bus.spawn());
        workers.push(
            LivenessMonitor::from_config(self.bus.clone(), &self.config.liveness)
                .start(self.shutdown_tx.subscribe()),
        );
        workers.push(
            LearningLoop::from_config(&self.config.learning)
                .start(Arc::clone(self), self.shutdown_tx.subscribe()),
        );
        workers.push(self.spawn_keepalive());
        info!(loops = workers.len(), "Brain hub started");
    }

    /// The hub's own components heartbeat so the liveness monitor leaves them
    /// alone.
    fn spawn_keepalive(&self) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let period = self.config.liveness.check_interval();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for id in [HUB_ID, DISPATCHER_ID] {
                            bus.heartbeat(id).await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Stop every background loop, close the bus, and wait for the loops to
    /// finish. Undelivered messages are discarded.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.bus.close().await;
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
        info!("Brain hub stopped");
    }
}

/// Build the `TaskAssignment` message for an assigned task.
pub fn assignment_message(task: &Task, agent_id: &str) -> Message {
    Message::new(
        HUB_ID,
        agent_id,
        MessagePayload::TaskAssignment(TaskAssignment {
            task_id: task.id,
            description: task.description.clone(),
            task_type: task.task_type.as_str().to_string(),
            complexity: task.complexity,
            context: task.context.clone(),
        }),
    )
    .with_correlation_id(task.id.to_string())
    .with_context("user_id", serde_json::json!(task.user_id))
}

/// Records `TaskResult`s and answers the agent with `LearningFeedback`.
struct ResultHandler {
    dispatcher: Arc<RwLock<TaskDispatcher>>,
    registry: Arc<ComponentRegistry>,
}

#[async_trait]
impl MessageHandler for ResultHandler {
    async fn handle(&self, message: &Message) -> SwitchboardResult<Vec<Message>> {
        let MessagePayload::TaskResult(result) = &message.payload else {
            return Ok(Vec::new());
        };

        let task = {
            let mut dispatcher = self.dispatcher.write().await;
            let current = dispatcher.get_task(result.task_id)?;
            if current.status == TaskStatus::Cancelled {
                info!(
                    task_id = %result.task_id,
                    agent_id = %result.agent_id,
                    "Ignoring result for a cancelled task"
                );
                return Ok(Vec::new());
            }
            let holder = current.assigned_agent.clone();
            if holder.as_deref() != Some(result.agent_id.as_str()) {
                warn!(
                    task_id = %result.task_id,
                    agent_id = %result.agent_id,
                    holder = ?holder,
                    "Ignoring result from an agent that does not hold the task"
                );
                return Ok(Vec::new());
            }
            let recorded = serde_json::json!({
                "agent_id": result.agent_id,
                "result": result.result,
                "confidence": result.confidence,
                "processing_time_ms": result.processing_time_ms,
                "insights": result.insights,
            });
            let task = dispatcher.record_result(
                result.task_id,
                recorded,
                result.confidence,
                result.success,
            )?;
            sync_load(&self.registry, &dispatcher, &result.agent_id).await;
            task
        };

        let score = task.feedback_score.unwrap_or_default();
        let feedback = LearningFeedback {
            task_id: task.id,
            session_id: Some(task.user_id.clone()),
            feedback_score: score,
            details: FeedbackDetails::from_score(score),
        };
        let reply = Message::reply(message, HUB_ID, MessagePayload::LearningFeedback(feedback))
            .with_priority(MessageType::LearningFeedback.default_priority())
            .with_correlation_id(task.id.to_string());
        Ok(vec![reply])
    }
}

/// Pulls a lost agent out of matching and re-dispatches its in-flight tasks.
///
/// When the id is already registered again by the time the event is handled,
/// the new instance stays in the pool and only the tasks handed to the old
/// instance are released.
struct AgentLossHandler {
    dispatcher: Arc<RwLock<TaskDispatcher>>,
    registry: Arc<ComponentRegistry>,
}

#[async_trait]
impl MessageHandler for AgentLossHandler {
    async fn handle(&self, message: &Message) -> SwitchboardResult<Vec<Message>> {
        let MessagePayload::ComponentUnregistered(event) = &message.payload else {
            return Ok(Vec::new());
        };
        let replacement = self.registry.get(&event.component_id).await.ok();

        let mut dispatcher = self.dispatcher.write().await;
        let orphaned: Vec<Uuid> = match &replacement {
            None => {
                if dispatcher.unregister_agent(&event.component_id).is_none() {
                    return Ok(Vec::new());
                }
                dispatcher.tasks_for_agent(&event.component_id)
            }
            Some(current) => dispatcher
                .tasks_for_agent(&event.component_id)
                .into_iter()
                .filter(|id| {
                    dispatcher
                        .get_task(*id)
                        .ok()
                        .and_then(|task| task.assigned_at)
                        .is_some_and(|at| at < current.registered_at)
                })
                .collect(),
        };
        if orphaned.is_empty() && replacement.is_some() {
            return Ok(Vec::new());
        }
        warn!(
            agent_id = %event.component_id,
            reason = ?event.reason,
            replaced = replacement.is_some(),
            in_flight = orphaned.len(),
            "Agent lost"
        );

        let mut assignments = Vec::new();
        for task_id in orphaned {
            dispatcher.release(task_id)?;
            match dispatcher.dispatch(task_id) {
                Ok((pick, task)) => {
                    info!(task_id = %task_id, agent_id = %pick.agent_id, "Task re-dispatched");
                    sync_load(&self.registry, &dispatcher, &pick.agent_id).await;
                    assignments.push(assignment_message(&task, &pick.agent_id));
                }
                Err(SwitchboardError::NoAgentAvailable(_)) => {
                    info!(task_id = %task_id, "No agent left, task back to pending");
                }
                Err(e) => return Err(e),
            }
        }
        if replacement.is_some() {
            sync_load(&self.registry, &dispatcher, &event.component_id).await;
        }
        Ok(assignments)
    }
}

/// Mirror an agent's load onto its registry entry: `Busy` while it holds
/// in-progress tasks, `Idle` otherwise.
async fn sync_load(registry: &ComponentRegistry, dispatcher: &TaskDispatcher, agent_id: &str) {
    let status = if dispatcher.tasks_for_agent(agent_id).is_empty() {
        ComponentStatus::Idle
    } else {
        ComponentStatus::Busy
    };
    if let Err(e) = registry.set_status(agent_id, status).await {
        debug!(agent_id, error = %e, "Agent status not updated");
    }
}
