use crate::classifier::TaskClassifier;
use crate::matcher::AgentMatcher;
use crate::types::{unit_score, AgentCapability, AgentMatch, LearningReport, Task, TaskStatus};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use switchboard_core::{DispatchConfig, SwitchboardError, SwitchboardResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Snapshot of the dispatcher for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub total_tasks: usize,
    pub tasks_by_status: BTreeMap<String, usize>,
    /// Completed tasks whose feedback fell below the success threshold.
    pub below_threshold: usize,
    pub agents: Vec<AgentCapability>,
    pub average_performance: f64,
}

/// Task store and agent pool.
///
/// Owns every [`Task`] record and every [`AgentCapability`]. All task state
/// changes go through [`Task::transition_to`], so invalid transitions are
/// rejected without touching the record.
pub struct TaskDispatcher {
    tasks: HashMap<Uuid, Task>,
    /// Kept in registration order; the matcher breaks ties by position.
    agents: Vec<AgentCapability>,
    /// Recent feedback scores per agent, newest last.
    outcomes: HashMap<String, VecDeque<f64>>,
    classifier: TaskClassifier,
    matcher: AgentMatcher,
    success_threshold: f64,
    history_window: usize,
}

impl TaskDispatcher {
    pub fn new(config: &DispatchConfig, history_window: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            agents: Vec::new(),
            outcomes: HashMap::new(),
            classifier: TaskClassifier::from_config(config),
            matcher: AgentMatcher::from_config(config),
            success_threshold: config.success_threshold,
            history_window,
        }
    }

    pub fn classifier(&self) -> &TaskClassifier {
        &self.classifier
    }

    // --- Tasks ---

    /// Create a Pending task, deriving its type and complexity.
    pub fn create_task(
        &mut self,
        user_id: &str,
        description: &str,
        context: HashMap<String, serde_json::Value>,
    ) -> Uuid {
        let classification = self.classifier.classify(description, &context);
        let task = Task::new(
            user_id,
            description,
            classification.task_type,
            classification.complexity,
        )
        .with_context(context);
        let id = task.id;
        info!(
            task_id = %id,
            user_id,
            task_type = %task.task_type,
            complexity = task.complexity,
            "Task created"
        );
        self.tasks.insert(id, task);
        id
    }

    pub fn get_task(&self, task_id: Uuid) -> SwitchboardResult<&Task> {
        self.tasks
            .get(&task_id)
            .ok_or(SwitchboardError::TaskNotFound(task_id))
    }

    fn task_mut(&mut self, task_id: Uuid) -> SwitchboardResult<&mut Task> {
        self.tasks
            .get_mut(&task_id)
            .ok_or(SwitchboardError::TaskNotFound(task_id))
    }

    /// A user's tasks, oldest first.
    pub fn user_tasks(&self, user_id: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Ids of Pending tasks, oldest first.
    pub fn pending_tasks(&self) -> Vec<Uuid> {
        let mut pending: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by_key(|t| t.created_at);
        pending.into_iter().map(|t| t.id).collect()
    }

    /// Ids of the tasks an agent is currently working on.
    pub fn tasks_for_agent(&self, agent_id: &str) -> Vec<Uuid> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::InProgress && t.assigned_agent.as_deref() == Some(agent_id)
            })
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks.into_iter().map(|t| t.id).collect()
    }

    // --- Agents ---

    /// Add an agent to the matching pool. A record with the same id is
    /// replaced in place and keeps its tie-break position.
    pub fn register_agent(&mut self, mut agent: AgentCapability) {
        agent.performance_score = unit_score(agent.performance_score);
        match self.agents.iter_mut().find(|a| a.agent_id == agent.agent_id) {
            Some(existing) => {
                info!(agent_id = %agent.agent_id, "Replacing agent capability record");
                *existing = agent;
            }
            None => {
                info!(
                    agent_id = %agent.agent_id,
                    specialization = %agent.specialization,
                    performance = agent.performance_score,
                    "Agent registered for dispatch"
                );
                self.agents.push(agent);
            }
        }
    }

    /// Remove an agent from matching. Its tasks are left as they are.
    pub fn unregister_agent(&mut self, agent_id: &str) -> Option<AgentCapability> {
        let position = self.agents.iter().position(|a| a.agent_id == agent_id)?;
        self.outcomes.remove(agent_id);
        Some(self.agents.remove(position))
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentCapability> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    /// Agents in registration order.
    pub fn agents(&self) -> &[AgentCapability] {
        &self.agents
    }

    // --- Matching and lifecycle ---

    /// Best agent for a task, or `None` when the pool is empty.
    pub fn match_agent(&self, task_id: Uuid) -> SwitchboardResult<Option<AgentMatch>> {
        let task = self.get_task(task_id)?;
        Ok(self.matcher.best_match(&self.agents, task))
    }

    /// Pending -> InProgress with `agent_id` as the assignee.
    pub fn assign(&mut self, task_id: Uuid, agent_id: &str) -> SwitchboardResult<Task> {
        if self.agent(agent_id).is_none() {
            return Err(SwitchboardError::ComponentNotFound(agent_id.to_string()));
        }
        let now = Utc::now();
        let task = self.task_mut(task_id)?;
        task.transition_to(TaskStatus::InProgress)?;
        task.assigned_agent = Some(agent_id.to_string());
        task.assigned_at = Some(now);
        task.progress = 0.0;
        let assigned = task.clone();

        if let Some(agent) = self.agents.iter_mut().find(|a| a.agent_id == agent_id) {
            agent.last_used = Some(now);
        }
        info!(task_id = %task_id, agent_id, "Task assigned");
        Ok(assigned)
    }

    /// Match and assign in one step. Fails with
    /// [`SwitchboardError::NoAgentAvailable`] when the pool is empty, leaving
    /// the task Pending.
    pub fn dispatch(&mut self, task_id: Uuid) -> SwitchboardResult<(AgentMatch, Task)> {
        let pick = self
            .match_agent(task_id)?
            .ok_or(SwitchboardError::NoAgentAvailable(task_id))?;
        let task = self.assign(task_id, &pick.agent_id)?;
        debug!(task_id = %task_id, agent_id = %pick.agent_id, score = pick.score, "Dispatched");
        Ok((pick, task))
    }

    /// Record an agent's result.
    ///
    /// `success == false` fails the task; otherwise it completes regardless of
    /// the score. The assignee's performance becomes the mean of its old score
    /// and `feedback_score`.
    pub fn record_result(
        &mut self,
        task_id: Uuid,
        result: serde_json::Value,
        feedback_score: f64,
        success: bool,
    ) -> SwitchboardResult<Task> {
        if !feedback_score.is_finite() {
            warn!(task_id = %task_id, feedback_score, "Non-finite feedback score, recording 0.0");
        }
        let feedback_score = unit_score(feedback_score);
        let task = self.task_mut(task_id)?;
        let next = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        task.transition_to(next)?;
        task.result = Some(result);
        task.feedback_score = Some(feedback_score);
        if success {
            task.progress = 1.0;
        }
        let recorded = task.clone();

        if let Some(agent_id) = recorded.assigned_agent.as_deref() {
            self.update_performance(agent_id, feedback_score);
        }

        if success && feedback_score <= self.success_threshold {
            warn!(
                task_id = %task_id,
                feedback_score,
                threshold = self.success_threshold,
                "Task completed below the success threshold"
            );
        } else {
            info!(task_id = %task_id, status = %recorded.status, feedback_score, "Task result recorded");
        }
        Ok(recorded)
    }

    fn update_performance(&mut self, agent_id: &str, feedback_score: f64) {
        let Some(agent) = self.agents.iter_mut().find(|a| a.agent_id == agent_id) else {
            debug!(agent_id, "Result from an agent no longer in the pool");
            return;
        };
        let previous = agent.performance_score;
        agent.performance_score = unit_score((previous + feedback_score) / 2.0);
        debug!(
            agent_id,
            previous,
            current = agent.performance_score,
            "Agent performance updated"
        );

        let window = self.history_window.max(1);
        let history = self.outcomes.entry(agent_id.to_string()).or_default();
        history.push_back(feedback_score);
        while history.len() > window {
            history.pop_front();
        }
    }

    pub fn cancel(&mut self, task_id: Uuid) -> SwitchboardResult<Task> {
        let task = self.task_mut(task_id)?;
        task.transition_to(TaskStatus::Cancelled)?;
        info!(task_id = %task_id, "Task cancelled");
        Ok(task.clone())
    }

    /// InProgress -> Pending, clearing the assignment so the task can be
    /// dispatched again.
    pub fn release(&mut self, task_id: Uuid) -> SwitchboardResult<Task> {
        let task = self.task_mut(task_id)?;
        task.transition_to(TaskStatus::Pending)?;
        let previous = task.assigned_agent.take();
        task.assigned_at = None;
        task.progress = 0.0;
        info!(task_id = %task_id, previous_agent = ?previous, "Task released");
        Ok(task.clone())
    }

    /// Report progress on an InProgress task; clamped to `[0, 1]`.
    pub fn update_progress(&mut self, task_id: Uuid, progress: f64) -> SwitchboardResult<Task> {
        let task = self.task_mut(task_id)?;
        if task.status != TaskStatus::InProgress {
            return Err(SwitchboardError::InvalidTaskTransition {
                task_id,
                from: task.status.to_string(),
                to: TaskStatus::InProgress.to_string(),
            });
        }
        task.progress = progress.clamp(0.0, 1.0);
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    // --- Learning ---

    /// Blend each agent's recent feedback into its score:
    /// `new = w * current + (1 - w) * mean(recent)`. Agents without feedback
    /// are left alone.
    pub fn apply_learning(&mut self, current_weight: f64) -> Vec<LearningReport> {
        let weight = current_weight.clamp(0.0, 1.0);
        let mut reports = Vec::new();
        for agent in &mut self.agents {
            let Some(history) = self.outcomes.get(&agent.agent_id) else {
                continue;
            };
            if history.is_empty() {
                continue;
            }
            let historical = history.iter().sum::<f64>() / history.len() as f64;
            let previous = agent.performance_score;
            agent.performance_score = unit_score(weight * previous + (1.0 - weight) * historical);
            reports.push(LearningReport {
                agent_id: agent.agent_id.clone(),
                previous_score: previous,
                historical_score: historical,
                new_score: agent.performance_score,
                samples: history.len(),
            });
        }
        reports
    }

    pub fn status(&self) -> DispatcherStatus {
        let mut tasks_by_status: BTreeMap<String, usize> = TaskStatus::ALL
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();
        for task in self.tasks.values() {
            *tasks_by_status.entry(task.status.to_string()).or_default() += 1;
        }
        let below_threshold = self
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Completed
                    && t.feedback_score
                        .is_some_and(|score| score <= self.success_threshold)
            })
            .count();
        let average_performance = if self.agents.is_empty() {
            0.0
        } else {
            self.agents.iter().map(|a| a.performance_score).sum::<f64>() / self.agents.len() as f64
        };
        DispatcherStatus {
            total_tasks: self.tasks.len(),
            tasks_by_status,
            below_threshold,
            agents: self.agents.clone(),
            average_performance,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::TaskType;

    fn dispatcher() -> TaskDispatcher {
        TaskDispatcher::new(&DispatchConfig::default(), 50)
    }

    fn create(d: &mut TaskDispatcher, description: &str) -> Uuid {
        d.create_task("alice", description, HashMap::new())
    }

    #[test]
    fn test_create_task_classifies() {
        let mut d = dispatcher();
        let id = create(&mut d, "analyze the quarterly data");
        let task = d.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.task_type, TaskType::DataAnalysis);
        assert_eq!(task.user_id, "alice");
        assert!(task.assigned_agent.is_none());
    }

    #[test]
    fn test_unknown_task() {
        let mut d = dispatcher();
        let ghost = Uuid::new_v4();
        assert!(matches!(
            d.cancel(ghost).unwrap_err(),
            SwitchboardError::TaskNotFound(_)
        ));
        assert!(d.match_agent(ghost).is_err());
    }

    #[test]
    fn test_match_on_empty_pool_is_none() {
        let mut d = dispatcher();
        let id = create(&mut d, "anything");
        assert!(d.match_agent(id).unwrap().is_none());
        assert!(matches!(
            d.dispatch(id).unwrap_err(),
            SwitchboardError::NoAgentAvailable(_)
        ));
        assert_eq!(d.get_task(id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_assign_requires_known_agent() {
        let mut d = dispatcher();
        let id = create(&mut d, "anything");
        assert!(matches!(
            d.assign(id, "ghost").unwrap_err(),
            SwitchboardError::ComponentNotFound(_)
        ));
        assert_eq!(d.get_task(id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_full_lifecycle() {
        let mut d = dispatcher();
        d.register_agent(AgentCapability::new("coder", "rust").with_performance(0.6));
        let id = create(&mut d, "write rust code");

        let (pick, task) = d.dispatch(id).unwrap();
        assert_eq!(pick.agent_id, "coder");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(d.agent("coder").unwrap().last_used.is_some());
        assert_eq!(d.tasks_for_agent("coder"), vec![id]);

        let task = d.update_progress(id, 0.4).unwrap();
        assert!((task.progress - 0.4).abs() < 1e-9);

        let task = d
            .record_result(id, serde_json::json!("fn main() {}"), 0.8, true)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 1.0);
        assert!((d.agent("coder").unwrap().performance_score - 0.7).abs() < 1e-9);
        assert!(d.tasks_for_agent("coder").is_empty());
    }

    #[test]
    fn test_low_score_still_completes() {
        let mut d = dispatcher();
        d.register_agent(AgentCapability::new("coder", ""));
        let id = create(&mut d, "write code");
        d.dispatch(id).unwrap();
        let task = d.record_result(id, serde_json::json!("meh"), 0.2, true).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(d.status().below_threshold, 1);
    }

    #[test]
    fn test_non_finite_feedback_counts_as_zero() {
        let mut d = dispatcher();
        d.register_agent(AgentCapability::new("bad", "").with_performance(0.5));
        d.register_agent(AgentCapability::new("good", "").with_performance(0.9));
        let id = create(&mut d, "write code");
        d.assign(id, "bad").unwrap();

        let task = d
            .record_result(id, serde_json::json!("x"), f64::NAN, true)
            .unwrap();
        assert_eq!(task.feedback_score, Some(0.0));
        assert!((d.agent("bad").unwrap().performance_score - 0.25).abs() < 1e-9);

        let next = create(&mut d, "write more code");
        let pick = d.match_agent(next).unwrap().unwrap();
        assert_eq!(pick.agent_id, "good");

        let reports = d.apply_learning(0.7);
        assert!(reports.iter().all(|r| r.new_score.is_finite()));
    }

    #[test]
    fn test_explicit_failure() {
        let mut d = dispatcher();
        d.register_agent(AgentCapability::new("coder", "").with_performance(0.8));
        let id = create(&mut d, "write code");
        d.dispatch(id).unwrap();
        let task = d
            .record_result(id, serde_json::json!("crashed"), 0.0, false)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!((d.agent("coder").unwrap().performance_score - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_terminal_tasks_reject_changes() {
        let mut d = dispatcher();
        d.register_agent(AgentCapability::new("coder", ""));
        let id = create(&mut d, "write code");
        d.dispatch(id).unwrap();
        d.record_result(id, serde_json::json!("ok"), 0.9, true)
            .unwrap();

        for err in [
            d.cancel(id).unwrap_err(),
            d.release(id).unwrap_err(),
            d.assign(id, "coder").unwrap_err(),
            d.update_progress(id, 0.5).unwrap_err(),
            d.record_result(id, serde_json::json!("again"), 0.1, true)
                .unwrap_err(),
        ] {
            assert!(matches!(err, SwitchboardError::InvalidTaskTransition { .. }));
        }
        let task = d.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(serde_json::json!("ok")));
    }

    #[test]
    fn test_pending_cannot_complete_or_reassign_twice() {
        let mut d = dispatcher();
        d.register_agent(AgentCapability::new("a", ""));
        d.register_agent(AgentCapability::new("b", ""));
        let id = create(&mut d, "write code");
        assert!(d
            .record_result(id, serde_json::json!(null), 0.5, true)
            .is_err());
        d.assign(id, "a").unwrap();
        assert!(d.assign(id, "b").is_err());
        assert_eq!(
            d.get_task(id).unwrap().assigned_agent.as_deref(),
            Some("a")
        );
    }

    #[test]
    fn test_release_allows_reassignment() {
        let mut d = dispatcher();
        d.register_agent(AgentCapability::new("a", ""));
        d.register_agent(AgentCapability::new("b", ""));
        let id = create(&mut d, "write code");
        d.assign(id, "a").unwrap();
        d.update_progress(id, 0.5).unwrap();

        let task = d.release(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent.is_none());
        assert_eq!(task.progress, 0.0);
        assert_eq!(d.pending_tasks(), vec![id]);

        d.assign(id, "b").unwrap();
        assert_eq!(d.get_task(id).unwrap().assigned_agent.as_deref(), Some("b"));
    }

    #[test]
    fn test_cancel_from_pending_and_in_progress() {
        let mut d = dispatcher();
        d.register_agent(AgentCapability::new("a", ""));
        let waiting = create(&mut d, "one");
        let running = create(&mut d, "two");
        d.assign(running, "a").unwrap();

        assert_eq!(d.cancel(waiting).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(d.cancel(running).unwrap().status, TaskStatus::Cancelled);
        assert!(d.pending_tasks().is_empty());
    }

    #[test]
    fn test_register_agent_replaces_in_place() {
        let mut d = dispatcher();
        d.register_agent(AgentCapability::new("a", "old"));
        d.register_agent(AgentCapability::new("b", ""));
        d.register_agent(AgentCapability::new("a", "new"));
        let ids: Vec<&str> = d.agents().iter().map(|a| a.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(d.agent("a").unwrap().specialization, "new");

        assert!(d.unregister_agent("a").is_some());
        assert!(d.unregister_agent("a").is_none());
        assert_eq!(d.agents().len(), 1);
    }

    #[test]
    fn test_apply_learning_blends_history() {
        let mut d = dispatcher();
        d.register_agent(AgentCapability::new("a", "").with_performance(0.5));
        d.register_agent(AgentCapability::new("idle", "").with_performance(0.5));
        for score in [1.0, 0.6] {
            let id = create(&mut d, "write code");
            d.assign(id, "a").unwrap();
            d.record_result(id, serde_json::json!("ok"), score, true)
                .unwrap();
        }
        // (0.5 + 1.0) / 2 = 0.75, then (0.75 + 0.6) / 2 = 0.675.
        let reports = d.apply_learning(0.7);
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.agent_id, "a");
        assert_eq!(report.samples, 2);
        assert!((report.previous_score - 0.675).abs() < 1e-9);
        assert!((report.historical_score - 0.8).abs() < 1e-9);
        assert!((report.new_score - (0.7 * 0.675 + 0.3 * 0.8)).abs() < 1e-9);
        assert_eq!(d.agent("idle").unwrap().performance_score, 0.5);
    }

    #[test]
    fn test_history_window_bounds_samples() {
        let mut d = TaskDispatcher::new(&DispatchConfig::default(), 3);
        d.register_agent(AgentCapability::new("a", ""));
        for _ in 0..5 {
            let id = create(&mut d, "write code");
            d.assign(id, "a").unwrap();
            d.record_result(id, serde_json::json!("ok"), 0.9, true)
                .unwrap();
        }
        assert_eq!(d.apply_learning(0.7)[0].samples, 3);
    }

    #[test]
    fn test_status_counts() {
        let mut d = dispatcher();
        d.register_agent(AgentCapability::new("a", "").with_performance(0.4));
        d.register_agent(AgentCapability::new("b", "").with_performance(0.8));
        let one = create(&mut d, "one");
        create(&mut d, "two");
        d.assign(one, "a").unwrap();

        let status = d.status();
        assert_eq!(status.total_tasks, 2);
        assert_eq!(status.tasks_by_status["pending"], 1);
        assert_eq!(status.tasks_by_status["in_progress"], 1);
        assert_eq!(status.tasks_by_status["completed"], 0);
        assert!((status.average_performance - 0.6).abs() < 1e-9);
        assert_eq!(d.user_tasks("alice").len(), 2);
        assert!(d.user_tasks("bob").is_empty());
    }
}
