use crate::types::{AgentCapability, AgentMatch, Task};
use switchboard_core::DispatchConfig;

/// Scores agents against a task.
///
/// `score = performance + bonus(specialization in description)
///        + weight * matched_capabilities / total_capabilities`, clamped to
/// `[0, 1]`.
#[derive(Debug, Clone)]
pub struct AgentMatcher {
    specialization_bonus: f64,
    capability_weight: f64,
}

impl AgentMatcher {
    pub fn new(specialization_bonus: f64, capability_weight: f64) -> Self {
        Self {
            specialization_bonus,
            capability_weight,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.specialization_bonus, config.capability_weight)
    }

    pub fn score(&self, agent: &AgentCapability, task: &Task) -> f64 {
        let description = task.description.to_lowercase();
        let mut score = agent.performance_score;

        let specialization = agent.specialization.trim().to_lowercase();
        if !specialization.is_empty() && description.contains(&specialization) {
            score += self.specialization_bonus;
        }

        if !agent.capabilities.is_empty() {
            let task_type = task.task_type.as_str();
            let matched = agent
                .capabilities
                .iter()
                .filter(|cap| {
                    let cap = cap.trim().to_lowercase();
                    !cap.is_empty() && (cap == task_type || description.contains(&cap))
                })
                .count();
            score += self.capability_weight * matched as f64 / agent.capabilities.len() as f64;
        }

        score.clamp(0.0, 1.0)
    }

    /// Highest-scoring agent; on equal scores the earliest in `agents` wins.
    pub fn best_match<'a, I>(&self, agents: I, task: &Task) -> Option<AgentMatch>
    where
        I: IntoIterator<Item = &'a AgentCapability>,
    {
        let mut best: Option<AgentMatch> = None;
        for agent in agents {
            let score = self.score(agent, task);
            if !score.is_finite() {
                continue;
            }
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(AgentMatch {
                    agent_id: agent.agent_id.clone(),
                    score,
                });
            }
        }
        best
    }
}

impl Default for AgentMatcher {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}
