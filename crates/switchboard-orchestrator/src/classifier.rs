use crate::types::TaskType;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use switchboard_core::DispatchConfig;
use tracing::warn;

const MIN_COMPLEXITY: f64 = 0.1;
const MAX_COMPLEXITY: f64 = 1.0;
const DEFAULT_COMPLEXITY: f64 = 0.5;

/// Context key carrying the caller's skill-level hint.
pub const LEVEL_KEY: &str = "level";

/// Keyword stems per category, in classification order.
const TYPE_KEYWORDS: [(TaskType, &[&str]); 6] = [
    (
        TaskType::CodeGeneration,
        &["code", "function", "program", "implement", "class", "script"],
    ),
    (
        TaskType::DataAnalysis,
        &["analy", "data", "statistic", "dataset", "chart"],
    ),
    (TaskType::ApiTesting, &["api", "endpoint", "test", "request"]),
    (
        TaskType::Documentation,
        &["document", "readme", "docs", "explain"],
    ),
    (
        TaskType::Research,
        &["research", "investigat", "compare", "study"],
    ),
    (
        TaskType::Automation,
        &["automat", "schedul", "workflow", "deploy"],
    ),
];

const HARDER: &[&str] = &["advanced", "complex"];
const EASIER: &[&str] = &["simple", "basic"];

struct TypeRule {
    task_type: TaskType,
    pattern: Regex,
}

/// Type and complexity derived for a task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub task_type: TaskType,
    pub complexity: f64,
}

/// Keyword-based classifier for free-text task descriptions.
///
/// Keywords match at the start of a word (`program` matches "programming"),
/// case-insensitively.
pub struct TaskClassifier {
    rules: Vec<TypeRule>,
    harder: Option<Regex>,
    easier: Option<Regex>,
    complexity_delta: f64,
}

impl TaskClassifier {
    pub fn new(complexity_delta: f64) -> Self {
        let rules = TYPE_KEYWORDS
            .iter()
            .filter_map(|(task_type, stems)| {
                stem_pattern(stems).map(|pattern| TypeRule {
                    task_type: *task_type,
                    pattern,
                })
            })
            .collect();
        Self {
            rules,
            harder: stem_pattern(HARDER),
            easier: stem_pattern(EASIER),
            complexity_delta,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.complexity_delta)
    }

    pub fn classify(
        &self,
        description: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Classification {
        Classification {
            task_type: self.task_type(description),
            complexity: self.complexity(description, context),
        }
    }

    /// First matching category, defaulting to code generation.
    pub fn task_type(&self, description: &str) -> TaskType {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(description))
            .map(|rule| rule.task_type)
            .unwrap_or_default()
    }

    /// Base value from the `level` hint, nudged by difficulty words, clamped
    /// to `[0.1, 1.0]`.
    pub fn complexity(
        &self,
        description: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> f64 {
        let mut complexity = context
            .get(LEVEL_KEY)
            .and_then(|v| v.as_str())
            .map(level_base)
            .unwrap_or(DEFAULT_COMPLEXITY);

        if self.harder.as_ref().is_some_and(|re| re.is_match(description)) {
            complexity += self.complexity_delta;
        }
        if self.easier.as_ref().is_some_and(|re| re.is_match(description)) {
            complexity -= self.complexity_delta;
        }
        complexity.clamp(MIN_COMPLEXITY, MAX_COMPLEXITY)
    }
}

impl Default for TaskClassifier {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

fn level_base(level: &str) -> f64 {
    match level.trim().to_lowercase().as_str() {
        "beginner" | "novice" => 0.3,
        "intermediate" => 0.5,
        "advanced" | "expert" => 0.8,
        _ => DEFAULT_COMPLEXITY,
    }
}

fn stem_pattern(stems: &[&str]) -> Option<Regex> {
    let alternatives: Vec<String> = stems.iter().map(|s| regex::escape(s)).collect();
    let source = format!(r"(?i)\b(?:{})", alternatives.join("|"));
    match Regex::new(&source) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = %source, error = %e, "Skipping invalid keyword pattern");
            None
        }
    }
}
