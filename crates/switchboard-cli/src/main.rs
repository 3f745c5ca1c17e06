//! `switchboard` command-line entry point.

mod agents;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchboard_bus::BusStatus;
use switchboard_core::SwitchboardConfig;
use switchboard_orchestrator::{
    BrainHub, DispatcherStatus, LearningReport, Task, TaskClassifier, LEVEL_KEY,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "Switchboard: agent message bus and task dispatcher")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "switchboard.toml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Boot the hub with simulated agents and run one session per goal
    Run {
        /// User the sessions belong to
        #[arg(short, long, default_value = "local")]
        user: String,
        /// Skill-level hint (beginner, intermediate, advanced, expert)
        #[arg(long)]
        level: Option<String>,
        /// Give up waiting for results after this many seconds
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
        /// Run a learning cycle once all sessions finish
        #[arg(long)]
        learn: bool,
        /// One task description per goal
        #[arg(required = true)]
        goals: Vec<String>,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Show how a description would be classified
    Classify {
        /// Skill-level hint
        #[arg(long)]
        level: Option<String>,
        #[arg(required = true)]
        text: Vec<String>,
    },
}

#[derive(Serialize)]
struct RunReport {
    tasks: Vec<Task>,
    learning: Vec<LearningReport>,
    dispatcher: DispatcherStatus,
    channel: BusStatus,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn level_context(level: Option<String>) -> HashMap<String, serde_json::Value> {
    level
        .map(|l| HashMap::from([(LEVEL_KEY.to_string(), serde_json::json!(l))]))
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = SwitchboardConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config '{}'", cli.config.display()))?;

    match cli.command {
        Commands::Run {
            user,
            level,
            wait_secs,
            learn,
            goals,
        } => {
            let report = run(config, &user, level, Duration::from_secs(wait_secs), learn, goals)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
        Commands::Classify { level, text } => {
            let classifier = TaskClassifier::from_config(&config.dispatch);
            let description = text.join(" ");
            let classification = classifier.classify(&description, &level_context(level));
            println!("{}", serde_json::to_string_pretty(&classification)?);
        }
    }
    Ok(())
}

async fn run(
    config: SwitchboardConfig,
    user: &str,
    level: Option<String>,
    wait: Duration,
    learn: bool,
    goals: Vec<String>,
) -> anyhow::Result<RunReport> {
    let hub = Arc::new(BrainHub::new(config).await?);
    hub.start().await;

    let mut workers = Vec::new();
    for agent in agents::SimulatedAgent::roster() {
        let mailbox = hub.register_agent(agent.capability()).await?;
        workers.push(agents::spawn(hub.clone(), mailbox));
    }
    info!(agents = workers.len(), "Simulated agents online");

    let mut task_ids = Vec::with_capacity(goals.len());
    for goal in &goals {
        let task_id = hub
            .start_session(user, goal, level_context(level.clone()))
            .await?;
        task_ids.push(task_id);
    }

    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let mut open = 0;
        for id in &task_ids {
            if !hub.task_status(*id).await?.status.is_terminal() {
                open += 1;
            }
        }
        if open == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(open, "Gave up waiting for task results");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let learning = if learn {
        hub.run_learning_cycle().await?
    } else {
        Vec::new()
    };

    let mut tasks = Vec::with_capacity(task_ids.len());
    for id in &task_ids {
        tasks.push(hub.task_status(*id).await?);
    }
    let report = RunReport {
        tasks,
        learning,
        dispatcher: hub.dispatcher_status().await,
        channel: hub.channel_status().await,
    };

    hub.shutdown().await;
    for worker in workers {
        worker.abort();
    }
    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use switchboard_orchestrator::TaskStatus;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "switchboard",
            "--log-json",
            "run",
            "--user",
            "alice",
            "write a parser",
            "analyze sales data",
        ])
        .unwrap();
        assert!(cli.log_json);
        match cli.command {
            Commands::Run { user, goals, .. } => {
                assert_eq!(user, "alice");
                assert_eq!(goals.len(), 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_run_requires_goals() {
        assert!(Cli::try_parse_from(["switchboard", "run"]).is_err());
    }

    #[tokio::test]
    async fn test_run_completes_goals() {
        let dir = tempfile::tempdir().unwrap();
        let config = SwitchboardConfig::load(&dir.path().join("absent.toml")).unwrap();
        let report = run(
            config,
            "alice",
            Some("beginner".into()),
            Duration::from_secs(10),
            true,
            vec!["write a function".into(), "explain the readme".into()],
        )
        .await
        .unwrap();

        assert_eq!(report.tasks.len(), 2);
        assert!(report
            .tasks
            .iter()
            .all(|t| t.status == TaskStatus::Completed));
        assert_eq!(
            report.tasks[0].assigned_agent.as_deref(),
            Some("sim-code-generation")
        );
        assert_eq!(
            report.tasks[1].assigned_agent.as_deref(),
            Some("sim-documentation")
        );
        assert_eq!(report.learning.len(), 2);
        assert!(report.channel.delivered > 0);
    }
}
