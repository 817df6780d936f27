use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use swarmledger::config::Config;
use swarmledger::models::{NewTask, NodeStatus, Task};
use swarmledger::swarm::{ClaimResult, Swarm};
use swarmledger::task_queue::Outcome;

#[derive(Parser)]
#[command(name = "swarmledger", about = "Coordinate work across devices through a shared ledger")]
struct Cli {
  /// Ledger file, overrides SWARM_LEDGER_PATH
  #[arg(long, global = true)]
  ledger: Option<PathBuf>,

  /// Node id, overrides SWARM_NODE_ID and the persisted id
  #[arg(long, global = true)]
  node_id: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Node and task counts
  Status,
  /// Network health summary as JSON
  Health,
  /// Claim the next available task for this node
  Claim,
  /// Mark a task completed
  Complete {
    task_id: String,
    /// Only complete a task this node has claimed
    #[arg(long)]
    strict: bool,
  },
  /// Return a claimed task to the queue
  Release { task_id: String },
  /// Add tasks; ids already in the ledger are skipped
  Add {
    #[arg(required = true)]
    tasks: Vec<String>,
    #[arg(long, default_value_t = 0.0, value_parser = finite_priority)]
    priority: f64,
    #[arg(long)]
    title: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  let mut config = Config::from_env();
  if let Some(path) = cli.ledger {
    config = config.with_ledger_path(path);
  }
  if let Some(node_id) = cli.node_id {
    config.node_id = node_id;
  }
  let config = config.ensure_node_id().context("Failed to resolve node id")?;
  let swarm = Swarm::new(config);

  match cli.command {
    Command::Status => {
      let status = swarm.status().await?;
      println!("Node:      {}", status.node_id);
      println!("Nodes:     {} active / {} total", status.active_nodes, status.total_nodes);
      println!(
        "Tasks:     {} pending, {} active, {} completed",
        status.pending_tasks, status.active_tasks, status.completed_tasks
      );
    }
    Command::Health => {
      let health = swarm.health().await?;
      println!("{}", serde_json::to_string_pretty(&health)?);
    }
    Command::Claim => {
      let presence = swarm.presence(NodeStatus::Idle, None).await;
      match swarm.claim(&presence).await? {
        ClaimResult::Claimed(task) => println!("Claimed {}", describe(&task)),
        ClaimResult::AlreadyHolding(task) => println!("Already holding {}", describe(&task)),
        ClaimResult::NoneAvailable => println!("none available"),
        ClaimResult::CapacityTooLow { level, threshold } => {
          println!("Capacity too low to claim ({}% < {}%)", level, threshold)
        }
      }
    }
    Command::Complete { task_id, strict } => {
      let report = swarm.complete(&task_id, !strict).await?;
      println!("Before: {}", report.before.as_ref().map_or_else(|| "missing".to_string(), describe));
      println!("After:  {}", report.after.as_ref().map_or_else(|| "missing".to_string(), describe));
      report_outcome("complete", &task_id, swarm.node_id(), report.outcome);
    }
    Command::Release { task_id } => {
      let outcome = swarm.release(&task_id).await?;
      report_outcome("release", &task_id, swarm.node_id(), outcome);
    }
    Command::Add { tasks, priority, title } => {
      let valid_id = Regex::new(r"^[\w.:/#@?=&%+~-]+$").context("Invalid task id pattern")?;
      let single = tasks.len() == 1;
      let mut batch = Vec::with_capacity(tasks.len());
      for raw in tasks {
        if !valid_id.is_match(&raw) {
          warn!(task = %raw, "Skipping task with invalid id");
          continue;
        }
        let mut task = NewTask::new(raw.clone(), priority);
        if raw.starts_with("http://") || raw.starts_with("https://") {
          task.url = raw;
        }
        if let (true, Some(title)) = (single, title.as_ref()) {
          task.title = title.clone();
        }
        batch.push(task);
      }
      let inserted = swarm.add(batch).await?;
      println!("Added {} task(s)", inserted);
    }
  }
  Ok(())
}

fn finite_priority(raw: &str) -> Result<f64, String> {
  let priority: f64 = raw.parse().map_err(|e| format!("{}", e))?;
  if priority.is_finite() {
    Ok(priority)
  } else {
    Err(format!("priority must be a finite number, got {}", raw))
  }
}

fn describe(task: &Task) -> String {
  let mut line = format!("{} [{}] priority={}", task.id, task.status, task.priority);
  if let Some(owner) = &task.claimed_by {
    line.push_str(&format!(" claimed_by={}", owner));
  }
  if let Some(done_by) = &task.completed_by {
    line.push_str(&format!(" completed_by={}", done_by));
  }
  line
}

fn report_outcome(action: &str, task_id: &str, node_id: &str, outcome: Outcome) {
  match outcome.into_result(task_id, node_id) {
    Ok(()) => println!("{} {}: ok", action, task_id),
    Err(e) => println!("{} {}: rejected ({})", action, task_id, e),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn add_with_priority(priority: &str) -> std::result::Result<Cli, clap::Error> {
    Cli::try_parse_from(["swarmledger".to_string(), "add".into(), "t1".into(), format!("--priority={}", priority)])
  }

  #[test]
  fn priority_must_be_finite() {
    for bad in ["NaN", "inf", "-inf", "infinity", "high"] {
      assert!(add_with_priority(bad).is_err(), "accepted {}", bad);
    }
    let cli = add_with_priority("-2.5").unwrap();
    assert!(matches!(cli.command, Command::Add { priority, .. } if priority == -2.5));
  }

  #[test]
  fn priority_defaults_to_zero() {
    let cli = Cli::try_parse_from(["swarmledger", "add", "t1", "t2"]).unwrap();
    match cli.command {
      Command::Add { tasks, priority, title } => {
        assert_eq!(tasks, ["t1", "t2"]);
        assert_eq!(priority, 0.0);
        assert_eq!(title, None);
      }
      _ => panic!("expected add"),
    }
  }
}
