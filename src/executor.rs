use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::models::Task;

/// Does the actual work for a claimed task. `Ok(true)` means the task may be
/// completed; `Ok(false)` or an error leaves it claimed for a later retry.
#[async_trait]
pub trait Executor: Send + Sync {
  async fn execute(&self, task: &Task, node_id: &str) -> Result<bool>;
}

/// Runs a shell command per task, passing the task through the environment.
pub struct CommandExecutor {
  command: String,
}

impl CommandExecutor {
  pub fn new(command: impl Into<String>) -> Self {
    Self { command: command.into() }
  }
}

#[async_trait]
impl Executor for CommandExecutor {
  async fn execute(&self, task: &Task, node_id: &str) -> Result<bool> {
    info!(node_id, task_id = %task.id, "Executing task");
    let status = Command::new("sh")
      .arg("-c")
      .arg(&self.command)
      .env("SWARM_NODE_ID", node_id)
      .env("SWARM_TASK_ID", &task.id)
      .env("SWARM_TASK_TITLE", &task.title)
      .env("SWARM_TASK_URL", &task.url)
      .stdin(Stdio::null())
      .kill_on_drop(true)
      .status()
      .await
      .with_context(|| format!("Failed to launch executor for task {}", task.id))?;

    if !status.success() {
      warn!(task_id = %task.id, %status, "Executor reported failure");
    }
    Ok(status.success())
  }
}

/// Accepts every task without doing anything. Used when no command is configured.
pub struct NoopExecutor;

#[async_trait]
impl Executor for NoopExecutor {
  async fn execute(&self, task: &Task, node_id: &str) -> Result<bool> {
    info!(node_id, task_id = %task.id, "No executor configured, marking task done");
    Ok(true)
  }
}
