use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use swarmledger::config::Config;
use swarmledger::discovery::{Candidate, Discovery, FileDiscovery};
use swarmledger::executor::{CommandExecutor, Executor, NoopExecutor};
use swarmledger::heartbeat::HeartbeatScheduler;
use swarmledger::models::{NewTask, NodeStatus};
use swarmledger::swarm::{ClaimResult, Swarm};

/// What the loop should do after one pass.
enum Step {
  /// Something happened; look for more work right away.
  Again,
  /// Nothing to do; poll again on the working cadence.
  Idle,
  /// Work failed; wait out the error backoff.
  Backoff,
}

struct Worker {
  swarm: Arc<Swarm>,
  scheduler: HeartbeatScheduler,
  executor: Box<dyn Executor>,
  discovery: Option<Box<dyn Discovery>>,
  last_discovery: Option<Instant>,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = Config::from_env().ensure_node_id().context("Failed to resolve node id")?;
  info!(
    node_id = %config.node_id,
    ledger = ?config.ledger_path,
    sync = %config.sync_method,
    "Starting swarm worker"
  );

  let executor: Box<dyn Executor> = match &config.executor_cmd {
    Some(cmd) => Box::new(CommandExecutor::new(cmd.clone())),
    None => Box::new(NoopExecutor),
  };
  let discovery: Option<Box<dyn Discovery>> = config
    .discovery_file
    .clone()
    .map(|path| Box::new(FileDiscovery::new(path)) as Box<dyn Discovery>);

  let swarm = Arc::new(Swarm::new(config));
  let scheduler = HeartbeatScheduler::start(swarm.clone());
  let shutdown = scheduler.shutdown_token();

  let signal_token = shutdown.clone();
  tokio::spawn(async move {
    match tokio::signal::ctrl_c().await {
      Ok(()) => info!("Shutdown signal received"),
      Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    signal_token.cancel();
  });

  let mut worker = Worker { swarm, scheduler, executor, discovery, last_discovery: None };
  worker.run(shutdown).await;
  worker.shutdown().await;
  Ok(())
}

impl Worker {
  async fn run(&mut self, shutdown: CancellationToken) {
    let config = self.swarm.config().clone();
    loop {
      let wait = match self.step(&shutdown).await {
        Ok(Step::Again) => Duration::ZERO,
        Ok(Step::Idle) => config.heartbeat_interval,
        Ok(Step::Backoff) => config.error_backoff,
        Err(e) => {
          error!("Worker step failed: {:#}", e);
          config.error_backoff
        }
      };

      tokio::select! {
        _ = shutdown.cancelled() => break,
        _ = tokio::time::sleep(wait) => {}
      }
    }
  }

  async fn step(&mut self, shutdown: &CancellationToken) -> Result<Step> {
    let presence = self.swarm.presence(NodeStatus::Idle, None).await;
    let task = match self.swarm.claim(&presence).await.context("Claim failed")? {
      ClaimResult::Claimed(task) => task,
      ClaimResult::AlreadyHolding(task) => {
        info!(task_id = %task.id, "Resuming task already held by this node");
        task
      }
      ClaimResult::NoneAvailable => return self.discover().await,
      ClaimResult::CapacityTooLow { .. } => return Ok(Step::Idle),
    };

    self.scheduler.update_status(NodeStatus::Working, Some(task.id.clone()));
    let node_id = self.swarm.node_id().to_string();
    let result = tokio::select! {
      _ = shutdown.cancelled() => {
        info!(task_id = %task.id, "Interrupted while executing");
        return Ok(Step::Idle);
      }
      result = self.executor.execute(&task, &node_id) => result,
    };

    let step = match result {
      Ok(true) => {
        let report = self.swarm.complete(&task.id, false).await.context("Complete failed")?;
        if let Err(e) = report.outcome.into_result(&task.id, &node_id) {
          warn!(task_id = %task.id, "Completion rejected: {}", e);
        }
        self.scheduler.update_status(NodeStatus::Idle, None);
        Step::Again
      }
      // The claim stays ours, so the node keeps reporting it as its task.
      Ok(false) => {
        warn!(task_id = %task.id, "Task failed, leaving it claimed for retry");
        Step::Backoff
      }
      Err(e) => {
        warn!(task_id = %task.id, "Executor error, leaving task claimed: {:#}", e);
        Step::Backoff
      }
    };
    Ok(step)
  }

  /// Feeds discovered candidates into the ledger, at most once per discovery interval.
  async fn discover(&mut self) -> Result<Step> {
    let Some(discovery) = &self.discovery else {
      return Ok(Step::Idle);
    };
    let interval = self.swarm.config().discovery_interval;
    if self.last_discovery.is_some_and(|at| at.elapsed() < interval) {
      return Ok(Step::Idle);
    }
    self.last_discovery = Some(Instant::now());

    let tasks: Vec<NewTask> = discovery.candidates().map(Candidate::into_task).collect();
    if tasks.is_empty() {
      return Ok(Step::Idle);
    }
    let inserted = self.swarm.add(tasks).await.context("Adding discovered tasks failed")?;
    Ok(if inserted > 0 { Step::Again } else { Step::Idle })
  }

  /// Hands back an interrupted claim, then lets the heartbeat announce offline.
  async fn shutdown(self) {
    if let Some(task_id) = self.scheduler.state().current_task {
      match self.swarm.release(&task_id).await {
        Ok(outcome) if outcome.is_applied() => info!(%task_id, "Released task on shutdown"),
        Ok(outcome) => warn!(%task_id, ?outcome, "Could not release task on shutdown"),
        Err(e) => warn!(%task_id, "Release on shutdown failed: {}", e),
      }
    }
    self.scheduler.stop().await;
    info!("Worker stopped");
  }
}
