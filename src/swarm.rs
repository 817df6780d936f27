//! Process-local coordinator around the shared ledger.
//!
//! Every mutation runs as pull → load → mutate → save → push while holding
//! one async mutex, so the loops and commands inside a process never
//! interleave their read-modify-write cycles. Across processes there is no
//! lock at all; concurrent edits are settled by the transport.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::capacity;
use crate::config::Config;
use crate::error::Result;
use crate::ledger_store::LedgerStore;
use crate::models::{Ledger, NewTask, NodeStatus, Task, TaskStatus};
use crate::node_registry::{self, Presence};
use crate::reclaimer;
use crate::task_queue::{self, Outcome};
use crate::transport::{SyncTransport, build_transport};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
  pub pruned: Vec<String>,
  pub reclaimed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
  Claimed(Task),
  /// The node already holds a claim; one task at a time.
  AlreadyHolding(Task),
  NoneAvailable,
  CapacityTooLow { level: u8, threshold: u8 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReport {
  pub before: Option<Task>,
  pub after: Option<Task>,
  pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwarmStatus {
  pub node_id: String,
  pub active_nodes: usize,
  pub total_nodes: usize,
  pub pending_tasks: usize,
  pub active_tasks: usize,
  pub completed_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkHealth {
  pub timestamp: DateTime<Utc>,
  pub node_health: f64,
  pub task_progress: f64,
  pub active_nodes: usize,
  pub total_nodes: usize,
  pub pending_tasks: usize,
  pub active_tasks: usize,
  pub completed_tasks: usize,
  pub our_node_id: String,
  pub our_status: NodeStatus,
  pub our_task: Option<String>,
}

pub struct Swarm {
  config: Config,
  store: LedgerStore,
  transport: Arc<dyn SyncTransport>,
  capabilities: Vec<String>,
  lock: Mutex<()>,
}

impl Swarm {
  pub fn new(config: Config) -> Self {
    let transport = build_transport(&config);
    Self::with_transport(config, transport)
  }

  pub fn with_transport(config: Config, transport: Arc<dyn SyncTransport>) -> Self {
    Self {
      store: LedgerStore::new(config.ledger_path.clone()),
      capabilities: capacity::detect_capabilities(&config.capabilities),
      transport,
      config,
      lock: Mutex::new(()),
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn node_id(&self) -> &str {
    &self.config.node_id
  }

  pub fn store(&self) -> &LedgerStore {
    &self.store
  }

  /// Measures this device and describes it for the registry.
  pub async fn presence(&self, status: NodeStatus, current_task: Option<String>) -> Presence {
    Presence {
      status,
      current_task,
      capacity: capacity::battery_level().await,
      capabilities: self.capabilities.clone(),
    }
  }

  async fn pull(&self) {
    if let Err(e) = self.transport.pull().await {
      warn!(channel = self.transport.name(), "Pull failed, continuing with local ledger: {}", e);
    }
  }

  async fn push(&self) {
    if let Err(e) = self.transport.push().await {
      warn!(channel = self.transport.name(), "Push failed, local ledger stays authoritative: {}", e);
    }
  }

  /// Runs one guarded read-modify-write cycle against the shared ledger.
  /// Sync failures are logged and absorbed; only local I/O errors surface.
  pub async fn transact<T>(&self, mutate: impl FnOnce(&mut Ledger, DateTime<Utc>) -> T) -> Result<T> {
    let _guard = self.lock.lock().await;
    self.pull().await;
    let mut ledger = self.store.load()?;
    let out = mutate(&mut ledger, Utc::now());
    self.store.save(&mut ledger)?;
    self.push().await;
    Ok(out)
  }

  /// Pulls and reads without writing anything back.
  pub async fn observe<T>(&self, read: impl FnOnce(&Ledger, DateTime<Utc>) -> T) -> Result<T> {
    let _guard = self.lock.lock().await;
    self.pull().await;
    let ledger = self.store.load()?;
    Ok(read(&ledger, Utc::now()))
  }

  fn prune_and_reclaim(&self, ledger: &mut Ledger, now: DateTime<Utc>) -> SweepReport {
    let pruned = node_registry::prune_stale(ledger, self.config.node_stale_after, now);
    let reclaimed = reclaimer::sweep(ledger, self.config.task_timeout, now);
    SweepReport { pruned, reclaimed }
  }

  /// One heartbeat: prune stale peers, reclaim abandoned work, record ourselves.
  pub async fn heartbeat(&self, presence: &Presence) -> Result<SweepReport> {
    let report = self
      .transact(|ledger, now| {
        let report = self.prune_and_reclaim(ledger, now);
        node_registry::update_self(ledger, self.node_id(), presence, now);
        report
      })
      .await?;
    debug!(
      node_id = self.node_id(),
      status = %presence.status,
      pruned = report.pruned.len(),
      reclaimed = report.reclaimed.len(),
      "Heartbeat recorded"
    );
    Ok(report)
  }

  /// Last heartbeat before going away. Same cycle as [`Swarm::heartbeat`]
  /// without the sweep, and each sync leg is cut off after half of `budget`.
  /// The local save always happens.
  /// The battery is not measured again; the last recorded level stands.
  pub async fn farewell(&self, budget: Duration) -> Result<()> {
    let leg = budget / 2;
    let _guard = self.lock.lock().await;
    if tokio::time::timeout(leg, self.pull()).await.is_err() {
      warn!(channel = self.transport.name(), limit = ?leg, "Final pull timed out, using local ledger");
    }
    let mut ledger = self.store.load()?;
    let offline = Presence {
      status: NodeStatus::Offline,
      current_task: None,
      capacity: ledger.nodes.get(self.node_id()).map_or(100, |n| n.capacity),
      capabilities: self.capabilities.clone(),
    };
    node_registry::update_self(&mut ledger, self.node_id(), &offline, Utc::now());
    self.store.save(&mut ledger)?;
    if tokio::time::timeout(leg, self.push()).await.is_err() {
      warn!(channel = self.transport.name(), limit = ?leg, "Final push timed out, offline status is local only");
    }
    Ok(())
  }

  /// Stale-node and abandoned-claim cleanup without touching our own entry.
  pub async fn sweep(&self) -> Result<SweepReport> {
    let report = self.transact(|ledger, now| self.prune_and_reclaim(ledger, now)).await?;
    if !report.pruned.is_empty() || !report.reclaimed.is_empty() {
      info!(pruned = ?report.pruned, reclaimed = ?report.reclaimed, "Cleanup sweep");
    }
    Ok(report)
  }

  /// Claims the next task if this node holds none and has capacity to spare.
  pub async fn claim(&self, presence: &Presence) -> Result<ClaimResult> {
    let threshold = self.config.min_capacity;
    if let Err(e) = capacity::check(presence.capacity, threshold) {
      info!(node_id = self.node_id(), "Not claiming: {}", e);
      return Ok(ClaimResult::CapacityTooLow { level: presence.capacity, threshold });
    }

    let result = self
      .transact(|ledger, now| {
        if let Some(held) = task_queue::held_by(ledger, self.node_id()) {
          return ClaimResult::AlreadyHolding(held.clone());
        }
        match task_queue::claim_next(ledger, self.node_id(), true, now) {
          Some(task) => {
            let working = Presence {
              status: NodeStatus::Working,
              current_task: Some(task.id.clone()),
              ..presence.clone()
            };
            node_registry::update_self(ledger, self.node_id(), &working, now);
            ClaimResult::Claimed(task)
          }
          None => ClaimResult::NoneAvailable,
        }
      })
      .await?;

    if let ClaimResult::Claimed(task) = &result {
      info!(node_id = self.node_id(), task_id = %task.id, priority = task.priority, "Claimed task");
    }
    Ok(result)
  }

  /// Completes `task_id` as this node. With `force` the ownership check is
  /// skipped; that is an operator override, never used by the worker loop.
  pub async fn complete(&self, task_id: &str, force: bool) -> Result<CompletionReport> {
    let report = self
      .transact(|ledger, now| {
        let before = ledger.task(task_id).cloned();
        let outcome = if force {
          task_queue::force_complete(ledger, task_id, self.node_id(), now)
        } else {
          task_queue::complete(ledger, task_id, self.node_id(), now)
        };
        if outcome.is_applied() {
          if let Some(node) = ledger.nodes.get_mut(self.node_id()) {
            if node.current_task.as_deref() == Some(task_id) {
              node.current_task = None;
              node.status = NodeStatus::Idle;
            }
          }
        }
        CompletionReport { before, after: ledger.task(task_id).cloned(), outcome }
      })
      .await?;

    if report.outcome.is_applied() {
      info!(node_id = self.node_id(), task_id, force, "Completed task");
    }
    Ok(report)
  }

  pub async fn release(&self, task_id: &str) -> Result<Outcome> {
    let outcome = self
      .transact(|ledger, _| task_queue::release(ledger, task_id, self.node_id()))
      .await?;
    if outcome.is_applied() {
      info!(node_id = self.node_id(), task_id, "Released task");
    }
    Ok(outcome)
  }

  pub async fn add(&self, tasks: Vec<NewTask>) -> Result<usize> {
    let offered = tasks.len();
    let inserted = self.transact(|ledger, _| task_queue::add(ledger, tasks)).await?;
    info!(offered, inserted, "Added tasks to ledger");
    Ok(inserted)
  }

  pub async fn status(&self) -> Result<SwarmStatus> {
    let horizon = self.config.node_stale_after;
    self
      .observe(|ledger, now| {
        let nodes = node_registry::counts(ledger, horizon, now);
        SwarmStatus {
          node_id: self.node_id().to_string(),
          active_nodes: nodes.active,
          total_nodes: nodes.total,
          pending_tasks: ledger.count(TaskStatus::Available),
          active_tasks: ledger.count(TaskStatus::Claimed),
          completed_tasks: ledger.count(TaskStatus::Completed),
        }
      })
      .await
  }

  pub async fn health(&self) -> Result<NetworkHealth> {
    let status = self.status().await?;
    let (our_status, our_task) = self
      .store
      .snapshot()
      .and_then(|l| l.nodes.get(self.node_id()).map(|n| (n.status, n.current_task.clone())))
      .unwrap_or((NodeStatus::Offline, None));
    Ok(NetworkHealth::from_status(status, our_status, our_task, Utc::now()))
  }
}

impl NetworkHealth {
  pub fn from_status(status: SwarmStatus, our_status: NodeStatus, our_task: Option<String>, now: DateTime<Utc>) -> Self {
    let ratio = |part: usize, whole: usize| if whole == 0 { 0.0 } else { part as f64 / whole as f64 };
    let total_tasks = status.pending_tasks + status.active_tasks + status.completed_tasks;
    Self {
      timestamp: now,
      node_health: ratio(status.active_nodes, status.total_nodes),
      task_progress: ratio(status.completed_tasks, total_tasks),
      active_nodes: status.active_nodes,
      total_nodes: status.total_nodes,
      pending_tasks: status.pending_tasks,
      active_tasks: status.active_tasks,
      completed_tasks: status.completed_tasks,
      our_node_id: status.node_id,
      our_status,
      our_task,
    }
  }
}
