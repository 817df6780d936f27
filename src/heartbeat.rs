//! Background heartbeat and cleanup loops for one node.
//!
//! The heartbeat loop records this node's presence on an adaptive cadence
//! (short while working, long while idle) and fires immediately whenever the
//! status changes. The cleanup loop prunes peers and reclaims abandoned claims
//! on its own slower timer, so reclaim still happens on a node that is idle
//! and heartbeats rarely. Both loops stop as soon as the shutdown token is
//! cancelled, abandoning any sync still in flight; the heartbeat loop then
//! announces `offline` within the shutdown grace period.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::NodeStatus;
use crate::swarm::Swarm;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeState {
  pub status: NodeStatus,
  pub current_task: Option<String>,
}

pub struct HeartbeatScheduler {
  state_tx: watch::Sender<NodeState>,
  shutdown: CancellationToken,
  grace: Duration,
  heartbeat: JoinHandle<()>,
  cleanup: JoinHandle<()>,
}

impl HeartbeatScheduler {
  /// Spawns both loops. The first heartbeat goes out right away.
  pub fn start(swarm: Arc<Swarm>) -> Self {
    let (state_tx, state_rx) = watch::channel(NodeState::default());
    let shutdown = CancellationToken::new();
    let grace = swarm.config().shutdown_grace;
    info!(node_id = swarm.node_id(), "Starting heartbeat for node");

    let heartbeat = tokio::spawn(heartbeat_loop(swarm.clone(), state_rx, shutdown.clone()));
    let cleanup = tokio::spawn(cleanup_loop(swarm, shutdown.clone()));
    Self { state_tx, shutdown, grace, heartbeat, cleanup }
  }

  pub fn state(&self) -> NodeState {
    self.state_tx.borrow().clone()
  }

  /// Records a status transition; peers see it on the next, immediate, heartbeat.
  pub fn update_status(&self, status: NodeStatus, current_task: Option<String>) {
    let next = NodeState { status, current_task };
    let changed = self.state_tx.send_if_modified(|state| {
      if *state == next {
        false
      } else {
        *state = next.clone();
        true
      }
    });
    if changed {
      info!(status = %next.status, task = ?next.current_task, "Status updated");
    }
  }

  pub fn shutdown_token(&self) -> CancellationToken {
    self.shutdown.clone()
  }

  /// Cancels both loops and waits up to the configured grace period for them,
  /// including the final offline heartbeat.
  pub async fn stop(self) {
    info!("Stopping heartbeat");
    self.shutdown.cancel();
    let aborts = [self.heartbeat.abort_handle(), self.cleanup.abort_handle()];
    let joined = tokio::time::timeout(self.grace, futures::future::join_all([self.heartbeat, self.cleanup])).await;
    match joined {
      Ok(results) => {
        for result in results {
          if let Err(e) = result {
            error!("Heartbeat task ended abnormally: {}", e);
          }
        }
        info!("Heartbeat stopped");
      }
      Err(_) => {
        warn!(grace = ?self.grace, "Heartbeat loops did not stop in time, aborting");
        for handle in aborts {
          handle.abort();
        }
      }
    }
  }
}

async fn heartbeat_loop(swarm: Arc<Swarm>, mut state_rx: watch::Receiver<NodeState>, shutdown: CancellationToken) {
  let config = swarm.config().clone();
  loop {
    let state = state_rx.borrow_and_update().clone();
    let presence = swarm.presence(state.status, state.current_task.clone()).await;
    let result = tokio::select! {
      _ = shutdown.cancelled() => break,
      result = swarm.heartbeat(&presence) => result,
    };
    let wait = match result {
      Ok(_) => match state.status {
        NodeStatus::Working => config.heartbeat_interval,
        _ => config.idle_heartbeat_interval,
      },
      Err(e) => {
        error!("Heartbeat failed: {}", e);
        config.error_backoff
      }
    };
    debug!(next_in = ?wait, "Heartbeat sleeping");

    tokio::select! {
      _ = shutdown.cancelled() => break,
      changed = state_rx.changed() => {
        if changed.is_err() {
          break;
        }
      }
      _ = tokio::time::sleep(wait) => {}
    }
  }

  // Leave headroom inside the grace period that `stop` waits for.
  let budget = config.shutdown_grace.mul_f32(0.8);
  match swarm.farewell(budget).await {
    Ok(_) => info!(node_id = swarm.node_id(), "Sent offline heartbeat"),
    Err(e) => warn!("Could not record offline status: {}", e),
  }
}

async fn cleanup_loop(swarm: Arc<Swarm>, shutdown: CancellationToken) {
  let config = swarm.config().clone();
  let mut wait = config.cleanup_interval;
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      _ = tokio::time::sleep(wait) => {}
    }
    let result = tokio::select! {
      _ = shutdown.cancelled() => break,
      result = swarm.sweep() => result,
    };
    wait = match result {
      Ok(_) => config.cleanup_interval,
      Err(e) => {
        error!("Cleanup sweep failed: {}", e);
        config.error_backoff
      }
    };
  }
  debug!("Cleanup loop exited");
}
