use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::info;

use crate::models::{Ledger, Node, NodeStatus};

/// What a node reports about itself on every heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
  pub status: NodeStatus,
  pub current_task: Option<String>,
  pub capacity: u8,
  pub capabilities: Vec<String>,
}

impl Presence {
  pub fn idle(capacity: u8, capabilities: Vec<String>) -> Self {
    Self { status: NodeStatus::Idle, current_task: None, capacity, capabilities }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
  pub active: usize,
  pub total: usize,
}

pub(crate) fn horizon_delta(horizon: Duration) -> TimeDelta {
  TimeDelta::from_std(horizon).unwrap_or(TimeDelta::MAX)
}

/// Upserts this node's entry. The completed counter survives the refresh.
pub fn update_self(ledger: &mut Ledger, node_id: &str, presence: &Presence, now: DateTime<Utc>) {
  let node = ledger
    .nodes
    .entry(node_id.to_string())
    .or_insert_with(|| Node::new(node_id, now));
  node.last_seen = now;
  node.status = presence.status;
  node.current_task = presence.current_task.clone();
  node.capacity = presence.capacity;
  node.capabilities = presence.capabilities.clone();
}

/// A node counts as present while it has not announced shutdown and has been
/// heard from within `horizon`.
pub fn is_active(node: &Node, horizon: Duration, now: DateTime<Utc>) -> bool {
  node.status != NodeStatus::Offline && now.signed_duration_since(node.last_seen) <= horizon_delta(horizon)
}

/// Drops every node that is no longer active. Claims held by a dropped node
/// are left for the reclaimer. Returns the removed ids.
pub fn prune_stale(ledger: &mut Ledger, horizon: Duration, now: DateTime<Utc>) -> Vec<String> {
  let stale: Vec<String> = ledger
    .nodes
    .values()
    .filter(|n| !is_active(n, horizon, now))
    .map(|n| n.id.clone())
    .collect();
  for id in &stale {
    if let Some(node) = ledger.nodes.remove(id) {
      info!(node_id = %id, status = %node.status, last_seen = %node.last_seen, "Pruned stale node");
    }
  }
  stale
}

pub fn counts(ledger: &Ledger, horizon: Duration, now: DateTime<Utc>) -> RegistryCounts {
  RegistryCounts {
    active: ledger.nodes.values().filter(|n| is_active(n, horizon, now)).count(),
    total: ledger.nodes.len(),
  }
}
