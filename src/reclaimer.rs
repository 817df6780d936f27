use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::models::{Ledger, Node, NodeStatus, Task, TaskStatus};
use crate::node_registry::horizon_delta;

fn is_abandoned(task: &Task, nodes: &BTreeMap<String, Node>, timeout: Duration, now: DateTime<Utc>) -> bool {
  if task.status != TaskStatus::Claimed {
    return false;
  }
  let owner_present = task
    .claimed_by
    .as_ref()
    .and_then(|owner| nodes.get(owner))
    .is_some_and(|node| node.status != NodeStatus::Offline);
  let expired = task
    .claimed_at
    .is_none_or(|at| now.signed_duration_since(at) > horizon_delta(timeout));
  !owner_present || expired
}

/// Returns abandoned claims to availability and moves them to the front of
/// the ledger so they are retried before newer work of equal priority.
/// A claim is abandoned when its owner is gone from the registry or it has
/// been held longer than `task_timeout`. Returns the reclaimed ids.
pub fn sweep(ledger: &mut Ledger, task_timeout: Duration, now: DateTime<Utc>) -> Vec<String> {
  let mut reclaimed = Vec::new();
  let mut kept = Vec::with_capacity(ledger.tasks.len());

  for mut task in ledger.tasks.drain(..) {
    if is_abandoned(&task, &ledger.nodes, task_timeout, now) {
      info!(
        task_id = %task.id,
        owner = ?task.claimed_by,
        claimed_at = ?task.claimed_at,
        "Reclaiming abandoned task"
      );
      task.status = TaskStatus::Available;
      task.claimed_by = None;
      task.claimed_at = None;
      reclaimed.push(task);
    } else {
      kept.push(task);
    }
  }

  let ids = reclaimed.iter().map(|t| t.id.clone()).collect();
  reclaimed.extend(kept);
  ledger.tasks = reclaimed;
  ids
}
