use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::SwarmError;
use crate::models::{Ledger, NewTask, Task, TaskStatus};

/// Result of a state transition requested on a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
  Applied,
  UnknownTask,
  AlreadyCompleted,
  NotClaimed,
  NotOwner { owner: Option<String> },
}

impl Outcome {
  pub fn is_applied(&self) -> bool {
    matches!(self, Self::Applied)
  }

  pub fn into_result(self, task_id: &str, node_id: &str) -> Result<(), SwarmError> {
    match self {
      Self::Applied => Ok(()),
      Self::NotOwner { .. } | Self::NotClaimed => Err(SwarmError::OwnershipViolation {
        task_id: task_id.to_string(),
        node_id: node_id.to_string(),
      }),
      Self::UnknownTask => Err(SwarmError::Config(format!("no task with id '{}'", task_id))),
      Self::AlreadyCompleted => Err(SwarmError::Config(format!("task '{}' is already completed", task_id))),
    }
  }
}

/// Claim precedence: higher priority first, then earlier position in the ledger.
#[derive(Debug, Clone, Copy)]
struct ClaimOrder {
  priority: f64,
  position: usize,
}

impl PartialEq for ClaimOrder {
  fn eq(&self, other: &Self) -> bool {
    self.cmp(other) == Ordering::Equal
  }
}

impl Eq for ClaimOrder {}

impl PartialOrd for ClaimOrder {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for ClaimOrder {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .priority
      .total_cmp(&other.priority)
      .then_with(|| other.position.cmp(&self.position))
  }
}

/// Available tasks in the order they would be claimed.
pub fn claim_order(ledger: &Ledger) -> Vec<&Task> {
  let mut ranked: Vec<(ClaimOrder, &Task)> = ledger
    .tasks
    .iter()
    .enumerate()
    .filter(|(_, t)| t.is_available())
    .map(|(position, t)| (ClaimOrder { priority: t.priority, position }, t))
    .collect();
  ranked.sort_by(|a, b| b.0.cmp(&a.0));
  ranked.into_iter().map(|(_, t)| t).collect()
}

/// The task `node_id` currently holds a claim on, if any.
pub fn held_by<'a>(ledger: &'a Ledger, node_id: &str) -> Option<&'a Task> {
  ledger.tasks.iter().find(|t| t.is_claimed_by(node_id))
}

/// Claims the most urgent available task for `node_id`. Returns a copy of the
/// claimed task, or `None` when nothing is available or the capacity gate is shut.
pub fn claim_next(ledger: &mut Ledger, node_id: &str, capacity_ok: bool, now: DateTime<Utc>) -> Option<Task> {
  if !capacity_ok {
    debug!(node_id, "Capacity gate closed, not claiming");
    return None;
  }
  let position = ledger
    .tasks
    .iter()
    .enumerate()
    .filter(|(_, t)| t.is_available())
    .max_by_key(|(position, t)| ClaimOrder { priority: t.priority, position: *position })
    .map(|(position, _)| position)?;

  let task = ledger.tasks.get_mut(position)?;
  task.status = TaskStatus::Claimed;
  task.claimed_by = Some(node_id.to_string());
  task.claimed_at = Some(now);
  Some(task.clone())
}

/// Completes a task on behalf of its owner. Anyone else is turned away with
/// the ledger untouched, so a node whose claim was reclaimed cannot finish a
/// task that has since been claimed by someone else.
pub fn complete(ledger: &mut Ledger, task_id: &str, node_id: &str, now: DateTime<Utc>) -> Outcome {
  match ledger.task(task_id) {
    None => return Outcome::UnknownTask,
    Some(t) if t.status == TaskStatus::Completed => return Outcome::AlreadyCompleted,
    Some(t) if !t.is_claimed_by(node_id) => {
      warn!(task_id, node_id, owner = ?t.claimed_by, "Ownership violation: completion rejected");
      return Outcome::NotOwner { owner: t.claimed_by.clone() };
    }
    Some(_) => {}
  }
  finish(ledger, task_id, node_id, now)
}

/// Operator override: completes the task whoever holds it.
pub fn force_complete(ledger: &mut Ledger, task_id: &str, node_id: &str, now: DateTime<Utc>) -> Outcome {
  match ledger.task(task_id) {
    None => Outcome::UnknownTask,
    Some(t) if t.status == TaskStatus::Completed => Outcome::AlreadyCompleted,
    Some(t) => {
      if let Some(owner) = t.claimed_by.as_deref().filter(|owner| *owner != node_id) {
        warn!(task_id, node_id, owner, "Force-completing a task claimed by another node");
      }
      finish(ledger, task_id, node_id, now)
    }
  }
}

fn finish(ledger: &mut Ledger, task_id: &str, node_id: &str, now: DateTime<Utc>) -> Outcome {
  let Some(task) = ledger.task_mut(task_id) else {
    return Outcome::UnknownTask;
  };
  task.status = TaskStatus::Completed;
  task.claimed_by = None;
  task.claimed_at = None;
  task.completed_by = Some(node_id.to_string());
  task.completed_at = Some(now);
  if let Some(node) = ledger.nodes.get_mut(node_id) {
    node.completed_tasks += 1;
  }
  Outcome::Applied
}

/// Gives a claim back voluntarily. Only the owner may release.
pub fn release(ledger: &mut Ledger, task_id: &str, node_id: &str) -> Outcome {
  let Some(task) = ledger.task_mut(task_id) else {
    return Outcome::UnknownTask;
  };
  match task.status {
    TaskStatus::Completed => Outcome::AlreadyCompleted,
    TaskStatus::Available => Outcome::NotClaimed,
    TaskStatus::Claimed if task.claimed_by.as_deref() != Some(node_id) => {
      warn!(task_id, node_id, owner = ?task.claimed_by, "Ownership violation: release rejected");
      Outcome::NotOwner { owner: task.claimed_by.clone() }
    }
    TaskStatus::Claimed => {
      task.status = TaskStatus::Available;
      task.claimed_by = None;
      task.claimed_at = None;
      Outcome::Applied
    }
  }
}

/// Appends tasks whose id appears nowhere in the ledger. Discovery runs on
/// every node, so the same work item routinely arrives more than once.
/// Returns how many were inserted.
pub fn add(ledger: &mut Ledger, tasks: impl IntoIterator<Item = NewTask>) -> usize {
  let mut known: HashSet<String> = ledger.tasks.iter().map(|t| t.id.clone()).collect();
  let before = ledger.tasks.len();
  for new_task in tasks {
    if new_task.id.is_empty() || !known.insert(new_task.id.clone()) {
      continue;
    }
    ledger.tasks.push(new_task.into_task());
  }
  ledger.tasks.len() - before
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::Node;
  use chrono::TimeDelta;

  fn ledger_with(tasks: &[(&str, f64)]) -> Ledger {
    let mut ledger = Ledger::empty(Utc::now());
    add(&mut ledger, tasks.iter().map(|(id, p)| NewTask::new(*id, *p)));
    ledger
  }

  fn assert_claim_fields_consistent(ledger: &Ledger) {
    for t in &ledger.tasks {
      let claimed = t.status == TaskStatus::Claimed;
      assert_eq!(t.claimed_by.is_some(), claimed, "claimed_by on {}", t.id);
      assert_eq!(t.claimed_at.is_some(), claimed, "claimed_at on {}", t.id);
    }
  }

  #[test]
  fn claims_highest_priority() {
    let mut ledger = ledger_with(&[("t1", 5.0), ("t2", 9.0)]);
    let claimed = claim_next(&mut ledger, "n1", true, Utc::now()).unwrap();
    assert_eq!(claimed.id, "t2");
    assert_eq!(claimed.claimed_by.as_deref(), Some("n1"));
    assert_eq!(ledger.task("t2").unwrap().status, TaskStatus::Claimed);
    assert_claim_fields_consistent(&ledger);
  }

  #[test]
  fn ties_go_to_earliest_inserted() {
    let mut ledger = ledger_with(&[("a", 3.0), ("b", 7.0), ("c", 7.0)]);
    let order: Vec<&str> = claim_order(&ledger).iter().map(|t| t.id.as_str()).collect();
    assert_eq!(order, ["b", "c", "a"]);
    assert_eq!(claim_next(&mut ledger, "n1", true, Utc::now()).unwrap().id, "b");
    assert_eq!(claim_next(&mut ledger, "n2", true, Utc::now()).unwrap().id, "c");
    assert_eq!(claim_next(&mut ledger, "n3", true, Utc::now()).unwrap().id, "a");
    assert!(claim_next(&mut ledger, "n4", true, Utc::now()).is_none());
  }

  #[test]
  fn closed_capacity_gate_claims_nothing() {
    let mut ledger = ledger_with(&[("t1", 1.0)]);
    let before = ledger.clone();
    assert!(claim_next(&mut ledger, "n1", false, Utc::now()).is_none());
    assert_eq!(ledger, before);
  }

  #[test]
  fn add_is_idempotent_by_id() {
    let mut ledger = Ledger::empty(Utc::now());
    assert_eq!(add(&mut ledger, [NewTask::new("t1", 1.0)]), 1);
    assert_eq!(add(&mut ledger, [NewTask::new("t1", 8.0)]), 0);
    assert_eq!(ledger.tasks.iter().filter(|t| t.id == "t1").count(), 1);
    assert_eq!(ledger.task("t1").unwrap().priority, 1.0);
  }

  #[test]
  fn add_skips_ids_in_any_state_and_within_batch() {
    let mut ledger = ledger_with(&[("claimed", 1.0), ("done", 1.0)]);
    let now = Utc::now();
    ledger.nodes.insert("n1".into(), Node::new("n1", now));
    claim_next(&mut ledger, "n1", true, now);
    claim_next(&mut ledger, "n1", true, now);
    assert!(complete(&mut ledger, "done", "n1", now).is_applied());

    let inserted = add(
      &mut ledger,
      [NewTask::new("claimed", 1.0), NewTask::new("done", 1.0), NewTask::new("new", 1.0), NewTask::new("new", 2.0)],
    );
    assert_eq!(inserted, 1);
    assert_eq!(ledger.tasks.len(), 3);
  }

  #[test]
  fn complete_by_non_owner_changes_nothing() {
    let mut ledger = ledger_with(&[("t1", 1.0)]);
    let now = Utc::now();
    claim_next(&mut ledger, "A", true, now);
    let before = ledger.clone();

    let outcome = complete(&mut ledger, "t1", "B", now + TimeDelta::seconds(5));
    assert_eq!(outcome, Outcome::NotOwner { owner: Some("A".into()) });
    assert_eq!(ledger, before);
    assert!(outcome.into_result("t1", "B").is_err());
  }

  #[test]
  fn complete_by_owner_records_history_and_counts() {
    let mut ledger = ledger_with(&[("t1", 1.0)]);
    let now = Utc::now();
    ledger.nodes.insert("A".into(), Node::new("A", now));
    claim_next(&mut ledger, "A", true, now);

    assert!(complete(&mut ledger, "t1", "A", now).is_applied());
    let task = ledger.task("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.completed_by.as_deref(), Some("A"));
    assert_eq!(ledger.nodes["A"].completed_tasks, 1);
    assert_eq!(complete(&mut ledger, "t1", "A", now), Outcome::AlreadyCompleted);
    assert_claim_fields_consistent(&ledger);
  }

  #[test]
  fn force_complete_ignores_owner() {
    let mut ledger = ledger_with(&[("t1", 1.0), ("t2", 1.0)]);
    let now = Utc::now();
    claim_next(&mut ledger, "A", true, now);
    assert!(force_complete(&mut ledger, "t1", "operator", now).is_applied());
    assert!(force_complete(&mut ledger, "t2", "operator", now).is_applied());
    assert_eq!(force_complete(&mut ledger, "nope", "operator", now), Outcome::UnknownTask);
    assert_eq!(ledger.count(TaskStatus::Completed), 2);
    assert_claim_fields_consistent(&ledger);
  }

  #[test]
  fn only_owner_may_release() {
    let mut ledger = ledger_with(&[("t1", 1.0)]);
    claim_next(&mut ledger, "A", true, Utc::now());
    assert_eq!(release(&mut ledger, "t1", "B"), Outcome::NotOwner { owner: Some("A".into()) });
    assert!(release(&mut ledger, "t1", "A").is_applied());
    assert_eq!(release(&mut ledger, "t1", "A"), Outcome::NotClaimed);
    assert!(ledger.task("t1").unwrap().is_available());
    assert_claim_fields_consistent(&ledger);
  }

  #[test]
  fn held_by_finds_current_claim() {
    let mut ledger = ledger_with(&[("t1", 1.0), ("t2", 2.0)]);
    claim_next(&mut ledger, "A", true, Utc::now());
    assert_eq!(held_by(&ledger, "A").map(|t| t.id.as_str()), Some("t2"));
    assert!(held_by(&ledger, "B").is_none());
  }
}
