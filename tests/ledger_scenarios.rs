use std::path::Path;
use std::time::Duration;

use chrono::TimeDelta;
use tokio_test::assert_ok;

use swarmledger::config::{Config, SyncMethod};
use swarmledger::ledger_store::LedgerStore;
use swarmledger::models::{Ledger, NewTask, NodeStatus, TaskStatus};
use swarmledger::node_registry::Presence;
use swarmledger::swarm::{ClaimResult, Swarm};
use swarmledger::task_queue::Outcome;

/// Nodes share one ledger file; peer sync is a no-op so no tooling is needed.
fn node(dir: &Path, node_id: &str) -> Swarm {
  let mut config = Config::default().with_ledger_path(dir.join("ledger.json"));
  config.node_id = node_id.into();
  config.sync_method = SyncMethod::Syncthing;
  config.node_stale_after = Duration::from_secs(300);
  config.task_timeout = Duration::from_secs(600);
  Swarm::new(config)
}

fn charged() -> Presence {
  Presence::idle(100, vec!["linux".into()])
}

fn claimed_id(result: ClaimResult) -> String {
  match result {
    ClaimResult::Claimed(task) => task.id,
    other => panic!("expected a claim, got {:?}", other),
  }
}

fn assert_claim_fields_consistent(ledger: &Ledger) {
  for task in &ledger.tasks {
    let claimed = task.status == TaskStatus::Claimed;
    assert_eq!(claimed, task.claimed_by.is_some(), "claimed_by out of step on {}", task.id);
    assert_eq!(claimed, task.claimed_at.is_some(), "claimed_at out of step on {}", task.id);
  }
}

#[tokio::test]
async fn highest_priority_task_is_claimed_first() {
  let dir = tempfile::tempdir().unwrap();
  let n1 = node(dir.path(), "n1");

  let inserted = assert_ok!(n1.add(vec![NewTask::new("t1", 5.0), NewTask::new("t2", 9.0)]).await);
  assert_eq!(inserted, 2);

  let first = claimed_id(assert_ok!(n1.claim(&charged()).await));
  assert_eq!(first, "t2");

  let ledger = n1.store().snapshot().unwrap();
  assert_eq!(ledger.nodes["n1"].status, NodeStatus::Working);
  assert_eq!(ledger.nodes["n1"].current_task.as_deref(), Some("t2"));
  assert_claim_fields_consistent(&ledger);
}

#[tokio::test]
async fn one_claim_per_node_and_no_double_claims() {
  let dir = tempfile::tempdir().unwrap();
  let n1 = node(dir.path(), "n1");
  let n2 = node(dir.path(), "n2");
  assert_ok!(n1.add(vec![NewTask::new("t1", 1.0), NewTask::new("t2", 1.0)]).await);

  assert_eq!(claimed_id(assert_ok!(n1.claim(&charged()).await)), "t1");
  match assert_ok!(n1.claim(&charged()).await) {
    ClaimResult::AlreadyHolding(task) => assert_eq!(task.id, "t1"),
    other => panic!("expected the held task back, got {:?}", other),
  }
  assert_eq!(claimed_id(assert_ok!(n2.claim(&charged()).await)), "t2");
  assert!(matches!(
    assert_ok!(n2.claim(&charged()).await),
    ClaimResult::AlreadyHolding(task) if task.id == "t2"
  ));

  let n3 = node(dir.path(), "n3");
  assert_eq!(assert_ok!(n3.claim(&charged()).await), ClaimResult::NoneAvailable);
}

#[tokio::test]
async fn low_capacity_node_does_not_claim() {
  let dir = tempfile::tempdir().unwrap();
  let n1 = node(dir.path(), "n1");
  assert_ok!(n1.add(vec![NewTask::new("t1", 1.0)]).await);

  let drained = Presence::idle(5, vec![]);
  assert_eq!(
    assert_ok!(n1.claim(&drained).await),
    ClaimResult::CapacityTooLow { level: 5, threshold: 20 }
  );
  assert_eq!(n1.store().snapshot().unwrap().task("t1").unwrap().status, TaskStatus::Available);
}

#[tokio::test]
async fn abandoned_claim_returns_to_the_queue() {
  let dir = tempfile::tempdir().unwrap();
  let n1 = node(dir.path(), "n1");
  let n2 = node(dir.path(), "n2");
  assert_ok!(n1.add(vec![NewTask::new("t0", 1.0), NewTask::new("t1", 9.0)]).await);
  assert_eq!(claimed_id(assert_ok!(n1.claim(&charged()).await)), "t1");

  // Rewind the claim to T0 = now - 700s and drop n1 from the registry.
  assert_ok!(
    n1.transact(|ledger, now| {
      ledger.task_mut("t1").unwrap().claimed_at = Some(now - TimeDelta::seconds(700));
      ledger.nodes.remove("n1");
    })
    .await
  );

  let report = assert_ok!(n2.sweep().await);
  assert_eq!(report.reclaimed, vec!["t1".to_string()]);

  let ledger = n2.store().snapshot().unwrap();
  let t1 = ledger.task("t1").unwrap();
  assert_eq!(t1.status, TaskStatus::Available);
  assert_eq!(t1.claimed_by, None);
  assert_eq!(ledger.tasks[0].id, "t1");
  assert_claim_fields_consistent(&ledger);

  assert_eq!(claimed_id(assert_ok!(n2.claim(&charged()).await)), "t1");
}

#[tokio::test]
async fn offline_owner_loses_its_claim_on_the_next_sweep() {
  let dir = tempfile::tempdir().unwrap();
  let n1 = node(dir.path(), "n1");
  let n2 = node(dir.path(), "n2");
  assert_ok!(n1.add(vec![NewTask::new("t1", 1.0)]).await);
  assert_eq!(claimed_id(assert_ok!(n1.claim(&charged()).await)), "t1");

  let farewell = Presence { status: NodeStatus::Offline, ..charged() };
  assert_ok!(n1.heartbeat(&farewell).await);

  let report = assert_ok!(n2.sweep().await);
  assert_eq!(report.pruned, vec!["n1".to_string()]);
  assert_eq!(report.reclaimed, vec!["t1".to_string()]);
}

#[tokio::test]
async fn duplicate_adds_keep_a_single_entry() {
  let dir = tempfile::tempdir().unwrap();
  let n1 = node(dir.path(), "n1");
  let n2 = node(dir.path(), "n2");

  assert_eq!(assert_ok!(n1.add(vec![NewTask::new("t1", 1.0)]).await), 1);
  assert_eq!(assert_ok!(n2.add(vec![NewTask::new("t1", 7.0)]).await), 0);

  let ledger = n1.store().snapshot().unwrap();
  assert_eq!(ledger.tasks.iter().filter(|t| t.id == "t1").count(), 1);
  assert_eq!(ledger.task("t1").unwrap().priority, 1.0);
}

#[tokio::test]
async fn working_node_is_visible_then_pruned_after_the_horizon() {
  let dir = tempfile::tempdir().unwrap();
  let n1 = node(dir.path(), "n1");
  let observer = node(dir.path(), "observer");

  let working = Presence { status: NodeStatus::Working, current_task: Some("t1".into()), ..charged() };
  assert_ok!(n1.heartbeat(&working).await);

  let status = assert_ok!(n1.status().await);
  assert_eq!(status.active_nodes, 1);
  let ledger = n1.store().snapshot().unwrap();
  assert_eq!(ledger.nodes["n1"].current_task.as_deref(), Some("t1"));

  // Age the last heartbeat past the 300s horizon.
  assert_ok!(
    n1.transact(|ledger, now| {
      ledger.nodes.get_mut("n1").unwrap().last_seen = now - TimeDelta::seconds(301);
    })
    .await
  );
  let status = assert_ok!(observer.status().await);
  assert_eq!(status.active_nodes, 0);
  assert_eq!(status.total_nodes, 1);

  let report = assert_ok!(observer.sweep().await);
  assert_eq!(report.pruned, vec!["n1".to_string()]);
  assert!(!observer.store().snapshot().unwrap().nodes.contains_key("n1"));
}

#[tokio::test]
async fn completion_respects_ownership_unless_forced() {
  let dir = tempfile::tempdir().unwrap();
  let n1 = node(dir.path(), "n1");
  let n2 = node(dir.path(), "n2");
  assert_ok!(n1.add(vec![NewTask::new("t1", 1.0), NewTask::new("t2", 0.5)]).await);
  assert_eq!(claimed_id(assert_ok!(n1.claim(&charged()).await)), "t1");

  let rejected = assert_ok!(n2.complete("t1", false).await);
  assert_eq!(rejected.outcome, Outcome::NotOwner { owner: Some("n1".into()) });
  assert_eq!(rejected.before, rejected.after);
  assert!(assert_ok!(n2.release("t1").await) != Outcome::Applied);

  let done = assert_ok!(n1.complete("t1", false).await);
  assert_eq!(done.outcome, Outcome::Applied);
  let after = done.after.unwrap();
  assert_eq!(after.status, TaskStatus::Completed);
  assert_eq!(after.completed_by.as_deref(), Some("n1"));

  let ledger = n1.store().snapshot().unwrap();
  assert_eq!(ledger.nodes["n1"].completed_tasks, 1);
  assert_eq!(ledger.nodes["n1"].status, NodeStatus::Idle);
  assert_eq!(ledger.nodes["n1"].current_task, None);

  // Operator override finishes a task nobody has claimed.
  let forced = assert_ok!(n2.complete("t2", true).await);
  assert_eq!(forced.outcome, Outcome::Applied);
  assert_eq!(forced.before.unwrap().status, TaskStatus::Available);
  assert_eq!(assert_ok!(n2.complete("t2", true).await).outcome, Outcome::AlreadyCompleted);
  assert_claim_fields_consistent(&n2.store().snapshot().unwrap());
}

#[tokio::test]
async fn released_task_can_be_claimed_again() {
  let dir = tempfile::tempdir().unwrap();
  let n1 = node(dir.path(), "n1");
  let n2 = node(dir.path(), "n2");
  assert_ok!(n1.add(vec![NewTask::new("t1", 1.0)]).await);
  claimed_id(assert_ok!(n1.claim(&charged()).await));

  assert_eq!(assert_ok!(n1.release("t1").await), Outcome::Applied);
  assert_eq!(claimed_id(assert_ok!(n2.claim(&charged()).await)), "t1");
}

#[tokio::test]
async fn health_reports_progress() {
  let dir = tempfile::tempdir().unwrap();
  let n1 = node(dir.path(), "n1");
  assert_ok!(n1.add(vec![NewTask::new("t1", 2.0), NewTask::new("t2", 1.0)]).await);
  assert_ok!(n1.heartbeat(&charged()).await);
  claimed_id(assert_ok!(n1.claim(&charged()).await));
  assert_ok!(n1.complete("t1", false).await);

  let health = assert_ok!(n1.health().await);
  assert_eq!(health.node_health, 1.0);
  assert_eq!(health.task_progress, 0.5);
  assert_eq!(health.pending_tasks, 1);
  assert_eq!(health.our_status, NodeStatus::Idle);
}

#[test]
fn saving_a_loaded_ledger_preserves_it() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("ledger.json");
  std::fs::write(
    &path,
    r#"{
      "nodes": {
        "n1": {"id": "n1", "last_seen": "2024-05-01T10:00:00Z", "status": "working",
               "current_task": "t1", "capacity": 80, "capabilities": ["linux"], "completed_tasks": 3}
      },
      "tasks": [
        {"id": "t1", "title": "One", "url": "https://x/1", "priority": 2.5, "status": "claimed",
         "claimed_by": "n1", "claimed_at": "2024-05-01T09:59:00Z"},
        {"id": "t2", "title": "Two", "priority": 1, "status": "available"},
        {"id": "t3", "title": "Three", "priority": 0, "status": "completed",
         "completed_by": "n1", "completed_at": "2024-05-01T09:00:00Z"}
      ],
      "last_updated": "2024-05-01T10:00:00Z"
    }"#,
  )
  .unwrap();

  let store = LedgerStore::new(&path);
  let mut first = store.load().unwrap();
  let loaded = first.clone();
  store.save(&mut first).unwrap();
  let second = store.load().unwrap();

  assert_eq!(second.nodes, loaded.nodes);
  assert_eq!(second.tasks, loaded.tasks);
  assert!(second.last_updated >= loaded.last_updated);
  assert_claim_fields_consistent(&second);
}

#[test]
fn corrupt_ledger_is_replaced_with_an_empty_one() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("ledger.json");
  std::fs::write(&path, "{ this is not json").unwrap();

  let ledger = LedgerStore::new(&path).load().unwrap();
  assert!(ledger.nodes.is_empty());
  assert!(ledger.tasks.is_empty());
  let on_disk: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
  assert!(on_disk.get("tasks").is_some());
}
