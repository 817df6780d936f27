//! Durable home of the shared ledger.
//!
//! Reads are fail-soft: a missing or unparseable file is replaced with a fresh
//! ledger. Writes go to a sibling temp file that is renamed over the live path,
//! so neither local readers nor the sync channel ever see a half-written file.
//!
//! The store does not serialize callers. A load→mutate→save sequence must be
//! guarded by the caller (see [`crate::swarm::Swarm`]).

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Result, SwarmError};
use crate::models::{Ledger, Node, Task, TaskStatus};

pub struct LedgerStore {
  path: PathBuf,
  /// Micros of the newest `last_updated` this process has written.
  last_written: AtomicI64,
}

impl LedgerStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into(), last_written: AtomicI64::new(i64::MIN) }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn load(&self) -> Result<Ledger> {
    let raw = match fs::read(&self.path) {
      Ok(raw) => raw,
      Err(e) if e.kind() == ErrorKind::NotFound => {
        info!(path = ?self.path, "No ledger found, initializing a fresh one");
        return self.reinitialize();
      }
      Err(e) => return Err(SwarmError::io(&self.path, e)),
    };

    match decode(&raw) {
      Ok(Decoded { mut ledger, migrated, dropped }) => {
        if dropped > 0 {
          warn!(path = ?self.path, dropped, "Dropped unreadable ledger entries");
        }
        let repairs = ledger.normalize();
        if repairs > 0 {
          warn!(path = ?self.path, repairs, "Repaired inconsistent ledger entries");
        }
        if migrated {
          info!(path = ?self.path, tasks = ledger.tasks.len(), "Migrated legacy list-based ledger");
          self.save(&mut ledger)?;
        }
        Ok(ledger)
      }
      Err(reason) => {
        let err = SwarmError::LedgerCorruption { path: self.path.clone(), reason };
        warn!("{}; queued work may have been lost, reinitializing", err);
        self.reinitialize()
      }
    }
  }

  /// Read-only view for observers. Never writes, never migrates to disk.
  pub fn snapshot(&self) -> Option<Ledger> {
    let raw = fs::read(&self.path).ok()?;
    let mut ledger = decode(&raw).ok()?.ledger;
    ledger.normalize();
    Some(ledger)
  }

  pub fn save(&self, ledger: &mut Ledger) -> Result<()> {
    ledger.last_updated = self.stamp(ledger.last_updated);
    let body = serde_json::to_vec_pretty(ledger)?;

    if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
      fs::create_dir_all(dir).map_err(|e| SwarmError::io(dir, e))?;
    }
    let tmp = self.temp_path();
    let mut file = File::create(&tmp).map_err(|e| SwarmError::io(&tmp, e))?;
    file.write_all(&body).map_err(|e| SwarmError::io(&tmp, e))?;
    file.sync_all().map_err(|e| SwarmError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, &self.path).map_err(|e| SwarmError::io(&self.path, e))?;
    debug!(path = ?self.path, last_updated = %ledger.last_updated, "Ledger saved");
    Ok(())
  }

  fn reinitialize(&self) -> Result<Ledger> {
    let mut ledger = Ledger::empty(Utc::now());
    self.save(&mut ledger)?;
    Ok(ledger)
  }

  fn temp_path(&self) -> PathBuf {
    let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    self.path.with_file_name(name)
  }

  /// Next `last_updated`: never behind the wall clock, the ledger's own stamp,
  /// or anything this process wrote before.
  fn stamp(&self, previous: DateTime<Utc>) -> DateTime<Utc> {
    let candidate = Utc::now().timestamp_micros().max(previous.timestamp_micros());
    let prior = self.last_written.fetch_max(candidate, Ordering::SeqCst);
    let micros = candidate.max(prior);
    DateTime::from_timestamp_micros(micros).unwrap_or(previous)
  }
}

struct Decoded {
  ledger: Ledger,
  migrated: bool,
  /// Entries skipped because they could not be read at all.
  dropped: usize,
}

/// Only a document that is not a JSON object counts as corrupt. Inside an
/// object, an unreadable entry costs itself and nothing else.
fn decode(raw: &[u8]) -> std::result::Result<Decoded, String> {
  let value: Value = serde_json::from_slice(raw).map_err(|e| e.to_string())?;
  let Value::Object(doc) = value else {
    return Err("top level is not an object".into());
  };
  if doc.contains_key("tasks") || !doc.contains_key("queue") {
    return Ok(decode_entries(doc));
  }
  migrate_legacy(doc).map(|ledger| Decoded { ledger, migrated: true, dropped: 0 })
}

fn decode_entries(mut doc: Map<String, Value>) -> Decoded {
  let mut dropped = 0;

  let mut nodes = BTreeMap::new();
  match doc.remove("nodes") {
    Some(Value::Object(map)) => {
      for (id, raw) in map {
        match serde_json::from_value::<Node>(raw) {
          Ok(node) => {
            nodes.insert(id, node);
          }
          Err(e) => {
            warn!(node_id = %id, "Skipping unreadable node entry: {}", e);
            dropped += 1;
          }
        }
      }
    }
    None | Some(Value::Null) => {}
    Some(other) => {
      warn!("Ignoring nodes field that is not an object: {}", other);
      dropped += 1;
    }
  }

  let mut tasks = Vec::new();
  match doc.remove("tasks") {
    Some(Value::Array(entries)) => {
      for (position, raw) in entries.into_iter().enumerate() {
        match serde_json::from_value::<Task>(raw) {
          Ok(task) => tasks.push(task),
          Err(e) => {
            warn!(position, "Skipping unreadable task entry: {}", e);
            dropped += 1;
          }
        }
      }
    }
    None | Some(Value::Null) => {}
    Some(other) => {
      warn!("Ignoring tasks field that is not a list: {}", other);
      dropped += 1;
    }
  }

  let last_updated = timestamp_field(doc.remove("last_updated"));
  Decoded { ledger: Ledger { nodes, tasks, last_updated }, migrated: false, dropped }
}

fn timestamp_field(value: Option<Value>) -> DateTime<Utc> {
  value
    .and_then(|v| serde_json::from_value::<Ledger>(serde_json::json!({ "last_updated": v })).ok())
    .map(|l| l.last_updated)
    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Converts the older encodings, which kept separate pending/active/completed
/// lists, into the single per-task-status schema.
fn migrate_legacy(mut doc: Map<String, Value>) -> std::result::Result<Ledger, String> {
  let nodes = legacy_nodes(doc.remove("nodes").unwrap_or(Value::Null))?;
  let mut tasks = Vec::new();

  match doc.remove("queue") {
    Some(Value::Object(mut lists)) => {
      for (key, status) in [
        ("completed", TaskStatus::Completed),
        ("active", TaskStatus::Claimed),
        ("pending", TaskStatus::Available),
      ] {
        for entry in as_array(lists.remove(key)) {
          tasks.push(legacy_task(entry, status)?);
        }
      }
    }
    Some(Value::Array(entries)) => {
      for entry in entries {
        tasks.push(legacy_task(entry, TaskStatus::Available)?);
      }
    }
    _ => {}
  }
  for entry in as_array(doc.remove("completed")) {
    tasks.push(legacy_task(entry, TaskStatus::Completed)?);
  }

  // Active entries in the list encoding only carried a URL; the owner is
  // whichever node reported it as its current task.
  for task in tasks.iter_mut().filter(|t| t.status == TaskStatus::Claimed) {
    if task.claimed_by.is_none() {
      if let Some(owner) = nodes.values().find(|n| n.current_task.as_deref() == Some(task.id.as_str())) {
        task.claimed_by = Some(owner.id.clone());
        task.claimed_at = Some(owner.last_seen);
      }
    }
  }

  let last_updated = timestamp_field(doc.remove("last_updated"));

  Ok(Ledger { nodes, tasks, last_updated })
}

fn as_array(value: Option<Value>) -> Vec<Value> {
  match value {
    Some(Value::Array(items)) => items,
    _ => Vec::new(),
  }
}

fn legacy_nodes(value: Value) -> std::result::Result<BTreeMap<String, Node>, String> {
  let mut nodes = BTreeMap::new();
  match value {
    Value::Object(map) => {
      for (id, raw) in map {
        let mut node: Node = serde_json::from_value(raw).map_err(|e| e.to_string())?;
        node.id = id.clone();
        nodes.insert(id, node);
      }
    }
    Value::Array(items) => {
      for raw in items {
        let id = raw
          .get("device_id")
          .or_else(|| raw.get("id"))
          .and_then(Value::as_str)
          .map(String::from);
        let Some(id) = id else { continue };
        let mut node: Node = serde_json::from_value(raw).map_err(|e| e.to_string())?;
        node.id = id.clone();
        nodes.insert(id, node);
      }
    }
    _ => {}
  }
  Ok(nodes)
}

fn legacy_task(entry: Value, status: TaskStatus) -> std::result::Result<Task, String> {
  match entry {
    Value::String(url) => Ok(Task {
      id: url.clone(),
      title: url.clone(),
      url,
      priority: 0.0,
      status,
      claimed_by: None,
      claimed_at: None,
      completed_by: None,
      completed_at: None,
    }),
    Value::Object(mut map) => {
      if status == TaskStatus::Completed || !map.contains_key("status") {
        map.insert("status".into(), Value::String(status.to_string()));
      }
      serde_json::from_value(Value::Object(map)).map_err(|e| e.to_string())
    }
    other => Err(format!("unexpected legacy queue entry: {}", other)),
  }
}
