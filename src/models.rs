use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
  #[default]
  Idle,
  Working,
  Offline,
}

impl NodeStatus {
  pub fn parse(raw: &str) -> Self {
    match raw.trim().to_ascii_lowercase().as_str() {
      "working" | "busy" => Self::Working,
      "offline" | "stopped" => Self::Offline,
      _ => Self::Idle,
    }
  }
}

impl fmt::Display for NodeStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Idle => "idle",
      Self::Working => "working",
      Self::Offline => "offline",
    };
    f.write_str(s)
  }
}

impl<'de> Deserialize<'de> for NodeStatus {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    Ok(lenient::opt_text(deserializer)?.as_deref().map(Self::parse).unwrap_or_default())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  #[default]
  Available,
  Claimed,
  Completed,
}

impl TaskStatus {
  /// Accepts the legacy list names (`pending`, `active`) as well.
  pub fn parse(raw: &str) -> Self {
    match raw.trim().to_ascii_lowercase().as_str() {
      "claimed" | "active" => Self::Claimed,
      "completed" | "done" => Self::Completed,
      _ => Self::Available,
    }
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Available => "available",
      Self::Claimed => "claimed",
      Self::Completed => "completed",
    };
    f.write_str(s)
  }
}

impl<'de> Deserialize<'de> for TaskStatus {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    Ok(lenient::opt_text(deserializer)?.as_deref().map(Self::parse).unwrap_or_default())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
  #[serde(default, deserialize_with = "lenient::text")]
  pub id: String,
  #[serde(default = "epoch", deserialize_with = "lenient::timestamp")]
  pub last_seen: DateTime<Utc>,
  #[serde(default)]
  pub status: NodeStatus,
  #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::opt_text")]
  pub current_task: Option<String>,
  #[serde(default = "full_capacity", alias = "battery_level", alias = "battery", deserialize_with = "lenient::percent")]
  pub capacity: u8,
  #[serde(default, deserialize_with = "lenient::list")]
  pub capabilities: Vec<String>,
  #[serde(default, deserialize_with = "lenient::count")]
  pub completed_tasks: u64,
}

impl Node {
  pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
    Self {
      id: id.into(),
      last_seen: now,
      status: NodeStatus::Idle,
      current_task: None,
      capacity: 100,
      capabilities: Vec::new(),
      completed_tasks: 0,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
  #[serde(default, deserialize_with = "lenient::text")]
  pub id: String,
  #[serde(default, deserialize_with = "lenient::text")]
  pub title: String,
  #[serde(default, deserialize_with = "lenient::text")]
  pub url: String,
  #[serde(default, deserialize_with = "lenient::priority")]
  pub priority: f64,
  #[serde(default)]
  pub status: TaskStatus,
  #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::opt_text")]
  pub claimed_by: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::opt_timestamp")]
  pub claimed_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::opt_text")]
  pub completed_by: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient::opt_timestamp")]
  pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
  pub fn is_available(&self) -> bool {
    self.status == TaskStatus::Available
  }

  pub fn is_claimed_by(&self, node_id: &str) -> bool {
    self.status == TaskStatus::Claimed && self.claimed_by.as_deref() == Some(node_id)
  }

  /// Repairs the claim fields so they are present iff the task is claimed.
  /// Returns true if anything changed.
  fn repair(&mut self) -> bool {
    match self.status {
      TaskStatus::Claimed if self.claimed_by.is_none() || self.claimed_at.is_none() => {
        self.status = TaskStatus::Available;
        self.claimed_by = None;
        self.claimed_at = None;
        true
      }
      TaskStatus::Claimed => false,
      _ if self.claimed_by.is_some() || self.claimed_at.is_some() => {
        self.claimed_by = None;
        self.claimed_at = None;
        true
      }
      _ => false,
    }
  }
}

/// A task as produced by discovery or the CLI, before it enters the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
  pub id: String,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub url: String,
  #[serde(default)]
  pub priority: f64,
}

impl NewTask {
  pub fn new(id: impl Into<String>, priority: f64) -> Self {
    let id = id.into();
    Self { title: id.clone(), url: String::new(), id, priority }
  }

  pub fn into_task(self) -> Task {
    Task {
      title: if self.title.is_empty() { self.id.clone() } else { self.title },
      id: self.id,
      url: self.url,
      priority: self.priority,
      status: TaskStatus::Available,
      claimed_by: None,
      claimed_at: None,
      completed_by: None,
      completed_at: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
  #[serde(default)]
  pub nodes: BTreeMap<String, Node>,
  #[serde(default)]
  pub tasks: Vec<Task>,
  #[serde(default = "epoch", deserialize_with = "lenient::timestamp")]
  pub last_updated: DateTime<Utc>,
}

impl Ledger {
  pub fn empty(now: DateTime<Utc>) -> Self {
    Self { nodes: BTreeMap::new(), tasks: Vec::new(), last_updated: now }
  }

  pub fn task(&self, task_id: &str) -> Option<&Task> {
    self.tasks.iter().find(|t| t.id == task_id)
  }

  pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
    self.tasks.iter_mut().find(|t| t.id == task_id)
  }

  pub fn count(&self, status: TaskStatus) -> usize {
    self.tasks.iter().filter(|t| t.status == status).count()
  }

  /// Enforces the persisted-snapshot invariants on data of unknown origin.
  /// Returns the number of repairs made.
  pub fn normalize(&mut self) -> usize {
    let mut repairs = 0;
    for (key, node) in self.nodes.iter_mut() {
      if node.id != *key {
        node.id = key.clone();
        repairs += 1;
      }
    }

    let mut seen = HashSet::new();
    let before = self.tasks.len();
    self.tasks.retain(|t| !t.id.is_empty() && seen.insert(t.id.clone()));
    repairs += before - self.tasks.len();

    repairs += self.tasks.iter_mut().map(Task::repair).filter(|fixed| *fixed).count();
    repairs
  }
}

fn epoch() -> DateTime<Utc> {
  DateTime::<Utc>::UNIX_EPOCH
}

fn full_capacity() -> u8 {
  100
}

/// Deserializers that degrade to a safe default instead of rejecting the ledger.
mod lenient {
  use chrono::{DateTime, Utc};
  use serde::{Deserialize, Deserializer};
  use serde_json::Value;

  fn parse(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
      .map(|dt| dt.with_timezone(&Utc))
      .ok()
      .or_else(|| {
        chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
          .ok()
          .map(|naive| naive.and_utc())
      })
  }

  pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    Ok(opt_timestamp(d)?.unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
  }

  pub fn opt_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let raw = Option::<Value>::deserialize(d)?;
    Ok(raw.as_ref().and_then(Value::as_str).and_then(parse))
  }

  pub fn percent<'de, D: Deserializer<'de>>(d: D) -> Result<u8, D::Error> {
    let raw = Option::<Value>::deserialize(d)?;
    Ok(
      raw
        .as_ref()
        .and_then(Value::as_f64)
        .map(|v| v.clamp(0.0, 100.0) as u8)
        .unwrap_or(100),
    )
  }

  pub fn priority<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let raw = Option::<Value>::deserialize(d)?;
    Ok(raw.as_ref().and_then(Value::as_f64).filter(|v| v.is_finite()).unwrap_or(0.0))
  }

  /// Strings pass through and numbers are spelled out; anything else is absent.
  fn as_text(value: Value) -> Option<String> {
    match value {
      Value::String(s) => Some(s),
      Value::Number(n) => Some(n.to_string()),
      _ => None,
    }
  }

  pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(opt_text(d)?.unwrap_or_default())
  }

  pub fn opt_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?.and_then(as_text))
  }

  pub fn list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    match Option::<Value>::deserialize(d)? {
      Some(Value::Array(items)) => Ok(items.into_iter().filter_map(as_text).collect()),
      _ => Ok(Vec::new()),
    }
  }

  pub fn count<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let raw = Option::<Value>::deserialize(d)?;
    Ok(
      raw
        .as_ref()
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f as u64)))
        .unwrap_or(0),
    )
  }
}
