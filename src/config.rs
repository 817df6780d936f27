use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, SwarmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMethod {
  /// Commit and push the ledger through a git remote.
  Git,
  /// Copy the ledger to and from an object store with rclone.
  Rclone,
  /// An external peer sync daemon (e.g. Syncthing) propagates the directory.
  Syncthing,
}

impl FromStr for SyncMethod {
  type Err = SwarmError;

  fn from_str(raw: &str) -> Result<Self> {
    match raw.trim().to_ascii_lowercase().as_str() {
      "git" => Ok(Self::Git),
      "rclone" | "object" | "s3" => Ok(Self::Rclone),
      "syncthing" | "peer" => Ok(Self::Syncthing),
      other => Err(SwarmError::Config(format!("unknown sync method '{}'", other))),
    }
  }
}

impl fmt::Display for SyncMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Git => f.write_str("git"),
      Self::Rclone => f.write_str("rclone"),
      Self::Syncthing => f.write_str("syncthing"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct Config {
  pub node_id: String,
  pub ledger_path: PathBuf,
  pub sync_method: SyncMethod,
  pub git_dir: PathBuf,
  pub object_remote: String,
  pub heartbeat_interval: Duration,
  pub idle_heartbeat_interval: Duration,
  pub cleanup_interval: Duration,
  pub node_stale_after: Duration,
  pub task_timeout: Duration,
  pub min_capacity: u8,
  pub sync_timeout: Duration,
  pub push_attempts: usize,
  pub error_backoff: Duration,
  pub shutdown_grace: Duration,
  pub capabilities: Vec<String>,
  pub executor_cmd: Option<String>,
  pub discovery_file: Option<PathBuf>,
  pub discovery_interval: Duration,
}

impl Default for Config {
  fn default() -> Self {
    let ledger_path = PathBuf::from("sync/ledger.json");
    Self {
      node_id: String::new(),
      git_dir: ledger_dir(&ledger_path),
      ledger_path,
      sync_method: SyncMethod::Git,
      object_remote: "remote:otatm".into(),
      heartbeat_interval: Duration::from_secs(30),
      idle_heartbeat_interval: Duration::from_secs(240),
      cleanup_interval: Duration::from_secs(300),
      node_stale_after: Duration::from_secs(300),
      task_timeout: Duration::from_secs(600),
      min_capacity: 20,
      sync_timeout: Duration::from_secs(30),
      push_attempts: 3,
      error_backoff: Duration::from_secs(30),
      shutdown_grace: Duration::from_secs(5),
      capabilities: Vec::new(),
      executor_cmd: None,
      discovery_file: None,
      discovery_interval: Duration::from_secs(60),
    }
  }
}

impl Config {
  /// Reads `SWARM_*` variables. Bad values fall back to the default with a warning.
  /// Call [`Config::ensure_node_id`] once any overrides have been applied.
  pub fn from_env() -> Self {
    let defaults = Self::default();
    let ledger_path = env::var("SWARM_LEDGER_PATH")
      .map(PathBuf::from)
      .unwrap_or(defaults.ledger_path);
    let git_dir = env::var("SWARM_GIT_DIR")
      .map(PathBuf::from)
      .unwrap_or_else(|_| ledger_dir(&ledger_path));

    let config = Self {
      node_id: env::var("SWARM_NODE_ID").unwrap_or_default(),
      sync_method: parsed("SWARM_SYNC_METHOD", defaults.sync_method),
      object_remote: env::var("SWARM_RCLONE_REMOTE").unwrap_or(defaults.object_remote),
      heartbeat_interval: secs("SWARM_HEARTBEAT_SECS", defaults.heartbeat_interval),
      idle_heartbeat_interval: secs("SWARM_IDLE_HEARTBEAT_SECS", defaults.idle_heartbeat_interval),
      cleanup_interval: secs("SWARM_CLEANUP_SECS", defaults.cleanup_interval),
      node_stale_after: secs("SWARM_NODE_STALE_SECS", defaults.node_stale_after),
      task_timeout: secs("SWARM_TASK_TIMEOUT_SECS", defaults.task_timeout),
      min_capacity: parsed("SWARM_MIN_CAPACITY", defaults.min_capacity),
      sync_timeout: secs("SWARM_SYNC_TIMEOUT_SECS", defaults.sync_timeout),
      push_attempts: parsed("SWARM_PUSH_ATTEMPTS", defaults.push_attempts).max(1),
      capabilities: env::var("SWARM_CAPABILITIES")
        .map(|raw| split_list(&raw))
        .unwrap_or_default(),
      executor_cmd: env::var("SWARM_EXECUTOR_CMD").ok().filter(|c| !c.trim().is_empty()),
      discovery_file: env::var("SWARM_DISCOVERY_FILE").ok().map(PathBuf::from),
      discovery_interval: secs("SWARM_DISCOVERY_SECS", defaults.discovery_interval),
      ledger_path,
      git_dir,
      ..defaults
    };
    config.check_horizons();
    config
  }

  /// Fills in the node id from `<ledger dir>/.node_id` unless one was given.
  pub fn ensure_node_id(mut self) -> Result<Self> {
    if self.node_id.is_empty() {
      self.node_id = resolve_node_id(&self.ledger_dir())?;
    }
    Ok(self)
  }

  /// Re-points the ledger, keeping the git directory in step unless it was set explicitly.
  pub fn with_ledger_path(mut self, path: PathBuf) -> Self {
    if self.git_dir == ledger_dir(&self.ledger_path) {
      self.git_dir = ledger_dir(&path);
    }
    self.ledger_path = path;
    self
  }

  pub fn ledger_dir(&self) -> PathBuf {
    ledger_dir(&self.ledger_path)
  }

  fn check_horizons(&self) {
    if self.node_stale_after >= self.task_timeout {
      warn!(
        node_stale_secs = self.node_stale_after.as_secs(),
        task_timeout_secs = self.task_timeout.as_secs(),
        "Node staleness horizon should be shorter than the task timeout"
      );
    }
  }
}

fn ledger_dir(path: &Path) -> PathBuf {
  match path.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
    _ => PathBuf::from("."),
  }
}

fn parsed<T: FromStr + fmt::Display>(key: &str, default: T) -> T {
  match env::var(key) {
    Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
      warn!("Ignoring invalid {}={:?}, using {}", key, raw, default);
      default
    }),
    Err(_) => default,
  }
}

fn secs(key: &str, default: Duration) -> Duration {
  Duration::from_secs(parsed(key, default.as_secs()))
}

fn split_list(raw: &str) -> Vec<String> {
  raw
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(String::from)
    .collect()
}

/// Returns the id stored in `<dir>/.node_id`, creating one on first use so a
/// restarted process keeps its identity in the ledger.
pub fn resolve_node_id(dir: &Path) -> Result<String> {
  let id_file = dir.join(".node_id");
  if let Ok(existing) = std::fs::read_to_string(&id_file) {
    let existing = existing.trim();
    if !existing.is_empty() {
      return Ok(existing.to_string());
    }
  }
  let simple = Uuid::new_v4().simple().to_string();
  let id = format!("node-{}", &simple[..8]);
  std::fs::create_dir_all(dir).map_err(|e| SwarmError::io(dir, e))?;
  std::fs::write(&id_file, &id).map_err(|e| SwarmError::io(&id_file, e))?;
  Ok(id)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sync_method_parses_aliases() {
    assert_eq!("GIT".parse::<SyncMethod>().unwrap(), SyncMethod::Git);
    assert_eq!("s3".parse::<SyncMethod>().unwrap(), SyncMethod::Rclone);
    assert_eq!("peer".parse::<SyncMethod>().unwrap(), SyncMethod::Syncthing);
    assert!("carrier-pigeon".parse::<SyncMethod>().is_err());
  }

  #[test]
  fn node_id_is_persisted_once() {
    let dir = tempfile::tempdir().unwrap();
    let first = resolve_node_id(dir.path()).unwrap();
    let second = resolve_node_id(dir.path()).unwrap();
    assert!(first.starts_with("node-"));
    assert_eq!(first.len(), "node-".len() + 8);
    assert_eq!(first, second);
  }

  #[test]
  fn default_horizons_keep_nodes_shorter_than_tasks() {
    let config = Config::default();
    assert!(config.node_stale_after < config.task_timeout);
    assert!(config.heartbeat_interval < config.idle_heartbeat_interval);
    assert_eq!(config.git_dir, PathBuf::from("sync"));
  }

  #[test]
  fn ledger_path_moves_git_dir_along() {
    let config = Config::default().with_ledger_path(PathBuf::from("/tmp/shared/ledger.json"));
    assert_eq!(config.git_dir, PathBuf::from("/tmp/shared"));
    let bare = Config::default().with_ledger_path(PathBuf::from("ledger.json"));
    assert_eq!(bare.ledger_dir(), PathBuf::from("."));
  }
}
