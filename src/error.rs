use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
  /// Channel or network failure while propagating the ledger. Retried, never fatal.
  #[error("sync via {channel} failed: {reason}")]
  TransientSync { channel: &'static str, reason: String },

  /// The persisted ledger could not be parsed. Recovered by reinitializing.
  #[error("ledger at {path:?} is malformed: {reason}")]
  LedgerCorruption { path: PathBuf, reason: String },

  #[error("node {node_id} does not own task {task_id}")]
  OwnershipViolation { task_id: String, node_id: String },

  #[error("capacity {level}% is below the {threshold}% threshold")]
  Capacity { level: u8, threshold: u8 },

  #[error("ledger I/O failed at {path:?}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to encode ledger: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("invalid configuration: {0}")]
  Config(String),
}

impl SwarmError {
  pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    Self::Io { path: path.into(), source }
  }

  pub fn sync(channel: &'static str, reason: impl Into<String>) -> Self {
    Self::TransientSync { channel, reason: reason.into() }
  }

  /// Whether the failure only affects the current attempt.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::TransientSync { .. } | Self::LedgerCorruption { .. })
  }
}

pub type Result<T> = std::result::Result<T, SwarmError>;
