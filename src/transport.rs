//! Propagation of the ledger file between nodes.
//!
//! Every channel is best effort and last-write-wins: a pull replaces the local
//! ledger with whatever the channel currently holds, and a push publishes the
//! local file as a whole. Nothing here merges concurrent edits, and nothing
//! orders pushes across nodes.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};

use crate::config::{Config, SyncMethod};
use crate::error::{Result, SwarmError};

/// 1s, 2s, 4s, ... between push attempts.
const BACKOFF_BASE: u64 = 2;
const BACKOFF_FACTOR: u64 = 500;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[async_trait]
pub trait SyncTransport: Send + Sync {
  fn name(&self) -> &'static str;

  /// Fetches the shared ledger into the local path.
  async fn pull(&self) -> Result<()>;

  /// Publishes the local ledger. A failure never rolls back local state.
  async fn push(&self) -> Result<()>;
}

pub fn build_transport(config: &Config) -> Arc<dyn SyncTransport> {
  match config.sync_method {
    SyncMethod::Git => Arc::new(GitChannel::new(config)),
    SyncMethod::Rclone => Arc::new(ObjectStoreChannel::new(config)),
    SyncMethod::Syncthing => Arc::new(PeerSyncChannel),
  }
}

async fn run_tool(
  channel: &'static str,
  program: &str,
  args: &[&str],
  dir: Option<&Path>,
  limit: Duration,
) -> Result<Output> {
  let mut cmd = Command::new(program);
  cmd.args(args).kill_on_drop(true);
  if let Some(dir) = dir {
    cmd.current_dir(dir);
  }
  let output = tokio::time::timeout(limit, cmd.output())
    .await
    .map_err(|_| SwarmError::sync(channel, format!("{} {} timed out after {:?}", program, args.join(" "), limit)))?
    .map_err(|e| SwarmError::sync(channel, format!("could not run {}: {}", program, e)))?;

  if output.status.success() {
    Ok(output)
  } else {
    Err(SwarmError::sync(
      channel,
      format!(
        "{} {} exited with {}: {}",
        program,
        args.join(" "),
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
      ),
    ))
  }
}

/// Version control channel: the ledger lives in a git work tree with an upstream.
pub struct GitChannel {
  repo_dir: PathBuf,
  ledger: String,
  node_id: String,
  attempts: usize,
  timeout: Duration,
}

impl GitChannel {
  const NAME: &'static str = "git";

  pub fn new(config: &Config) -> Self {
    let ledger = config
      .ledger_path
      .strip_prefix(&config.git_dir)
      .unwrap_or(&config.ledger_path)
      .to_string_lossy()
      .into_owned();
    Self {
      repo_dir: config.git_dir.clone(),
      ledger,
      node_id: config.node_id.clone(),
      attempts: config.push_attempts.max(1),
      timeout: config.sync_timeout,
    }
  }

  async fn git(&self, args: &[&str]) -> Result<Output> {
    run_tool(Self::NAME, "git", args, Some(&self.repo_dir), self.timeout).await
  }

  /// Joins upstream history while keeping the local ledger content, so the
  /// following push is a fast-forward carrying this node's version.
  async fn rejoin(&self) -> Result<()> {
    self.git(&["fetch", "--quiet"]).await?;
    self.git(&["merge", "--no-edit", "-s", "ours", "@{u}"]).await?;
    Ok(())
  }

  async fn commit(&self) -> Result<()> {
    self.git(&["add", "--", &self.ledger]).await?;
    // exit 0 means the index matches HEAD
    if self.git(&["diff", "--cached", "--quiet", "--", &self.ledger]).await.is_ok() {
      debug!("Ledger unchanged, nothing to commit");
      return Ok(());
    }
    let message = format!("Node {}: ledger update", self.node_id);
    self.git(&["commit", "--quiet", "-m", &message, "--", &self.ledger]).await?;
    Ok(())
  }
}

#[async_trait]
impl SyncTransport for GitChannel {
  fn name(&self) -> &'static str {
    Self::NAME
  }

  async fn pull(&self) -> Result<()> {
    self.git(&["fetch", "--quiet"]).await?;
    // Record upstream as merged, then take its ledger wholesale.
    self.git(&["merge", "--no-edit", "-s", "ours", "@{u}"]).await?;
    self.git(&["checkout", "@{u}", "--", &self.ledger]).await?;
    debug!(repo = ?self.repo_dir, "Pulled ledger from upstream");
    Ok(())
  }

  async fn push(&self) -> Result<()> {
    self.commit().await?;

    let attempt = AtomicUsize::new(0);
    let strategy = ExponentialBackoff::from_millis(BACKOFF_BASE)
      .factor(BACKOFF_FACTOR)
      .max_delay(MAX_BACKOFF)
      .take(self.attempts - 1);

    Retry::spawn(strategy, || {
      let n = attempt.fetch_add(1, Ordering::SeqCst);
      async move {
        if n > 0 {
          info!(attempt = n + 1, "Push rejected, re-pulling before retry");
          self.rejoin().await?;
        }
        self.git(&["push", "--quiet"]).await.map(|_| ())
      }
    })
    .await
    .inspect_err(|e| warn!(attempts = self.attempts, "Giving up on push: {}", e))
  }
}

/// Object store channel: the ledger is copied to and from an rclone remote.
pub struct ObjectStoreChannel {
  ledger_path: PathBuf,
  remote_object: String,
  timeout: Duration,
}

impl ObjectStoreChannel {
  const NAME: &'static str = "rclone";

  pub fn new(config: &Config) -> Self {
    let file_name = config
      .ledger_path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| "ledger.json".into());
    Self {
      ledger_path: config.ledger_path.clone(),
      remote_object: remote_object(&config.object_remote, &file_name),
      timeout: config.sync_timeout,
    }
  }

  fn incoming_path(&self) -> PathBuf {
    let mut name = self.ledger_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".incoming");
    self.ledger_path.with_file_name(name)
  }
}

fn remote_object(remote: &str, file_name: &str) -> String {
  if remote.ends_with(':') || remote.ends_with('/') {
    format!("{}{}", remote, file_name)
  } else {
    format!("{}/{}", remote, file_name)
  }
}

#[async_trait]
impl SyncTransport for ObjectStoreChannel {
  fn name(&self) -> &'static str {
    Self::NAME
  }

  async fn pull(&self) -> Result<()> {
    // Download beside the live file and only swap it in once it parses.
    let incoming = self.incoming_path();
    let incoming_arg = incoming.to_string_lossy().into_owned();
    run_tool(Self::NAME, "rclone", &["copyto", &self.remote_object, &incoming_arg], None, self.timeout).await?;

    let body = tokio::fs::read(&incoming)
      .await
      .map_err(|e| SwarmError::sync(Self::NAME, format!("downloaded ledger unreadable: {}", e)))?;
    if let Err(e) = serde_json::from_slice::<serde_json::Value>(&body) {
      let _ = tokio::fs::remove_file(&incoming).await;
      return Err(SwarmError::sync(Self::NAME, format!("remote ledger is not valid JSON: {}", e)));
    }
    tokio::fs::rename(&incoming, &self.ledger_path)
      .await
      .map_err(|e| SwarmError::io(&self.ledger_path, e))?;
    debug!(remote = %self.remote_object, "Pulled ledger from object store");
    Ok(())
  }

  async fn push(&self) -> Result<()> {
    let local = self.ledger_path.to_string_lossy().into_owned();
    run_tool(Self::NAME, "rclone", &["copyto", &local, &self.remote_object], None, self.timeout).await?;
    debug!(remote = %self.remote_object, "Pushed ledger to object store");
    Ok(())
  }
}

/// Peer file sync: an external daemon mirrors the directory on its own schedule.
pub struct PeerSyncChannel;

#[async_trait]
impl SyncTransport for PeerSyncChannel {
  fn name(&self) -> &'static str {
    "syncthing"
  }

  async fn pull(&self) -> Result<()> {
    Ok(())
  }

  async fn push(&self) -> Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config_in(dir: &Path, method: SyncMethod) -> Config {
    let mut config = Config::default().with_ledger_path(dir.join("ledger.json"));
    config.sync_method = method;
    config.node_id = "node-test".into();
    config.sync_timeout = Duration::from_secs(5);
    config.push_attempts = 1;
    config
  }

  #[test]
  fn remote_object_joins_paths() {
    assert_eq!(remote_object("remote:otatm", "ledger.json"), "remote:otatm/ledger.json");
    assert_eq!(remote_object("gdrive:machine-ledger/", "ledger.json"), "gdrive:machine-ledger/ledger.json");
    assert_eq!(remote_object("s3:", "ledger.json"), "s3:ledger.json");
  }

  #[test]
  fn git_ledger_path_is_relative_to_repo() {
    let config = Config::default().with_ledger_path(PathBuf::from("/srv/ledger-repo/sync/ledger.json"));
    let config = Config { git_dir: PathBuf::from("/srv/ledger-repo"), ..config };
    assert_eq!(GitChannel::new(&config).ledger, "sync/ledger.json");
  }

  #[tokio::test]
  async fn peer_sync_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let transport = build_transport(&config_in(dir.path(), SyncMethod::Syncthing));
    assert_eq!(transport.name(), "syncthing");
    tokio_test::assert_ok!(transport.pull().await);
    tokio_test::assert_ok!(transport.push().await);
  }

  #[tokio::test]
  async fn git_failures_are_transient() {
    // Not a repository (or no git at all): either way the error must be soft.
    let dir = tempfile::tempdir().unwrap();
    let transport = build_transport(&config_in(dir.path(), SyncMethod::Git));
    let err = transport.pull().await.unwrap_err();
    assert!(err.is_transient(), "unexpected error: {err}");
    let err = transport.push().await.unwrap_err();
    assert!(err.is_transient(), "unexpected error: {err}");
  }

  fn setup_git(dir: &Path, args: &[&str]) {
    let output = std::process::Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(output.status.success(), "git {:?}: {}", args, String::from_utf8_lossy(&output.stderr));
  }

  fn clone_of(remote: &Path, dir: &Path) -> GitChannel {
    setup_git(remote.parent().unwrap(), &["clone", "--quiet", &remote.to_string_lossy(), &dir.to_string_lossy()]);
    setup_git(dir, &["config", "user.email", "node@example.com"]);
    setup_git(dir, &["config", "user.name", "node"]);
    setup_git(dir, &["config", "commit.gpgsign", "false"]);
    let mut config = config_in(dir, SyncMethod::Git);
    config.git_dir = dir.to_path_buf();
    config.push_attempts = 3;
    config.sync_timeout = Duration::from_secs(10);
    config.node_id = dir.file_name().unwrap().to_string_lossy().into_owned();
    GitChannel::new(&config)
  }

  #[tokio::test]
  async fn git_rejected_push_rejoins_and_last_write_wins() {
    if std::process::Command::new("git").arg("--version").output().is_err() {
      return;
    }
    let root = tempfile::tempdir().unwrap();
    let remote = root.path().join("remote.git");
    std::fs::create_dir(&remote).unwrap();
    setup_git(&remote, &["init", "--quiet", "--bare"]);
    setup_git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);

    let a = clone_of(&remote, &root.path().join("a"));
    let a_ledger = a.repo_dir.join("ledger.json");
    setup_git(&a.repo_dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    std::fs::write(&a_ledger, r#"{"tasks": []}"#).unwrap();
    setup_git(&a.repo_dir, &["add", "ledger.json"]);
    setup_git(&a.repo_dir, &["commit", "--quiet", "-m", "seed"]);
    setup_git(&a.repo_dir, &["push", "--quiet", "-u", "origin", "main"]);

    let b = clone_of(&remote, &root.path().join("b"));
    let b_ledger = b.repo_dir.join("ledger.json");

    // a moves upstream ahead of b
    std::fs::write(&a_ledger, r#"{"tasks": [{"id": "from-a"}]}"#).unwrap();
    tokio_test::assert_ok!(a.push().await);

    // b's first push is rejected, the retry lands on top of a's commit
    let from_b = r#"{"tasks": [{"id": "from-b"}]}"#;
    std::fs::write(&b_ledger, from_b).unwrap();
    tokio_test::assert_ok!(b.push().await);

    tokio_test::assert_ok!(a.pull().await);
    assert_eq!(std::fs::read_to_string(&a_ledger).unwrap(), from_b);

    // nothing new to commit, push still succeeds
    tokio_test::assert_ok!(b.push().await);
    tokio_test::assert_ok!(a.push().await);
  }

  #[tokio::test]
  async fn rclone_failure_leaves_local_ledger_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path(), SyncMethod::Rclone);
    config.object_remote = "definitely-not-configured:bucket".into();
    std::fs::write(&config.ledger_path, "{\"tasks\": []}").unwrap();

    let transport = build_transport(&config);
    assert!(transport.pull().await.unwrap_err().is_transient());
    assert_eq!(std::fs::read_to_string(&config.ledger_path).unwrap(), "{\"tasks\": []}");
  }
}
