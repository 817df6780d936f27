use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::models::NewTask;

/// A candidate unit of work offered by an external scanner.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Candidate {
  #[serde(flatten)]
  pub task: NewTask,
  #[serde(default)]
  pub score: Option<f64>,
}

impl Candidate {
  /// The score, when given, overrides any priority on the task itself.
  pub fn into_task(self) -> NewTask {
    let mut task = self.task;
    if let Some(score) = self.score.filter(|s| s.is_finite()) {
      task.priority = score;
    }
    task
  }
}

/// Source of candidate tasks. Iteration is lazy and finite; callers may stop early.
pub trait Discovery: Send + Sync {
  fn candidates(&self) -> Box<dyn Iterator<Item = Candidate> + '_>;
}

/// Fixed list, mostly for wiring tests and one-off seeding.
pub struct StaticDiscovery(pub Vec<Candidate>);

impl Discovery for StaticDiscovery {
  fn candidates(&self) -> Box<dyn Iterator<Item = Candidate> + '_> {
    Box::new(self.0.iter().cloned())
  }
}

/// Streams whitespace-separated JSON candidates from a file written by an
/// external scanner. Malformed entries end the stream with a warning.
pub struct FileDiscovery {
  path: PathBuf,
}

impl FileDiscovery {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }
}

impl Discovery for FileDiscovery {
  fn candidates(&self) -> Box<dyn Iterator<Item = Candidate> + '_> {
    let file = match File::open(&self.path) {
      Ok(file) => file,
      Err(e) => {
        warn!(path = ?self.path, "Discovery feed unavailable: {}", e);
        return Box::new(std::iter::empty());
      }
    };
    let stream = serde_json::Deserializer::from_reader(BufReader::new(file)).into_iter::<Candidate>();
    Box::new(stream.map_while(move |item| match item {
      Ok(candidate) => Some(candidate),
      Err(e) => {
        warn!(path = ?self.path, "Stopping at malformed discovery entry: {}", e);
        None
      }
    }))
  }
}
