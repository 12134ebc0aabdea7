use crate::core::NodeKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boxed error returned by user code, such as a map function.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The reasons a task can fail. A [`TaskError`] is serializable, so it travels back to the caller
/// of a remote task in place of the answer.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskError {
  /// The target is not a member of the current cloud.
  #[error("node {0} is not a member of the current cloud")]
  Unreachable(NodeKey),
  /// The task, or a task it belongs to, was cancelled.
  #[error("task was cancelled")]
  Cancelled,
  /// User code failed on `node`. The original cause is kept as text.
  #[error("task failed on {node}: {cause}")]
  Failed { node: NodeKey, cause: String },
  /// The task panicked while running on a worker.
  #[error("task panicked: {0}")]
  Panicked(String),
  /// The receiver has nothing registered under this name.
  #[error("no task registered under the name {0:?}")]
  UnknownTask(String),
  /// A payload could not be encoded or decoded.
  #[error("codec error: {0}")]
  Codec(String),
  /// A chunk of a vector is absent from the store of its home node.
  #[error("chunk {cidx} of vector {vec} in group {group:#018x} is missing")]
  MissingChunk { group: u64, vec: u32, cidx: u32 },
  /// The vectors of a frame do not share a chunk layout.
  #[error("incompatible frame: {0}")]
  IncompatibleFrame(String),
}
impl TaskError {
  /// Wraps a user error raised on `node`. A [`TaskError`] passes through unchanged, so that
  /// cancellation and nested failures keep their identity.
  pub fn from_user(node: NodeKey, err: BoxError) -> TaskError {
    match err.downcast::<TaskError>() {
      Ok(te) => *te,
      Err(e) => TaskError::Failed {
        node: node,
        cause: e.to_string(),
      },
    }
  }

  /// Whether this error only reports a cancellation.
  pub fn is_cancelled(&self) -> bool {
    *self == TaskError::Cancelled
  }

  /// Picks the more informative of two errors: a real failure beats a cancellation.
  pub fn prefer(self, other: TaskError) -> TaskError {
    if self.is_cancelled() {
      other
    } else {
      self
    }
  }
}
impl From<serde_cbor::Error> for TaskError {
  fn from(e: serde_cbor::Error) -> Self {
    TaskError::Codec(e.to_string())
  }
}

/// Errors raised while starting or operating a [`Cluster`](crate::cluster::Cluster).
#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Io(#[from] std::io::Error),
  #[error(transparent)]
  Task(#[from] TaskError),
  #[error("invalid configuration: {0}")]
  Config(String),
  #[error("cloud size is {have}, wanted at least {wanted}")]
  CloudSize { wanted: usize, have: usize },
  #[error("flatfile line {line}: {reason}")]
  Flatfile { line: usize, reason: String },
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::Ipv4Addr;

  #[test]
  fn test_user_errors_keep_task_errors() {
    let node = NodeKey::new(Ipv4Addr::LOCALHOST, 5001);
    let e: BoxError = Box::new(TaskError::Cancelled);
    assert_eq!(TaskError::from_user(node, e), TaskError::Cancelled);
    let e: BoxError = "bad row".into();
    assert_eq!(
      TaskError::from_user(node, e),
      TaskError::Failed {
        node: node,
        cause: "bad row".to_string()
      }
    );
  }

  #[test]
  fn test_prefer_real_failure() {
    let node = NodeKey::new(Ipv4Addr::LOCALHOST, 5001);
    let failed = TaskError::Failed {
      node: node,
      cause: "x".to_string(),
    };
    assert_eq!(TaskError::Cancelled.prefer(failed.clone()), failed);
    assert_eq!(failed.clone().prefer(TaskError::Cancelled), failed);
  }
}
