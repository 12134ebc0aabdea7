use crate::cluster::Cluster;
use crate::core::{deserialize, serialize, TaskError};
use crate::scheduler::{CancelToken, Priority};
use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// A task that can be shipped to another node and computed there. Every node that may run it must
/// [`register_task`](crate::cluster::Cluster::register_task) it under the same [`NAME`](Self::NAME).
pub trait RemoteTask: Serialize + DeserializeOwned + Send + 'static {
  /// Identifies the task type on the wire.
  const NAME: &'static str;
  type Output: Serialize + DeserializeOwned + Send + 'static;

  /// The tier the receiver runs this task at.
  fn priority(&self) -> Priority {
    Priority::MIN
  }

  fn compute(self, cluster: &Cluster, cancel: &CancelToken) -> Result<Self::Output, TaskError>;
}

pub(crate) type Handler =
  Arc<dyn Fn(&Cluster, &[u8], &CancelToken) -> Result<Vec<u8>, TaskError> + Send + Sync>;

/// Maps task names to the code that decodes and runs them.
#[derive(Default)]
pub struct TaskRegistry {
  handlers: RwLock<HashMap<String, Handler>>,
}
impl TaskRegistry {
  pub fn new() -> TaskRegistry {
    TaskRegistry::default()
  }

  pub(crate) fn register_raw(&self, name: &str, handler: Handler) {
    self
      .handlers
      .write()
      .unwrap()
      .insert(name.to_string(), handler);
  }

  pub fn register<T: RemoteTask>(&self) {
    self.register_raw(
      T::NAME,
      Arc::new(|cluster: &Cluster, body: &[u8], cancel: &CancelToken| {
        let task: T = deserialize(body)?;
        let out = task.compute(cluster, cancel)?;
        serialize(&out)
      }),
    );
  }

  pub fn contains(&self, name: &str) -> bool {
    self.handlers.read().unwrap().contains_key(name)
  }

  pub(crate) fn run(
    &self,
    cluster: &Cluster,
    name: &str,
    body: &[u8],
    cancel: &CancelToken,
  ) -> Result<Vec<u8>, TaskError> {
    let handler = self
      .handlers
      .read()
      .unwrap()
      .get(name)
      .cloned()
      .ok_or_else(|| TaskError::UnknownTask(name.to_string()))?;
    handler(cluster, body, cancel)
  }
}

// Exec payload: priority (1), target incarnation (8), name length (2), name, body. An
// incarnation of zero matches any.
const EXEC_HEADER: usize = 11;

pub(crate) fn encode_exec(name: &str, priority: Priority, incarnation: u64, body: &[u8]) -> Vec<u8> {
  let mut buf = Vec::with_capacity(EXEC_HEADER + name.len() + body.len());
  buf.push(priority.level());
  buf.extend_from_slice(&incarnation.to_be_bytes()[..]);
  buf.extend_from_slice(&(name.len() as u16).to_be_bytes()[..]);
  buf.extend_from_slice(name.as_bytes());
  buf.extend_from_slice(body);
  buf
}

pub(crate) fn decode_exec(buf: &[u8]) -> Result<(Priority, u64, &str, &[u8]), TaskError> {
  let bad = || TaskError::Codec("malformed task envelope".to_string());
  if buf.len() < EXEC_HEADER {
    return Err(bad());
  }
  let priority = Priority::new(buf[0]).ok_or_else(bad)?;
  let mut inc = [0u8; 8];
  inc.copy_from_slice(&buf[1..9]);
  let len = u16::from_be_bytes([buf[9], buf[10]]) as usize;
  if buf.len() < EXEC_HEADER + len {
    return Err(bad());
  }
  let name = std::str::from_utf8(&buf[EXEC_HEADER..EXEC_HEADER + len]).map_err(|_| bad())?;
  Ok((priority, u64::from_be_bytes(inc), name, &buf[EXEC_HEADER + len..]))
}

// Ack payload: status (1), then the answer bytes or an encoded TaskError.
pub(crate) fn encode_answer(res: &Result<Vec<u8>, TaskError>) -> Vec<u8> {
  match res {
    Ok(bytes) => {
      let mut buf = Vec::with_capacity(1 + bytes.len());
      buf.push(0);
      buf.extend_from_slice(&bytes[..]);
      buf
    }
    Err(e) => {
      let mut buf = vec![1];
      match serialize(e) {
        Ok(bytes) => buf.extend(bytes),
        Err(_) => buf[0] = 2,
      }
      buf
    }
  }
}

pub(crate) fn decode_answer(buf: &[u8]) -> Result<Vec<u8>, TaskError> {
  match buf.first() {
    Some(0) => Ok(buf[1..].to_vec()),
    Some(1) => Err(deserialize::<TaskError>(&buf[1..])?),
    _ => Err(TaskError::Codec("malformed answer".to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exec_envelope() {
    let buf = encode_exec("nimbus.GetKey", Priority::GET_KEY, 1_700_000_000_123, b"body");
    let (p, inc, name, body) = decode_exec(&buf[..]).unwrap();
    assert_eq!(p, Priority::GET_KEY);
    assert_eq!(inc, 1_700_000_000_123);
    assert_eq!(name, "nimbus.GetKey");
    assert_eq!(body, b"body");
    assert!(decode_exec(&buf[..5]).is_err());
    assert!(decode_exec(&buf[..15]).is_err());
    let mut bad = buf.clone();
    bad[0] = 99;
    assert!(decode_exec(&bad[..]).is_err());
  }

  #[test]
  fn test_answer_envelope() {
    let ok = encode_answer(&Ok(vec![1, 2, 3]));
    assert_eq!(decode_answer(&ok[..]), Ok(vec![1, 2, 3]));
    let err = encode_answer(&Err(TaskError::UnknownTask("x".to_string())));
    assert_eq!(
      decode_answer(&err[..]),
      Err(TaskError::UnknownTask("x".to_string()))
    );
    assert!(decode_answer(&[][..]).is_err());
  }
}
