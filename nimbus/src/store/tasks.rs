use crate::cluster::Cluster;
use crate::core::TaskError;
use crate::rpc::RemoteTask;
use crate::scheduler::{CancelToken, Priority};
use crate::store::{Key, Value};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Reads a key from its home.
#[derive(Serialize, Deserialize)]
pub(crate) struct GetKey {
  pub key: Key,
}
impl RemoteTask for GetKey {
  const NAME: &'static str = "nimbus.GetKey";
  type Output = Option<Value>;

  fn priority(&self) -> Priority {
    Priority::GET_KEY
  }

  fn compute(self, cluster: &Cluster, _: &CancelToken) -> Result<Option<Value>, TaskError> {
    Ok(cluster.store().get(&self.key).map(|v| (*v).clone()))
  }
}

/// Installs or removes a key at its home.
#[derive(Serialize, Deserialize)]
pub(crate) struct PutKey {
  pub key: Key,
  pub value: Option<Value>,
}
impl RemoteTask for PutKey {
  const NAME: &'static str = "nimbus.PutKey";
  type Output = ();

  fn priority(&self) -> Priority {
    Priority::PUT_KEY
  }

  fn compute(self, cluster: &Cluster, _: &CancelToken) -> Result<(), TaskError> {
    match self.value {
      Some(v) => cluster.store().put(&self.key, Arc::new(v)),
      None => cluster.store().remove(&self.key),
    };
    Ok(())
  }
}

impl Cluster {
  /// Reads `key` from the local store, or from its home if it is not here.
  pub fn get_remote(&self, key: &Key) -> Result<Option<Arc<Value>>, TaskError> {
    if let Some(v) = self.store().get(key) {
      return Ok(Some(v));
    }
    let home = self.home(key);
    if home.is_self() {
      return Ok(None);
    }
    let task = GetKey { key: key.clone() };
    Ok(self.call(&home, &task)?.get()?.map(Arc::new))
  }

  /// Installs `value` under `key` at its home, waiting until it is there.
  pub fn put_home(&self, key: &Key, value: Value) -> Result<(), TaskError> {
    self.write_home(key, Some(value))
  }

  /// Removes `key` at its home, waiting until it is gone.
  pub fn remove_home(&self, key: &Key) -> Result<(), TaskError> {
    self.write_home(key, None)
  }

  fn write_home(&self, key: &Key, value: Option<Value>) -> Result<(), TaskError> {
    let home = self.home(key);
    if home.is_self() {
      match value {
        Some(v) => self.store().put(key, Arc::new(v)),
        None => self.store().remove(key),
      };
      return Ok(());
    }
    let task = PutKey {
      key: key.clone(),
      value: value,
    };
    self.call(&home, &task)?.get()
  }
}
