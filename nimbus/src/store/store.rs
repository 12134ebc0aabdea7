use crate::store::{Key, Value};
use hashbrown::HashMap;
use std::sync::{Arc, RwLock};

const SHARDS: usize = 16;

type Shard = RwLock<HashMap<Key, Arc<Value>>>;

/// The local key/value map of one process. Values are compared by identity, never by content:
/// a swap only succeeds if the caller saw the very [`Value`] that is installed now.
pub struct Store {
  shards: Vec<Shard>,
}
impl Store {
  pub fn new() -> Store {
    Store {
      shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
    }
  }

  fn shard(&self, key: &Key) -> &Shard {
    &self.shards[key.hash31() as usize % SHARDS]
  }

  pub fn get(&self, key: &Key) -> Option<Arc<Value>> {
    self.shard(key).read().unwrap().get(key).cloned()
  }

  /// Installs `new` (or removes the key for `None`) if the current value is `expected`, compared
  /// by identity. Returns `Ok` with the replaced value, or `Err` with the current value on a
  /// mismatch. Linearizable per key.
  pub fn put_if_match(
    &self,
    key: &Key,
    new: Option<Arc<Value>>,
    expected: Option<&Arc<Value>>,
  ) -> Result<Option<Arc<Value>>, Option<Arc<Value>>> {
    let mut map = self.shard(key).write().unwrap();
    let matched = match (map.get(key), expected) {
      (None, None) => true,
      (Some(cur), Some(exp)) => Arc::ptr_eq(cur, exp),
      _ => false,
    };
    if !matched {
      return Err(map.get(key).cloned());
    }
    Ok(match new {
      Some(v) => map.insert(key.clone(), v),
      None => map.remove(key),
    })
  }

  /// Installs `value` regardless of what is there, returning the previous value.
  pub fn put(&self, key: &Key, value: Arc<Value>) -> Option<Arc<Value>> {
    self.shard(key).write().unwrap().insert(key.clone(), value)
  }

  pub fn remove(&self, key: &Key) -> Option<Arc<Value>> {
    self.shard(key).write().unwrap().remove(key)
  }

  pub fn len(&self) -> usize {
    self.shards.iter().map(|s| s.read().unwrap().len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// A snapshot of every key.
  pub fn keys(&self) -> Vec<Key> {
    self
      .shards
      .iter()
      .flat_map(|s| s.read().unwrap().keys().cloned().collect::<Vec<_>>())
      .collect()
  }
}
impl Default for Store {
  fn default() -> Self {
    Store::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_identity_not_content() {
    let store = Store::new();
    let key = Key::user("k");
    let a = Arc::new(Value::new(vec![1]));
    assert_eq!(store.put_if_match(&key, Some(a.clone()), None), Ok(None));
    let twin = Arc::new(Value::new(vec![1]));
    let b = Arc::new(Value::new(vec![2]));
    match store.put_if_match(&key, Some(b.clone()), Some(&twin)) {
      Err(Some(cur)) => assert!(Arc::ptr_eq(&cur, &a)),
      other => panic!("unexpected {:?}", other),
    }
    match store.put_if_match(&key, Some(b.clone()), Some(&a)) {
      Ok(Some(prev)) => assert!(Arc::ptr_eq(&prev, &a)),
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(store.put_if_match(&key, None, None), Err(Some(b.clone())));
    assert!(store.put_if_match(&key, None, Some(&b)).is_ok());
    assert!(store.is_empty());
  }

  #[test]
  fn test_racing_swaps() {
    let store = Arc::new(Store::new());
    let key = Key::user("counter");
    store.put(&key, Arc::new(Value::new(0u64.to_be_bytes().to_vec())));
    let threads = (0..8)
      .map(|_| {
        let store = store.clone();
        let key = key.clone();
        std::thread::spawn(move || {
          let mut wins = 0;
          for _ in 0..500 {
            loop {
              let old = store.get(&key).unwrap();
              let mut b = [0u8; 8];
              b.copy_from_slice(old.bytes());
              let next = u64::from_be_bytes(b) + 1;
              let new = Arc::new(Value::successor(Some(&old), next.to_be_bytes().to_vec()));
              if store.put_if_match(&key, Some(new), Some(&old)).is_ok() {
                wins += 1;
                break;
              }
            }
          }
          wins
        })
      })
      .collect::<Vec<_>>();
    let wins: u64 = threads.into_iter().map(|t| t.join().unwrap()).sum();
    let last = store.get(&key).unwrap();
    let mut b = [0u8; 8];
    b.copy_from_slice(last.bytes());
    assert_eq!(wins, 4000);
    assert_eq!(u64::from_be_bytes(b), 4000);
    assert_eq!(last.version(), 4000);
  }
}
