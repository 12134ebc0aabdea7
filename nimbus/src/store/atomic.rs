use crate::cluster::Cluster;
use crate::core::{deserialize, serialize, TaskError};
use crate::rpc::Rpc;
use crate::scheduler::{CancelToken, Priority};
use crate::store::{Key, Store, Value, LOG_LEVEL};
use crate::trace;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// A read-modify-write transaction on one key, run at the key's home node.
///
/// [`atomic`](Atomic::atomic) may run several times: whenever another writer gets in between the
/// read and the swap, it is called again with the newer value. It must therefore be a pure
/// function of the old value, apart from state it deliberately records in `self`, which travels
/// back to the caller.
pub trait Atomic: Serialize + DeserializeOwned + Send + 'static {
  /// Identifies the transaction type on the wire.
  const NAME: &'static str;

  /// Computes the replacement for `old`. Returning `None` abandons the transaction.
  fn atomic(&mut self, old: Option<&Value>) -> Option<Value>;

  /// Runs at the home node once the swap succeeded, with the value that was replaced.
  fn on_success(&mut self, _old: Option<Arc<Value>>) {}
}

/// A finished transaction, as it stood when it committed or gave up.
#[derive(Debug)]
pub struct AtomicOutcome<A> {
  pub tx: A,
  pub committed: bool,
}

/// Retries `tx` against the local store until its swap succeeds or it aborts.
pub(crate) fn run_atomic<A: Atomic>(store: &Store, key: &Key, tx: &mut A) -> bool {
  let mut old = store.get(key);
  loop {
    let new = match tx.atomic(old.as_deref()) {
      Some(v) => Arc::new(v),
      None => return false,
    };
    match store.put_if_match(key, Some(new), old.as_ref()) {
      Ok(prev) => {
        tx.on_success(prev);
        return true;
      }
      Err(cur) => old = cur,
    }
  }
}

pub(crate) fn register_atomic_handler<A: Atomic>(cluster: &Cluster) {
  cluster.registry().register_raw(
    A::NAME,
    Arc::new(|cluster: &Cluster, body: &[u8], _cancel: &CancelToken| {
      let (key, mut tx): (Key, A) = deserialize(body)?;
      let committed = run_atomic(cluster.store(), &key, &mut tx);
      serialize(&(tx, committed))
    }),
  );
}

enum Pending<A> {
  Done(AtomicOutcome<A>),
  Remote(Arc<Rpc>),
}

/// A transaction that may still be running at a remote home.
pub struct AtomicHandle<A> {
  pending: Pending<A>,
  x: PhantomData<A>,
}
impl<A: Atomic> AtomicHandle<A> {
  /// Blocks until the transaction finishes.
  pub fn get(self) -> Result<AtomicOutcome<A>, TaskError> {
    match self.pending {
      Pending::Done(out) => Ok(out),
      Pending::Remote(rpc) => {
        let (tx, committed): (A, bool) = deserialize(&rpc.get()?[..])?;
        Ok(AtomicOutcome {
          tx: tx,
          committed: committed,
        })
      }
    }
  }

  pub fn is_done(&self) -> bool {
    match &self.pending {
      Pending::Done(_) => true,
      Pending::Remote(rpc) => rpc.is_done(),
    }
  }
}

impl Cluster {
  /// Makes the transaction type `A` runnable here on behalf of other nodes.
  pub fn register_atomic<A: Atomic>(&self) {
    register_atomic_handler::<A>(self);
  }

  /// Starts `tx` on the home of `key`. Runs inline when this node is the home.
  pub fn atomic_async<A: Atomic>(&self, key: &Key, mut tx: A) -> Result<AtomicHandle<A>, TaskError> {
    let home = self.home(key);
    let pending = if home.is_self() {
      let committed = run_atomic(self.store(), key, &mut tx);
      Pending::Done(AtomicOutcome {
        tx: tx,
        committed: committed,
      })
    } else {
      trace!(
        LOG_LEVEL,
        self,
        format!("Shipping {} on {} to {}", A::NAME, key, home.key())
      );
      let body = serialize(&(key, &tx))?;
      Pending::Remote(self.call_raw(&home, A::NAME, Priority::ATOMIC, &body[..]))
    };
    Ok(AtomicHandle {
      pending: pending,
      x: PhantomData,
    })
  }

  /// Runs `tx` on the home of `key` and waits for it to commit or abort.
  pub fn atomic<A: Atomic>(&self, key: &Key, tx: A) -> Result<AtomicOutcome<A>, TaskError> {
    self.atomic_async(key, tx)?.get()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Serialize, Deserialize)]
  struct Add {
    by: u64,
    limit: u64,
    seen: Option<u64>,
    successes: u32,
  }
  impl Atomic for Add {
    const NAME: &'static str = "test.Add";

    fn atomic(&mut self, old: Option<&Value>) -> Option<Value> {
      let cur = old.map_or(0, |v| v.get::<u64>().unwrap());
      self.seen = Some(cur);
      if cur + self.by > self.limit {
        return None;
      }
      Some(Value::successor(old, serialize(&(cur + self.by)).unwrap()))
    }

    fn on_success(&mut self, _old: Option<Arc<Value>>) {
      self.successes += 1;
    }
  }

  fn add(by: u64, limit: u64) -> Add {
    Add {
      by: by,
      limit: limit,
      seen: None,
      successes: 0,
    }
  }

  #[test]
  fn test_commit_and_abort() {
    let store = Store::new();
    let key = Key::user("n");
    let mut tx = add(5, 8);
    assert!(run_atomic(&store, &key, &mut tx));
    assert_eq!(tx.seen, Some(0));
    assert_eq!(tx.successes, 1);
    let mut tx = add(5, 8);
    assert!(!run_atomic(&store, &key, &mut tx));
    assert_eq!(tx.seen, Some(5));
    assert_eq!(tx.successes, 0);
    assert_eq!(store.get(&key).unwrap().get::<u64>().unwrap(), 5);
  }

  #[test]
  fn test_concurrent_increments() {
    let store = Arc::new(Store::new());
    let key = Key::user("n");
    let threads = (0..8)
      .map(|_| {
        let store = store.clone();
        let key = key.clone();
        std::thread::spawn(move || {
          for _ in 0..250 {
            assert!(run_atomic(&store, &key, &mut add(1, u64::MAX)));
          }
        })
      })
      .collect::<Vec<_>>();
    for t in threads {
      t.join().unwrap();
    }
    let v = store.get(&key).unwrap();
    assert_eq!(v.get::<u64>().unwrap(), 2000);
    assert_eq!(v.version(), 1999);
  }
}
