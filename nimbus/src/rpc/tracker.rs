use crate::rpc::RpcCall;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// The outcome of recording an incoming task.
pub enum Recorded {
  /// First sighting: the caller should compute it.
  New,
  /// Already tracked, possibly still computing.
  Duplicate(Arc<RpcCall>),
  /// Below the watermark: done and confirmed long ago.
  Retired,
}

/// Tracks the tasks one caller has sent us. Every id is either in the table or below the
/// watermark, never neither, so a task is computed at most once per caller incarnation.
pub struct TaskTracker {
  work: Mutex<HashMap<u32, Arc<RpcCall>>>,
  // Every id below this has been answered and confirmed.
  watermark: AtomicU32,
}
impl TaskTracker {
  pub fn new() -> TaskTracker {
    TaskTracker {
      work: Mutex::new(HashMap::new()),
      watermark: AtomicU32::new(1),
    }
  }

  pub fn watermark(&self) -> u32 {
    self.watermark.load(Ordering::Acquire)
  }

  pub fn len(&self) -> usize {
    self.work.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn get(&self, tnum: u32) -> Option<Arc<RpcCall>> {
    self.work.lock().unwrap().get(&tnum).cloned()
  }

  pub fn record(&self, call: Arc<RpcCall>) -> Recorded {
    let tnum = call.tasknum();
    if tnum < self.watermark() {
      return Recorded::Retired;
    }
    match self.work.lock().unwrap().entry(tnum) {
      Entry::Occupied(o) => return Recorded::Duplicate(o.get().clone()),
      Entry::Vacant(v) => {
        v.insert(call);
      }
    }
    // The watermark may have passed us between the check and the insert.
    if tnum < self.watermark() {
      self.work.lock().unwrap().remove(&tnum);
      return Recorded::Retired;
    }
    Recorded::New
  }

  /// Drops the saved answer for `tnum` after the caller confirmed it, then advances the watermark
  /// over every contiguous released id. Returns false if there was nothing to release.
  pub fn remove_tracking(&self, tnum: u32) -> bool {
    let call = match self.get(tnum) {
      Some(c) => c,
      None => return false,
    };
    if !call.release() {
      return false;
    }
    self.roll_up();
    true
  }

  fn roll_up(&self) {
    loop {
      let w = self.watermark();
      let released = match self.work.lock().unwrap().get(&w) {
        Some(call) => call.is_released(),
        None => false,
      };
      if !released {
        return;
      }
      if self
        .watermark
        .compare_exchange(w, w + 1, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
      {
        self.work.lock().unwrap().remove(&w);
      }
    }
  }
}
impl Default for TaskTracker {
  fn default() -> Self {
    TaskTracker::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::{NodeKey, NodeRegistry, Opcode, Packet};
  use rand::rngs::SmallRng;
  use rand::{Rng, SeedableRng};
  use std::net::Ipv4Addr;

  fn client() -> Arc<crate::core::Node> {
    let key = NodeKey::new(Ipv4Addr::LOCALHOST, 5001);
    NodeRegistry::new(NodeKey::new(Ipv4Addr::LOCALHOST, 5000), 1).intern(key)
  }

  fn ack(tnum: u32) -> Packet {
    Packet::new(Opcode::Ack, NodeKey::new(Ipv4Addr::LOCALHOST, 5000), tnum, &[0])
  }

  fn check(tracker: &TaskTracker, max: u32) {
    let w = tracker.watermark();
    let work = tracker.work.lock().unwrap();
    for t in 1..w {
      assert!(!work.contains_key(&t), "{} below watermark {}", t, w);
    }
    for t in work.keys() {
      assert!(*t >= w && *t <= max);
    }
  }

  #[test]
  fn test_in_order() {
    let node = client();
    let tracker = TaskTracker::new();
    for t in 1..=5 {
      let call = Arc::new(RpcCall::new(node.clone(), t));
      assert!(matches!(tracker.record(call.clone()), Recorded::New));
      call.answer(ack(t));
    }
    assert!(!tracker.remove_tracking(9));
    assert!(tracker.remove_tracking(2));
    assert!(!tracker.remove_tracking(2));
    assert_eq!(tracker.watermark(), 1);
    assert!(tracker.remove_tracking(1));
    assert_eq!(tracker.watermark(), 3);
    assert_eq!(tracker.len(), 3);
    let late = Arc::new(RpcCall::new(node.clone(), 2));
    assert!(matches!(tracker.record(late), Recorded::Retired));
    let dup = Arc::new(RpcCall::new(node.clone(), 4));
    match tracker.record(dup) {
      Recorded::Duplicate(c) => assert!(c.ack().is_some()),
      _ => panic!("expected a duplicate"),
    }
    check(&tracker, 5);
  }

  #[test]
  fn test_random_sequences() {
    let node = client();
    let mut rng = SmallRng::seed_from_u64(7);
    for _ in 0..50 {
      let tracker = TaskTracker::new();
      let max = rng.gen_range(1..40u32);
      for _ in 0..400 {
        let t = rng.gen_range(1..=max);
        match rng.gen_range(0..3) {
          0 => {
            let _ = tracker.record(Arc::new(RpcCall::new(node.clone(), t)));
          }
          1 => {
            if let Some(c) = tracker.get(t) {
              c.answer(ack(t));
            }
          }
          _ => {
            tracker.remove_tracking(t);
          }
        }
        check(&tracker, max);
      }
    }
  }

  #[test]
  fn test_concurrent_release() {
    let node = client();
    let tracker = Arc::new(TaskTracker::new());
    for t in 1..=1000 {
      let call = Arc::new(RpcCall::new(node.clone(), t));
      tracker.record(call.clone());
      call.answer(ack(t));
    }
    let threads = (0..4)
      .map(|i| {
        let tracker = tracker.clone();
        std::thread::spawn(move || {
          for t in (1..=1000).filter(|t| t % 4 == i) {
            assert!(tracker.remove_tracking(t));
          }
        })
      })
      .collect::<Vec<_>>();
    for t in threads {
      t.join().unwrap();
    }
    assert_eq!(tracker.watermark(), 1001);
    assert!(tracker.is_empty());
  }
}
