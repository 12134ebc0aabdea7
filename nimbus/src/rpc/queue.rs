use crate::cluster::WeakCluster;
use crate::rpc::{Rpc, RpcCall};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;

struct Delayed<T> {
  at: Instant,
  seq: u64,
  item: T,
}
impl<T> PartialEq for Delayed<T> {
  fn eq(&self, other: &Self) -> bool {
    self.at == other.at && self.seq == other.seq
  }
}
impl<T> Eq for Delayed<T> {}
impl<T> PartialOrd for Delayed<T> {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}
// Reversed, so the max-heap pops the earliest deadline.
impl<T> Ord for Delayed<T> {
  fn cmp(&self, other: &Self) -> Ordering {
    (other.at, other.seq).cmp(&(self.at, self.seq))
  }
}

/// Items that come due at a deadline. Popped by a scanner task on the cluster runtime.
pub(crate) struct DelayQueue<T> {
  heap: Mutex<BinaryHeap<Delayed<T>>>,
  seq: AtomicU64,
  wake: Notify,
}
impl<T> DelayQueue<T> {
  pub(crate) fn new() -> DelayQueue<T> {
    DelayQueue {
      heap: Mutex::new(BinaryHeap::new()),
      seq: AtomicU64::new(0),
      wake: Notify::new(),
    }
  }

  pub(crate) fn push(&self, at: Instant, item: T) {
    let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
    let earliest = {
      let mut heap = self.heap.lock().unwrap();
      let earliest = heap.peek().map_or(true, |d| at < d.at);
      heap.push(Delayed {
        at: at,
        seq: seq,
        item: item,
      });
      earliest
    };
    if earliest {
      self.wake.notify_one();
    }
  }

  pub(crate) fn pop_due(&self, now: Instant) -> Vec<T> {
    let mut heap = self.heap.lock().unwrap();
    let mut due = Vec::new();
    while heap.peek().map_or(false, |d| d.at <= now) {
      if let Some(d) = heap.pop() {
        due.push(d.item);
      }
    }
    due
  }

  pub(crate) fn len(&self) -> usize {
    self.heap.lock().unwrap().len()
  }

  fn next_deadline(&self) -> Option<Instant> {
    self.heap.lock().unwrap().peek().map(|d| d.at)
  }

  /// Waits until the earliest item is due, or until an earlier one is pushed.
  pub(crate) async fn wait(&self) {
    match self.next_deadline() {
      Some(at) => {
        tokio::select! {
          _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
          _ = self.wake.notified() => {}
        }
      }
      None => self.wake.notified().await,
    }
  }
}

pub(crate) async fn retry_scanner(cluster: WeakCluster, queue: Arc<DelayQueue<Arc<Rpc>>>) {
  loop {
    queue.wait().await;
    let cluster = match cluster.upgrade() {
      Some(c) => c,
      None => return,
    };
    if cluster.is_stopped() {
      return;
    }
    let now = Instant::now();
    for rpc in queue.pop_due(now) {
      cluster.retry_rpc(rpc, now);
    }
  }
}

pub(crate) async fn ack_scanner(cluster: WeakCluster, queue: Arc<DelayQueue<Arc<RpcCall>>>) {
  loop {
    queue.wait().await;
    let cluster = match cluster.upgrade() {
      Some(c) => c,
      None => return,
    };
    if cluster.is_stopped() {
      return;
    }
    let now = Instant::now();
    for call in queue.pop_due(now) {
      cluster.retransmit_ack(call, now);
    }
  }
}

#[test]
fn test_pop_due_in_order() {
  let q = DelayQueue::new();
  let now = Instant::now();
  q.push(now + std::time::Duration::from_millis(30), "c");
  q.push(now, "a");
  q.push(now + std::time::Duration::from_millis(10), "b");
  q.push(now + std::time::Duration::from_secs(60), "later");
  assert_eq!(q.pop_due(now + std::time::Duration::from_millis(40)), vec!["a", "b", "c"]);
  assert_eq!(q.len(), 1);
}

#[test]
fn test_wait_until_due() {
  let q = DelayQueue::new();
  let start = Instant::now();
  tokio_test::block_on(async {
    q.push(start + std::time::Duration::from_millis(20), 1u32);
    // The first wait consumes the wakeup from the push.
    q.wait().await;
    q.wait().await;
  });
  assert!(start.elapsed() >= std::time::Duration::from_millis(20));
  assert_eq!(q.pop_due(Instant::now()), vec![1]);
}
