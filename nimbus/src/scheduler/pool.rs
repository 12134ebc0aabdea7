use crate::core::Error;
use crate::scheduler::{ForkHandle, Priority, SchedulerConfig};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

// How long an idle worker waits before checking whether it is surplus.
const IDLE_POLL: Duration = Duration::from_millis(100);

struct Tier {
  tx: Sender<Job>,
  rx: Receiver<Job>,
  target: usize,
  live: AtomicUsize,
  blocked: AtomicUsize,
}

struct Shared {
  name: String,
  tiers: Vec<Tier>,
  max_compensation: usize,
  stopped: AtomicBool,
}
impl Shared {
  fn drain_above(&self, tier: usize) {
    let mut p = self.tiers.len() - 1;
    while p > tier {
      // Re-check the same queue after each job: it may have refilled.
      match self.tiers[p].rx.try_recv() {
        Ok(job) => run_job(p, job),
        Err(_) => p -= 1,
      }
    }
  }

  fn try_retire(&self, tier: usize) -> bool {
    let t = &self.tiers[tier];
    let mut live = t.live.load(Ordering::Acquire);
    loop {
      if live <= t.target {
        return false;
      }
      match t
        .live
        .compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => return true,
        Err(l) => live = l,
      }
    }
  }
}

#[derive(Clone)]
struct WorkerCtx {
  shared: Arc<Shared>,
  tier: usize,
}

thread_local! {
  static WORKER: RefCell<Option<WorkerCtx>> = RefCell::new(None);
  static CURRENT: Cell<Option<Priority>> = Cell::new(None);
}

/// The priority of the job running on this thread, if it is a worker.
pub fn current_priority() -> Option<Priority> {
  CURRENT.with(|c| c.get())
}

fn run_job(tier: usize, job: Job) {
  let prev = CURRENT.with(|c| c.replace(Priority::new(tier as u8)));
  // Jobs that need their panics reported catch them themselves.
  let _ = catch_unwind(AssertUnwindSafe(job));
  CURRENT.with(|c| c.set(prev));
}

fn spawn_worker(shared: &Arc<Shared>, tier: usize) -> std::io::Result<()> {
  shared.tiers[tier].live.fetch_add(1, Ordering::AcqRel);
  let s = shared.clone();
  let res = std::thread::Builder::new()
    .name(format!("{}-p{}", shared.name, tier))
    .spawn(move || worker_loop(s, tier));
  if res.is_err() {
    shared.tiers[tier].live.fetch_sub(1, Ordering::AcqRel);
  }
  res.map(|_| ())
}

fn worker_loop(shared: Arc<Shared>, tier: usize) {
  WORKER.with(|w| {
    *w.borrow_mut() = Some(WorkerCtx {
      shared: shared.clone(),
      tier: tier,
    })
  });
  loop {
    if shared.stopped.load(Ordering::Acquire) {
      break;
    }
    match shared.tiers[tier].rx.recv_timeout(IDLE_POLL) {
      Ok(job) => {
        shared.drain_above(tier);
        run_job(tier, job);
      }
      Err(RecvTimeoutError::Timeout) => {
        // Tiers with no workers of their own rely on this.
        shared.drain_above(tier);
        if shared.try_retire(tier) {
          WORKER.with(|w| w.borrow_mut().take());
          return;
        }
      }
      Err(RecvTimeoutError::Disconnected) => break,
    }
  }
  shared.tiers[tier].live.fetch_sub(1, Ordering::AcqRel);
  WORKER.with(|w| w.borrow_mut().take());
}

struct Unblock<'a>(&'a AtomicUsize);
impl<'a> Drop for Unblock<'a> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::AcqRel);
  }
}

/// Runs `f`, which is expected to block. On a worker thread, the worker counts as blocked while
/// `f` runs, and if that leaves its tier with no runnable worker, another worker is started so
/// that queued jobs (often the very ones `f` waits on) still make progress.
pub fn managed_block<T, F: FnOnce() -> T>(f: F) -> T {
  let ctx = WORKER.with(|w| w.borrow().clone());
  let ctx = match ctx {
    Some(c) => c,
    None => return f(),
  };
  let t = &ctx.shared.tiers[ctx.tier];
  let blocked = t.blocked.fetch_add(1, Ordering::AcqRel) + 1;
  let _unblock = Unblock(&t.blocked);
  let live = t.live.load(Ordering::Acquire);
  if blocked >= live && live < t.target.max(1) + ctx.shared.max_compensation {
    // Out of threads, the blocked job just waits without help.
    let _ = spawn_worker(&ctx.shared, ctx.tier);
  }
  f()
}

/// Per-process worker pools, one per [`Priority`].
#[derive(Clone)]
pub struct Scheduler {
  shared: Arc<Shared>,
}
impl Scheduler {
  pub fn new(name: &str, config: &SchedulerConfig) -> Result<Scheduler, Error> {
    let tiers = Priority::all()
      .map(|p| {
        let (tx, rx) = unbounded();
        Tier {
          tx: tx,
          rx: rx,
          target: config.threads(p),
          live: AtomicUsize::new(0),
          blocked: AtomicUsize::new(0),
        }
      })
      .collect();
    let shared = Arc::new(Shared {
      name: name.to_string(),
      tiers: tiers,
      max_compensation: config.max_compensation,
      stopped: AtomicBool::new(false),
    });
    for p in Priority::all() {
      for _ in 0..config.threads(p) {
        spawn_worker(&shared, p.index())?;
      }
    }
    Ok(Scheduler { shared: shared })
  }

  /// Queues `f` at priority `p`.
  pub fn submit<F: FnOnce() + Send + 'static>(&self, p: Priority, f: F) {
    // The receiver lives in `shared`, so this cannot fail.
    let _ = self.shared.tiers[p.index()].tx.send(Box::new(f));
  }

  /// Queues `f` at priority `p`, returning a handle to join on.
  pub fn fork<T, F>(&self, p: Priority, f: F) -> ForkHandle<T>
  where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
  {
    ForkHandle::spawn(self, p, f)
  }

  /// The number of jobs waiting at priority `p`.
  pub fn queue_depth(&self, p: Priority) -> usize {
    self.shared.tiers[p.index()].rx.len()
  }

  /// The number of live workers at priority `p`, including compensating ones.
  pub fn pool_size(&self, p: Priority) -> usize {
    self.shared.tiers[p.index()].live.load(Ordering::Acquire)
  }

  /// Stops every worker once its current job finishes. Queued jobs are abandoned.
  pub fn shutdown(&self) {
    self.shared.stopped.store(true, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crossbeam::channel::bounded;
  use std::sync::Mutex;

  fn config(low: usize, high: usize) -> SchedulerConfig {
    SchedulerConfig {
      low_threads: low,
      high_threads: high,
      max_compensation: 8,
    }
  }

  #[test]
  fn test_high_tier_not_starved() {
    let sched = Scheduler::new("starve", &config(2, 1)).unwrap();
    let (latch_tx, latch_rx) = bounded::<()>(0);
    let order = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
      let rx = latch_rx.clone();
      sched.submit(Priority::MIN, move || {
        let _ = rx.recv();
      });
    }
    let o = order.clone();
    sched.submit(Priority::MIN, move || o.lock().unwrap().push("low"));
    let (done_tx, done_rx) = bounded(1);
    let o = order.clone();
    sched.submit(Priority::GET_KEY, move || {
      o.lock().unwrap().push("high");
      done_tx.send(()).unwrap();
    });
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["high"]);
    drop(latch_tx);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    sched.shutdown();
  }

  #[test]
  fn test_drain_higher_first() {
    // No dedicated workers between MIN and MAX: GET_KEY jobs only run when drained.
    let sched = Scheduler::new("drain", &config(1, 0)).unwrap();
    let (latch_tx, latch_rx) = bounded::<()>(0);
    let (started_tx, started_rx) = bounded(1);
    sched.submit(Priority::MIN, move || {
      started_tx.send(()).unwrap();
      let _ = latch_rx.recv();
    });
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let (tx, rx) = unbounded();
    let t = tx.clone();
    sched.submit(Priority::MIN, move || t.send(("low", current_priority())).unwrap());
    let t = tx.clone();
    sched.submit(Priority::GET_KEY, move || {
      t.send(("high", current_priority())).unwrap()
    });
    drop(latch_tx);
    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, ("high", Some(Priority::GET_KEY)));
    assert_eq!(second, ("low", Some(Priority::MIN)));
    sched.shutdown();
  }

  #[test]
  fn test_idle_workers_drain_unstaffed_tier() {
    let sched = Scheduler::new("idle", &config(2, 0)).unwrap();
    assert_eq!(sched.pool_size(Priority::GET_KEY), 0);
    let (tx, rx) = bounded(1);
    sched.submit(Priority::GET_KEY, move || {
      tx.send(current_priority()).unwrap()
    });
    let ran = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(ran, Some(Priority::GET_KEY));
    sched.shutdown();
  }

  #[test]
  fn test_managed_block_compensates() {
    let sched = Scheduler::new("block", &config(1, 1)).unwrap();
    let (tx, rx) = bounded::<u32>(0);
    let (out_tx, out_rx) = bounded(1);
    sched.submit(Priority::MIN, move || {
      let v = managed_block(|| rx.recv().unwrap());
      out_tx.send(v).unwrap();
    });
    // With one worker blocked, this only runs on a compensating worker.
    sched.submit(Priority::MIN, move || tx.send(42).unwrap());
    assert_eq!(out_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    sched.shutdown();
  }

  #[test]
  fn test_queue_depth() {
    let sched = Scheduler::new("depth", &config(1, 1)).unwrap();
    let (latch_tx, latch_rx) = bounded::<()>(0);
    let (started_tx, started_rx) = bounded(1);
    sched.submit(Priority::MIN, move || {
      started_tx.send(()).unwrap();
      let _ = latch_rx.recv();
    });
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    sched.submit(Priority::MIN, || {});
    sched.submit(Priority::MIN, || {});
    assert_eq!(sched.queue_depth(Priority::MIN), 2);
    assert_eq!(sched.pool_size(Priority::MIN), 1);
    assert_eq!(sched.pool_size(Priority::MAX), 1);
    drop(latch_tx);
    sched.shutdown();
  }
}
