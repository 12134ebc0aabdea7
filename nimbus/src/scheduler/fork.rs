use crate::core::TaskError;
use crate::scheduler::{managed_block, Priority, Scheduler};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

type Work<T> = Box<dyn FnOnce() -> T + Send + 'static>;

enum ForkState<T> {
  Queued(Work<T>),
  Running,
  Done(Result<T, TaskError>),
  Joined,
}

struct ForkSlot<T> {
  state: Mutex<ForkState<T>>,
  done: Condvar,
}
impl<T> ForkSlot<T> {
  /// Takes the work if nobody has started it yet.
  fn claim(&self) -> Option<Work<T>> {
    let mut state = self.state.lock().unwrap();
    match std::mem::replace(&mut *state, ForkState::Running) {
      ForkState::Queued(work) => Some(work),
      other => {
        *state = other;
        None
      }
    }
  }

  fn finish(&self, res: Result<T, TaskError>) {
    *self.state.lock().unwrap() = ForkState::Done(res);
    self.done.notify_all();
  }
}

pub(crate) fn panic_message(p: &(dyn Any + Send)) -> String {
  if let Some(s) = p.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = p.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}

fn run_caught<T>(work: Work<T>) -> Result<T, TaskError> {
  catch_unwind(AssertUnwindSafe(work)).map_err(|p| TaskError::Panicked(panic_message(&*p)))
}

/// A forked job. Dropping the handle detaches the job; it still runs.
pub struct ForkHandle<T> {
  slot: Arc<ForkSlot<T>>,
}
impl<T: Send + 'static> ForkHandle<T> {
  pub(crate) fn spawn<F>(scheduler: &Scheduler, p: Priority, f: F) -> ForkHandle<T>
  where
    F: FnOnce() -> T + Send + 'static,
  {
    let slot = Arc::new(ForkSlot {
      state: Mutex::new(ForkState::Queued(Box::new(f))),
      done: Condvar::new(),
    });
    let s = slot.clone();
    scheduler.submit(p, move || {
      if let Some(work) = s.claim() {
        let res = run_caught(work);
        s.finish(res);
      }
    });
    ForkHandle { slot: slot }
  }

  /// Waits for the fork's result. If no worker has started the fork, it runs inline on the
  /// calling thread instead. A panic in the fork comes back as [`TaskError::Panicked`].
  pub fn join(self) -> Result<T, TaskError> {
    if let Some(work) = self.slot.claim() {
      return run_caught(work);
    }
    let slot = self.slot;
    managed_block(move || {
      let mut state = slot.state.lock().unwrap();
      loop {
        match std::mem::replace(&mut *state, ForkState::Joined) {
          ForkState::Done(res) => return res,
          other => {
            *state = other;
            state = slot.done.wait(state).unwrap();
          }
        }
      }
    })
  }

  pub fn is_done(&self) -> bool {
    matches!(*self.slot.state.lock().unwrap(), ForkState::Done(_))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::scheduler::SchedulerConfig;
  use crossbeam::channel::bounded;
  use std::time::Duration;

  fn sched(name: &str) -> Scheduler {
    Scheduler::new(
      name,
      &SchedulerConfig {
        low_threads: 1,
        high_threads: 1,
        max_compensation: 8,
      },
    )
    .unwrap()
  }

  fn sum(sched: Scheduler, lo: u64, hi: u64) -> u64 {
    if hi - lo <= 4 {
      return (lo..hi).sum();
    }
    let mid = (lo + hi) >> 1;
    let s = sched.clone();
    let left = sched.fork(Priority::MIN, move || sum(s, lo, mid));
    let right = sum(sched, mid, hi);
    left.join().unwrap() + right
  }

  #[test]
  fn test_recursive_fork_join() {
    let s = sched("forkjoin");
    let (tx, rx) = bounded(1);
    let s2 = s.clone();
    s.submit(Priority::MIN, move || tx.send(sum(s2, 0, 1000)).unwrap());
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 499500);
    s.shutdown();
  }

  #[test]
  fn test_join_reclaims_unstarted() {
    let s = sched("reclaim");
    let (latch_tx, latch_rx) = bounded::<()>(0);
    let (started_tx, started_rx) = bounded(1);
    s.submit(Priority::MIN, move || {
      started_tx.send(()).unwrap();
      let _ = latch_rx.recv();
    });
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // The only MIN worker is busy, so the fork is still queued and runs here.
    let fork = s.fork(Priority::MIN, || std::thread::current().id());
    assert_eq!(fork.join().unwrap(), std::thread::current().id());
    drop(latch_tx);
    s.shutdown();
  }

  #[test]
  fn test_panic_reported() {
    let s = sched("panic");
    let fork = s.fork(Priority::MIN, || -> u32 { panic!("boom") });
    match fork.join() {
      Err(TaskError::Panicked(msg)) => assert_eq!(msg, "boom"),
      other => panic!("unexpected {:?}", other),
    }
    s.shutdown();
  }
}
