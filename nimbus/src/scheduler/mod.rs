//! Priority-tiered worker pools.
//!
//! Every job runs at a [`Priority`]. Each tier has its own pool of worker threads, so a flood of
//! bulk work at [`Priority::MIN`] can never starve the acknowledgements and key lookups that keep
//! the cloud responsive. On top of that, a worker that picks up a job first drains every
//! higher-tier queue, highest first, before it starts its own.
//!
//! Jobs split themselves with [`Scheduler::fork`] and wait on the pieces with
//! [`ForkHandle::join`]. A join that finds its fork still queued runs it inline. Any other wait,
//! including waiting on a remote answer, goes through [`managed_block`], which adds a worker to
//! the tier when every worker of that tier is blocked.

use serde::{Deserialize, Serialize};

mod cancel;
mod fork;
mod pool;

#[rustfmt::skip]
pub(crate) use {
  fork::panic_message,
};

#[rustfmt::skip]
pub use {
  cancel::CancelToken,
  fork::ForkHandle,
  pool::current_priority,
  pool::managed_block,
  pool::Scheduler,
};

/// The urgency of a job. Higher runs first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);
impl Priority {
  /// Bulk computation, including every map-reduce job.
  pub const MIN: Priority = Priority(0);
  /// Atomic transactions at a key's home.
  pub const ATOMIC: Priority = Priority(1);
  /// Installing a value at its home.
  pub const PUT_KEY: Priority = Priority(2);
  /// Fetching a value from its home.
  pub const GET_KEY: Priority = Priority(3);
  /// Processing an answer to a task we sent.
  pub const ACK: Priority = Priority(4);
  /// Releasing an answer we sent.
  pub const ACK_ACK: Priority = Priority(5);
  pub const MAX: Priority = Priority::ACK_ACK;
  /// The number of tiers.
  pub const LEVELS: usize = 6;

  pub fn new(level: u8) -> Option<Priority> {
    if (level as usize) < Priority::LEVELS {
      Some(Priority(level))
    } else {
      None
    }
  }

  pub fn level(&self) -> u8 {
    self.0
  }

  pub(crate) fn index(&self) -> usize {
    self.0 as usize
  }

  /// Every tier, lowest first.
  pub fn all() -> impl Iterator<Item = Priority> {
    (0..Priority::LEVELS as u8).map(Priority)
  }
}

/// Configures the worker pools of a [`Scheduler`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
  /// The number of workers for [`Priority::MIN`].
  ///
  /// default: `num_cpus::get()`
  pub low_threads: usize,
  /// The number of workers for each tier between [`Priority::MIN`] and [`Priority::MAX`]. With
  /// `0`, jobs of those tiers only run when lower workers drain them.
  ///
  /// default: `num_cpus::get()`
  pub high_threads: usize,
  /// The number of extra workers each tier may start while its workers are blocked.
  ///
  /// default: `256`
  pub max_compensation: usize,
}
impl Default for SchedulerConfig {
  fn default() -> Self {
    SchedulerConfig {
      low_threads: num_cpus::get(),
      high_threads: num_cpus::get(),
      max_compensation: 256,
    }
  }
}
impl SchedulerConfig {
  /// The steady-state number of workers for a tier. [`Priority::MAX`] always has exactly one.
  pub fn threads(&self, p: Priority) -> usize {
    if p == Priority::MIN {
      self.low_threads.max(1)
    } else if p == Priority::MAX {
      1
    } else {
      self.high_threads
    }
  }
}

#[test]
fn test_priority_order() {
  let all = Priority::all().collect::<Vec<_>>();
  assert_eq!(all.len(), Priority::LEVELS);
  assert!(all.windows(2).all(|w| w[0] < w[1]));
  assert_eq!(all[0], Priority::MIN);
  assert_eq!(all[Priority::LEVELS - 1], Priority::MAX);
  assert!(Priority::ACK_ACK > Priority::ACK);
  assert!(Priority::ACK > Priority::GET_KEY);
  assert!(Priority::GET_KEY > Priority::PUT_KEY);
  assert!(Priority::PUT_KEY > Priority::ATOMIC);
  assert_eq!(Priority::new(Priority::LEVELS as u8), None);
}
