//! Reliable, at-most-once remote tasks over an unreliable datagram transport.
//!
//! ### The Exchange
//! A caller sends an `Exec` packet naming a registered task. The receiver records the task id in
//! the [`TaskTracker`] for the caller, computes it once, and answers with an `Ack`. The caller
//! completes its [`Rpc`] and replies with an `AckAck`, after which the receiver drops the answer.
//! Every step is retried until the next one is observed:
//! - the caller resends `Exec` with exponential backoff until an `Ack` arrives, or fails the
//!   [`Rpc`] once the target leaves the cloud;
//! - a duplicate `Exec` for a computed task re-sends the saved `Ack`, and one for a task still
//!   computing is ignored;
//! - the receiver resends the `Ack` until the `AckAck` arrives, or forgets the task once the
//!   caller leaves the cloud.
//!
//! ### The Watermark
//! Task ids per caller start at 1. Once every id up to some point has been acknowledged twice, the
//! tracker folds them into a watermark and forgets them, so a late duplicate below the watermark is
//! recognised as already done and dropped without running the task again.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::testkit::LogLevel;

mod call;
mod queue;
mod registry;
mod rpc;
mod tracker;

pub const LOG_LEVEL: LogLevel = LogLevel::Info;

#[rustfmt::skip]
pub(crate) use {
  queue::ack_scanner,
  queue::retry_scanner,
  queue::DelayQueue,
};

#[rustfmt::skip]
pub use {
  call::RpcCall,
  registry::RemoteTask,
  registry::TaskRegistry,
  rpc::Rpc,
  rpc::RpcHandle,
  tracker::Recorded,
  tracker::TaskTracker,
};

/// Configures the reliable task protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConfig {
  /// How long a caller waits for an answer before resending a task. Doubles on every resend.
  ///
  /// default: `300 milliseconds`
  pub retry: Duration,
  /// The cap on the resend interval.
  ///
  /// default: `5 seconds`
  pub max_retry: Duration,
  /// How long a receiver waits for an `AckAck` before resending its answer.
  ///
  /// default: `1 second`
  pub ack_retry: Duration,
  /// The number of TCP connections kept to each node.
  ///
  /// default: `2`
  pub tcp_pool: usize,
  /// The largest packet sent as a single datagram. Larger packets go over TCP.
  ///
  /// default: `1400`
  pub max_udp_payload: usize,
}
impl Default for RpcConfig {
  fn default() -> Self {
    RpcConfig {
      retry: Duration::from_millis(300),
      max_retry: Duration::from_secs(5),
      ack_retry: Duration::from_secs(1),
      tcp_pool: 2,
      max_udp_payload: 1400,
    }
  }
}
