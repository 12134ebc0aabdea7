//! Tools for observing and stressing a cloud: a logger with compile-time and run-time level
//! filtering, and failure injection for outgoing packets.
//!
//! ### Logging
//! Every module defines a `LOG_LEVEL` constant, and calls one of these log macros:
//!
//! - [`trace`](crate::trace)
//! - [`debug`](crate::debug)
//! - [`info`](crate::info)
//! - [`warn`](crate::warn)
//! - [`error`](crate::error)
//! - [`fatal`](crate::fatal)
//!
//! A message is only formatted if its level passes the module's constant, and only printed if it
//! also passes the level the [`Cluster`](crate::cluster::Cluster) was configured with.
//!
//! ```ignore
//! const LEVEL: LogLevel = LogLevel::Debug;
//! // Not logged, Trace is below Debug
//! trace!(LEVEL, &cluster, "kelp");
//! // This is logged, Warn is above Debug
//! warn!(LEVEL, &cluster, "sharks");
//! ```
//!
//! ### Failure Injection
//! A [`FailureConfigMap`] decides, per destination, what fraction of packets is dropped and how
//! long the rest are delayed. Install one with
//! [`Cluster::set_failure_map`](crate::cluster::Cluster::set_failure_map).

mod failure_config;
mod logging;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  logging::Logger,
  logging::LoggerMsg,
  logging::LogLevel,
  logging::LogSpecial,
};
