#![warn(missing_docs)]

//! `Nimbus` turns a set of peer processes into a single in-memory compute cloud. Every process runs
//! the same code, hears every other process through heartbeats, agrees on a consistent membership
//! snapshot, and serves a keyed store whose entries are homed by hashing over that snapshot. Work
//! is shipped between processes as reliable at-most-once tasks and scheduled locally by priority,
//! so that control traffic is never starved by bulk computation. On top of this substrate sits a
//! recursive map-reduce engine that fans a job out across the cloud, maps every chunk of a frame on
//! the node that homes it, and reduces the partial results back along the same tree.
//!
//! The crate is split into:
//! - [`core`]: node identity, addressing, packets and the network transport.
//! - [`cluster`]: the process runtime, heartbeats and cloud membership.
//! - [`rpc`]: reliable remote task execution with duplicate suppression.
//! - [`scheduler`]: priority tiered worker pools with fork/join.
//! - [`store`]: keys, values, compare-and-swap and atomic transactions.
//! - [`mr`]: frames, vectors, chunks and the distributed map-reduce engine.
//! - [`testkit`]: logging and failure injection.

pub mod cluster;
pub mod core;
pub mod mr;
pub mod rpc;
pub mod scheduler;
pub mod store;
pub mod testkit;

#[doc(hidden)]
pub mod test_commons;
