//! Frames of columnar data and the distributed map-reduce engine.
//!
//! A [`Frame`] is a set of [`Vector`]s that share a group and a chunk layout. Chunk `i` of every
//! vector in a group lives on the same node, so a map function sees whole rows. A job implements
//! [`MapReduce`] and is submitted with [`Cluster::submit`]. The submitting node splits the nodes that
//! home chunks into two halves and ships each half to one of its members, which split again. Every
//! node then bisects its chunk range on its own [`Scheduler`] down to single chunks, maps the ones
//! it homes, and reduces the results back up both trees.
//!
//! [`Cluster::submit`]: crate::cluster::Cluster::submit
//! [`Scheduler`]: crate::scheduler::Scheduler

use crate::testkit::LogLevel;

mod engine;
mod frame;
mod handle;

pub const LOG_LEVEL: LogLevel = LogLevel::Info;

#[rustfmt::skip]
pub(crate) use {
  engine::register_builtins,
};

#[rustfmt::skip]
pub use {
  engine::JobDescriptor,
  engine::MapReduce,
  frame::AppendableVec,
  frame::Chunk,
  frame::Frame,
  frame::NewChunk,
  frame::Vector,
  handle::JobHandle,
  handle::JobResult,
};
