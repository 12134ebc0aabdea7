//! The keyed store.
//!
//! Every process holds a [`Store`] of [`Key`] to [`Value`]. Which process is the home of a key is
//! a pure function of the key and the current [`Cloud`](crate::cluster::Cloud): hash the key, add
//! the replica number, take it modulo the cloud size. Chunks of a vector group hash by group and
//! chunk index, so chunk `i` of every vector in a group lands on the same node.
//!
//! Updates go through [`Store::put_if_match`], a compare-and-swap on the identity of the current
//! value. Read-modify-write sequences are written as an [`Atomic`], which is shipped to the key's
//! home and retried there until its swap succeeds or it gives up.

use crate::testkit::LogLevel;

mod atomic;
mod key;
mod store;
mod tasks;
mod value;

pub const LOG_LEVEL: LogLevel = LogLevel::Info;

#[rustfmt::skip]
pub(crate) use {
  key::hash_bytes,
  tasks::GetKey,
  tasks::PutKey,
};

#[rustfmt::skip]
pub use {
  atomic::Atomic,
  atomic::AtomicHandle,
  atomic::AtomicOutcome,
  key::Key,
  key::KeyKind,
  store::Store,
  value::Value,
};
