//! Node identity, addressing, the wire format and the network transport.
//!
//! ### Identity
//! A peer is identified by a [`NodeKey`]: its IPv4 address and UDP port. Identities are interned
//! in a [`NodeRegistry`], so every part of a process that talks about a peer holds the same
//! [`Node`] and sees the same bookkeeping: the last time we heard from it, its latest
//! [`HeartBeat`](crate::cluster::HeartBeat), the tasks we sent it and the tasks it sent us.
//!
//! ### Packets
//! Everything on the wire is a [`Packet`]: a fixed-size [`PacketHeader`] followed by a payload.
//! Small packets travel over UDP. Packets too big for a datagram are written to a pooled TCP
//! connection with the same framing.
//!
//! ```ignore
//! let header = PacketHeader {
//!   opcode: Opcode::Heartbeat,
//!   sender: cluster.self_key(),
//!   task: 0,
//!   len: 0,
//! };
//! ```
//!
//! ### Addresses
//! A [`Socket`] is a configured address, which may use a DNS name. It is resolved to a
//! [`NodeKey`] once, at startup. Only IPv4 addresses are supported.

use crate::testkit::LogLevel;

mod errors;
mod node;
mod packets;
mod receiver;
mod remoting;
mod transport;

pub const LOG_LEVEL: LogLevel = LogLevel::Warn;

#[rustfmt::skip]
pub(crate) use {
  node::millis_since_epoch,
  packets::deserialize,
  packets::serialize,
  receiver::tcp_acceptor,
  receiver::udp_receiver,
  transport::Transport,
};

#[rustfmt::skip]
pub use {
  errors::BoxError,
  errors::Error,
  errors::TaskError,
  node::Node,
  node::NodeRegistry,
  packets::Opcode,
  packets::Packet,
  packets::PacketHeader,
  remoting::Host,
  remoting::NodeKey,
  remoting::Socket,
  remoting::parse_flatfile,
  remoting::read_flatfile,
};
