//! The process runtime and cloud membership.
//!
//! A [`Cluster`] is one process's handle on the cloud. Creating one binds the process's sockets,
//! starts its worker pools and background tasks, and begins heartbeating to its seed peers.
//!
//! ### Heartbeats
//! Every `heartbeat_interval`, each process sends a [`HeartBeat`] to its seed peers, the members of
//! its cloud and every peer heard from recently. A heartbeat carries the sender's boot time, the
//! hash of the membership it believes in, and a few load figures. A changed boot time means the
//! sender restarted, and everything tracked for its previous incarnation is dropped. A member that
//! stays silent past the `suspect` window is announced as a [`CloudEvent::LostContact`], once; if
//! it speaks again, a [`CloudEvent::RegainedContact`] follows, also once.
//!
//! ### Reconciliation
//! Membership changes go through a leader. The leader is the smallest [`NodeKey`] among the peers a
//! process currently considers live. When a heartbeat shows disagreement (a stranger, or a member
//! with a different membership hash), the leader proposes its live set under a fresh ballot. Once
//! a strict majority of the proposed members accept, the leader commits and every listed member
//! installs the new [`Cloud`]. Ballots are `(round, leader)` pairs, so competing proposals are
//! always ordered. A proposal that stalls is retried after `proposal_timeout`.
//!
//! ### Using [`cluster`](crate::cluster)
//! ```ignore
//! let mut config = NodeConfig::default();
//! config.socket = Socket::localhost(7001);
//! config.cloud.seed_nodes = im::hashset![Socket::localhost(7002)];
//! let cluster = Cluster::new(config)?;
//! let events = cluster.subscribe();
//! cluster.wait_for_cloud_size(2, Duration::from_secs(10))?;
//! ```
//!
//! [`NodeKey`]: crate::core::NodeKey

use crate::testkit::LogLevel;

mod cloud;
mod cluster;
mod heartbeat;
mod membership;
mod utils;

pub const LOG_LEVEL: LogLevel = LogLevel::Info;

#[rustfmt::skip]
pub(crate) use {
  cluster::WeakCluster,
  heartbeat::heartbeat_loop,
  membership::Ballot,
  membership::Membership,
  membership::Proposal,
};

#[rustfmt::skip]
pub use {
  cloud::Cloud,
  cloud::CloudHandle,
  cloud::membership_hash,
  cluster::Cluster,
  heartbeat::HeartBeat,
  utils::CloudConfig,
  utils::CloudEvent,
  utils::NodeConfig,
  utils::multicast_group,
};
