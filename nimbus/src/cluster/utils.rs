use crate::cluster::Cloud;
use crate::core::{Error, NodeKey, Socket};
use crate::rpc::RpcConfig;
use crate::scheduler::SchedulerConfig;
use crate::store::hash_bytes;
use crate::testkit::LogLevel;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Published to every subscriber of a [`Cluster`](crate::cluster::Cluster).
#[derive(Clone, Debug)]
pub enum CloudEvent {
  /// A new membership was installed.
  CloudChanged(Arc<Cloud>),
  /// The node has been silent for longer than the suspect window.
  LostContact(NodeKey),
  /// A node announced as lost was heard from again.
  RegainedContact(NodeKey),
}
impl CloudEvent {
  /// The node a contact event is about.
  pub fn node(&self) -> Option<NodeKey> {
    match self {
      CloudEvent::CloudChanged(_) => None,
      CloudEvent::LostContact(k) | CloudEvent::RegainedContact(k) => Some(*k),
    }
  }
}

/// How a process finds its peers and agrees with them on membership.
#[derive(Clone, Debug)]
pub struct CloudConfig {
  /// Processes only join clouds with the same name.
  ///
  /// default: `"nimbus"`
  pub name: String,
  /// default: 1 second
  pub heartbeat_interval: Duration,
  /// A non-member heard from within this window may be proposed as a member.
  ///
  /// default: 60 seconds
  pub timeout: Duration,
  /// A member silent for longer than this is announced as lost.
  ///
  /// default: 60.5 seconds
  pub suspect: Duration,
  /// Peers heartbeated from startup on.
  ///
  /// default: empty
  pub seed_nodes: im::HashSet<Socket>,
  /// A file of `host[:port]` lines. When present, its peers are heartbeated from startup on, and
  /// no process outside it may become a member.
  ///
  /// default: `None`
  pub flatfile: Option<PathBuf>,
  /// Also heartbeat to a multicast group derived from `name`.
  ///
  /// default: `false`
  pub multicast: bool,
  /// Drop members announced as lost at the next reconciliation.
  ///
  /// default: `true`
  pub evict_lost: bool,
  /// How long a leader waits for a majority before proposing again.
  ///
  /// default: 2 seconds
  pub proposal_timeout: Duration,
}
impl Default for CloudConfig {
  fn default() -> Self {
    CloudConfig {
      name: "nimbus".to_string(),
      heartbeat_interval: Duration::from_secs(1),
      timeout: Duration::from_secs(60),
      suspect: Duration::from_millis(60_500),
      seed_nodes: im::HashSet::new(),
      flatfile: None,
      multicast: false,
      evict_lost: true,
      proposal_timeout: Duration::from_secs(2),
    }
  }
}

/// Everything needed to start a [`Cluster`](crate::cluster::Cluster).
#[derive(Clone, Debug)]
pub struct NodeConfig {
  /// default: `Socket::localhost(54321)`
  pub socket: Socket,
  pub cloud: CloudConfig,
  pub rpc: RpcConfig,
  pub scheduler: SchedulerConfig,
  /// default: `LogLevel::Info`
  pub log_level: LogLevel,
}
impl Default for NodeConfig {
  fn default() -> Self {
    NodeConfig {
      socket: Socket::default(),
      cloud: CloudConfig::default(),
      rpc: RpcConfig::default(),
      scheduler: SchedulerConfig::default(),
      log_level: LogLevel::Info,
    }
  }
}
impl NodeConfig {
  pub fn validate(&self) -> Result<(), Error> {
    let reject = |msg: &str| Err(Error::Config(msg.to_string()));
    if self.cloud.name.is_empty() {
      return reject("cloud name is empty");
    }
    if self.cloud.heartbeat_interval.is_zero() {
      return reject("heartbeat_interval must be positive");
    }
    if self.cloud.suspect < self.cloud.heartbeat_interval {
      return reject("suspect must be at least one heartbeat_interval");
    }
    // A node must stay proposable for the whole time it may go silent before it is lost.
    if self.cloud.suspect <= self.cloud.timeout {
      return reject("suspect must be longer than timeout");
    }
    if self.rpc.retry.is_zero() || self.rpc.max_retry < self.rpc.retry {
      return reject("rpc retry must be positive and no larger than max_retry");
    }
    if self.rpc.tcp_pool == 0 {
      return reject("tcp_pool must be positive");
    }
    if self.rpc.max_udp_payload < 64 {
      return reject("max_udp_payload is too small");
    }
    Ok(())
  }
}

/// The multicast group and port a cloud named `name` heartbeats to.
pub fn multicast_group(name: &str) -> SocketAddrV4 {
  let h = hash_bytes(name.as_bytes());
  let ip = Ipv4Addr::new(239, (h >> 8) as u8, (h >> 16) as u8, (h >> 24) as u8 | 1);
  let port = 20000 + ((h >> 32) % 20000) as u16;
  SocketAddrV4::new(ip, port)
}

#[test]
fn test_default_config_is_valid() {
  let config = NodeConfig::default();
  assert!(config.validate().is_ok());
  assert!(config.cloud.suspect > config.cloud.timeout);
  let mut bad = config.clone();
  bad.rpc.tcp_pool = 0;
  assert!(matches!(bad.validate(), Err(Error::Config(_))));
}

#[test]
fn test_suspect_must_exceed_timeout() {
  let mut config = NodeConfig::default();
  config.cloud.suspect = config.cloud.timeout;
  assert!(matches!(config.validate(), Err(Error::Config(_))));
  config.cloud.suspect = config.cloud.timeout - Duration::from_millis(1);
  assert!(matches!(config.validate(), Err(Error::Config(_))));
  config.cloud.suspect = config.cloud.timeout + Duration::from_millis(1);
  assert!(config.validate().is_ok());
}

#[test]
fn test_multicast_group_stable() {
  let a = multicast_group("alpha");
  assert_eq!(a, multicast_group("alpha"));
  assert!(a.ip().is_multicast());
  assert_ne!(a, multicast_group("beta"));
}
