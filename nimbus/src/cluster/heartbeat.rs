use crate::cluster::{Cluster, CloudEvent, WeakCluster, LOG_LEVEL};
use crate::core::{millis_since_epoch, serialize, Node, NodeKey, Opcode, Packet, TaskError};
use crate::scheduler::Priority;
use crate::testkit::{LogSpecial, LoggerMsg};
use crate::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// What a process tells its peers about itself on every beat.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartBeat {
  /// Identifies one incarnation of the process. Zero until the first heartbeat arrives.
  pub boot_ms: u64,
  pub cloud_name: u64,
  pub cloud_hash: u64,
  pub cloud_size: u32,
  pub cloud_idx: u8,
  pub tcp_port: u16,
  pub num_cpus: u32,
  pub keys: u64,
  pub rpcs: u32,
  pub queue_depths: Vec<u32>,
  pub pool_sizes: Vec<u32>,
}

pub(crate) async fn heartbeat_loop(cluster: WeakCluster, interval: Duration) {
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  loop {
    ticker.tick().await;
    let cluster = match cluster.upgrade() {
      Some(c) => c,
      None => return,
    };
    if cluster.is_stopped() {
      return;
    }
    cluster.beat(millis_since_epoch());
  }
}

/// Checks `nodes` for members going silent or coming back. Each transition is reported once.
pub(crate) fn scan_contacts(nodes: &[Arc<Node>], now: u64, suspect: u64) -> Vec<CloudEvent> {
  let mut events = Vec::new();
  for node in nodes.iter().filter(|n| !n.is_self()) {
    let silent = now.saturating_sub(node.last_heard_from());
    if silent > suspect {
      if node.mark_lost_contact() {
        events.push(CloudEvent::LostContact(node.key()));
      }
    } else if node.mark_regained_contact() {
      events.push(CloudEvent::RegainedContact(node.key()));
    }
  }
  events
}

impl Cluster {
  pub(crate) fn make_heartbeat(&self) -> HeartBeat {
    let cloud = self.cloud();
    let sched = self.scheduler();
    HeartBeat {
      boot_ms: self.boot_ms(),
      cloud_name: self.inner.name_hash,
      cloud_hash: cloud.hash(),
      cloud_size: cloud.size() as u32,
      cloud_idx: cloud.idx(),
      tcp_port: self.inner.tcp_port,
      num_cpus: num_cpus::get() as u32,
      keys: self.store().len() as u64,
      rpcs: self.nodes().all().iter().map(|n| n.pending_tasks() as u32).sum(),
      queue_depths: Priority::all().map(|p| sched.queue_depth(p) as u32).collect(),
      pool_sizes: Priority::all().map(|p| sched.pool_size(p) as u32).collect(),
    }
  }

  /// The peers to heartbeat: seed peers, members and anyone heard from within `timeout`.
  fn heartbeat_targets(&self, now: u64) -> Vec<Arc<Node>> {
    let timeout = self.config().cloud.timeout.as_millis() as u64;
    let mut targets = BTreeMap::new();
    for node in self.inner.peers.iter().chain(self.cloud().members()) {
      targets.insert(node.key(), node.clone());
    }
    for node in self.nodes().all() {
      if node.heartbeat().boot_ms != 0 && now.saturating_sub(node.last_heard_from()) <= timeout {
        targets.insert(node.key(), node);
      }
    }
    targets.remove(&self.self_key());
    targets.into_iter().map(|(_, n)| n).collect()
  }

  /// One heartbeat round.
  pub(crate) fn beat(&self, now: u64) {
    let hb = Arc::new(self.make_heartbeat());
    self.self_node().touch(now);
    self.self_node().set_heartbeat(hb.clone());
    let packet = match serialize(&*hb) {
      Ok(payload) => Packet::new(Opcode::Heartbeat, self.self_key(), 0, &payload[..]),
      Err(e) => {
        warn!(LOG_LEVEL, self, format!("Could not encode heartbeat: {}", e));
        return;
      }
    };
    for node in self.heartbeat_targets(now) {
      if let Err(e) = self.transport().send(&node, &packet) {
        debug!(LOG_LEVEL, self, format!("Heartbeat to {} failed: {}", node.key(), e));
      }
    }
    if let Some(addr) = self.inner.multicast {
      if let Err(e) = self.transport().send_to_addr(addr, &packet) {
        debug!(LOG_LEVEL, self, format!("Multicast heartbeat failed: {}", e));
      }
    }
    self.report_traffic();

    let cloud = self.cloud();
    let mut watched = cloud.members().to_vec();
    watched.extend(
      self
        .nodes()
        .all()
        .into_iter()
        .filter(|n| n.has_lost_contact() && !cloud.contains(&n.key())),
    );
    let suspect = self.config().cloud.suspect.as_millis() as u64;
    for event in scan_contacts(&watched[..], now, suspect) {
      match &event {
        CloudEvent::LostContact(k) => {
          warn!(LOG_LEVEL, self, format!("Lost contact with {}", k))
        }
        CloudEvent::RegainedContact(k) => {
          info!(LOG_LEVEL, self, format!("Regained contact with {}", k))
        }
        CloudEvent::CloudChanged(_) => {}
      }
      self.publish(event);
    }
    self.membership_tick(now);
  }

  fn report_traffic(&self) {
    let sent = self.transport().bytes_sent();
    let recvd = self.transport().bytes_recvd();
    let last_sent = self.inner.reported_sent.swap(sent, Ordering::Relaxed);
    let last_recvd = self.inner.reported_recvd.swap(recvd, Ordering::Relaxed);
    let _ = self
      .inner
      .logger
      .send(LoggerMsg::Special(LogSpecial::SentBytes(sent - last_sent)));
    let _ = self
      .inner
      .logger
      .send(LoggerMsg::Special(LogSpecial::RecvdBytes(recvd - last_recvd)));
  }

  pub(crate) fn on_heartbeat(&self, sender: &Arc<Node>, hb: HeartBeat) {
    if sender.is_self() || hb.cloud_name != self.inner.name_hash {
      return;
    }
    let old = sender.set_heartbeat(Arc::new(hb.clone()));
    if old.boot_ms == 0 {
      debug!(LOG_LEVEL, self, format!("First heartbeat from {}", sender.key()));
    } else if old.boot_ms != hb.boot_ms {
      info!(LOG_LEVEL, self, format!("{} restarted", sender.key()));
      for rpc in sender.rebooted(hb.boot_ms) {
        rpc.complete(Err(TaskError::Unreachable(sender.key())));
      }
    }
    self.observe_heartbeat(sender, &hb, millis_since_epoch());
  }

  /// The last heartbeat received from `key`, if any.
  pub fn heartbeat_of(&self, key: &NodeKey) -> Option<Arc<HeartBeat>> {
    self
      .nodes()
      .get(key)
      .map(|n| n.heartbeat())
      .filter(|hb| hb.boot_ms != 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::NodeRegistry;
  use std::net::Ipv4Addr;

  #[test]
  fn test_contact_transitions_fire_once() {
    let reg = NodeRegistry::new(NodeKey::new(Ipv4Addr::LOCALHOST, 7001), 1);
    let me = reg.intern(NodeKey::new(Ipv4Addr::LOCALHOST, 7001));
    let peer = reg.intern(NodeKey::new(Ipv4Addr::LOCALHOST, 7002));
    let nodes = vec![me.clone(), peer.clone()];
    peer.touch(1_000);
    assert!(scan_contacts(&nodes[..], 1_500, 1_000).is_empty());

    let events = scan_contacts(&nodes[..], 2_500, 1_000);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], CloudEvent::LostContact(k) if k == peer.key()));
    assert!(scan_contacts(&nodes[..], 3_000, 1_000).is_empty());
    assert!(peer.has_lost_contact());

    peer.touch(3_100);
    let events = scan_contacts(&nodes[..], 3_200, 1_000);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], CloudEvent::RegainedContact(k) if k == peer.key()));
    assert!(scan_contacts(&nodes[..], 3_300, 1_000).is_empty());
  }

  #[test]
  fn test_heartbeat_encoding() {
    let hb = HeartBeat {
      boot_ms: 17,
      tcp_port: 7100,
      queue_depths: vec![0, 1, 2],
      ..HeartBeat::default()
    };
    let bytes = serialize(&hb).unwrap();
    let back: HeartBeat = crate::core::deserialize(&bytes[..]).unwrap();
    assert_eq!(hb, back);
  }
}
