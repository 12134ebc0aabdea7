use crate::core::{Node, NodeKey};
use crate::store::{Key, KeyKind};
use itertools::Itertools;
use smallvec::SmallVec;
use std::hash::Hasher;
use std::sync::{Arc, Mutex, RwLock};
use wyhash::WyHash;

/// Hashes an ordered member list. Never zero.
pub fn membership_hash(keys: &[NodeKey]) -> u64 {
  let mut hasher = WyHash::with_seed(0);
  for k in keys {
    hasher.write(&k.to_bytes()[..]);
  }
  hasher.finish().max(1)
}

/// An immutable snapshot of the cloud: its members in [`NodeKey`] order, a hash of the member list
/// and a wrapping generation index.
pub struct Cloud {
  members: Vec<Arc<Node>>,
  keys: Vec<NodeKey>,
  hash: u64,
  idx: u8,
}
impl Cloud {
  pub(crate) fn new(mut members: Vec<Arc<Node>>, idx: u8) -> Cloud {
    members.sort_by_key(|n| n.key());
    members.dedup_by_key(|n| n.key());
    let keys = members.iter().map(|n| n.key()).collect_vec();
    Cloud {
      hash: membership_hash(&keys[..]),
      members: members,
      keys: keys,
      idx: idx,
    }
  }

  pub fn members(&self) -> &[Arc<Node>] {
    &self.members[..]
  }

  pub fn keys(&self) -> &[NodeKey] {
    &self.keys[..]
  }

  pub fn size(&self) -> usize {
    self.members.len()
  }

  pub fn hash(&self) -> u64 {
    self.hash
  }

  /// The generation of this snapshot. Wraps from 255 to 1; 0 is the empty boot cloud.
  pub fn idx(&self) -> u8 {
    self.idx
  }

  /// The smallest member.
  pub fn leader(&self) -> Option<&Arc<Node>> {
    self.members.first()
  }

  /// The dense index of `key` among the members.
  pub fn nidx(&self, key: &NodeKey) -> Option<usize> {
    self.keys.binary_search(key).ok()
  }

  pub fn contains(&self, key: &NodeKey) -> bool {
    self.nidx(key).is_some()
  }

  /// Whether generation `nnn` is newer than or equal to `old`, allowing for wrap-around.
  pub fn larger(nnn: u8, old: u8) -> bool {
    nnn.wrapping_sub(old) < 64
  }

  /// The member index of replica `repl` of `key`. Pinned system keys go to their listed nodes
  /// that are members first, then to hashed members not already used. The first `size()`
  /// replicas of a key are always distinct members.
  pub fn replica_index(&self, key: &Key, repl: usize) -> Option<usize> {
    if self.members.is_empty() {
      return None;
    }
    let size = self.size();
    if key.kind() != KeyKind::System {
      return Some(key.hashed_index(size, repl));
    }
    let mut used: SmallVec<[usize; 4]> = SmallVec::new();
    for i in key.pinned().iter().filter_map(|p| self.nidx(p)) {
      if !used.contains(&i) {
        used.push(i);
      }
    }
    let want = repl % size;
    let mut k = 0;
    while used.len() <= want {
      let i = key.hashed_index(size, k);
      if !used.contains(&i) {
        used.push(i);
      }
      k += 1;
    }
    Some(used[want])
  }

  pub fn replica(&self, key: &Key, repl: usize) -> Option<&Arc<Node>> {
    self.replica_index(key, repl).map(|i| &self.members[i])
  }

  /// The node responsible for `key`.
  pub fn home(&self, key: &Key) -> Option<&Arc<Node>> {
    self.replica(key, 0)
  }
}
impl std::fmt::Debug for Cloud {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Cloud")
      .field("idx", &self.idx)
      .field("hash", &format_args!("{:#018x}", self.hash))
      .field("members", &self.keys)
      .finish()
  }
}

pub(crate) fn next_idx(idx: u8) -> u8 {
  if idx == u8::MAX {
    1
  } else {
    idx + 1
  }
}

/// The current [`Cloud`] of a process, and the hashes of the last 256 it installed.
pub struct CloudHandle {
  current: RwLock<Arc<Cloud>>,
  history: Mutex<Vec<u64>>,
}
impl CloudHandle {
  pub(crate) fn new(initial: Cloud) -> CloudHandle {
    let mut history = vec![0u64; 256];
    history[initial.idx() as usize] = initial.hash();
    CloudHandle {
      current: RwLock::new(Arc::new(initial)),
      history: Mutex::new(history),
    }
  }

  pub fn current(&self) -> Arc<Cloud> {
    self.current.read().unwrap().clone()
  }

  /// Publishes a new snapshot of `members`, unless it has the same members as the current one.
  pub(crate) fn install(&self, members: Vec<Arc<Node>>) -> Option<Arc<Cloud>> {
    let mut current = self.current.write().unwrap();
    let mut keys = members.iter().map(|n| n.key()).collect_vec();
    keys.sort();
    keys.dedup();
    if keys[..] == current.keys[..] {
      return None;
    }
    let cloud = Arc::new(Cloud::new(members, next_idx(current.idx())));
    self.history.lock().unwrap()[cloud.idx() as usize] = cloud.hash();
    *current = cloud.clone();
    Some(cloud)
  }

  /// Whether `hash` names one of the recent clouds before the current one. A heartbeat carrying
  /// such a hash comes from a member that has not caught up yet.
  pub fn is_id_from_prev_cloud(&self, hash: u64) -> bool {
    let current = self.current();
    hash != current.hash() && self.history.lock().unwrap().contains(&hash)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::NodeRegistry;
  use std::net::Ipv4Addr;

  fn nodes(ports: &[u16]) -> (NodeRegistry, Vec<Arc<Node>>) {
    let reg = NodeRegistry::new(NodeKey::new(Ipv4Addr::LOCALHOST, ports[0]), 1);
    let nodes = ports
      .iter()
      .map(|p| reg.intern(NodeKey::new(Ipv4Addr::LOCALHOST, *p)))
      .collect();
    (reg, nodes)
  }

  #[test]
  fn test_sorted_and_indexed() {
    let (_reg, n) = nodes(&[7003, 7001, 7002, 7001]);
    let cloud = Cloud::new(n.clone(), 1);
    assert_eq!(cloud.size(), 3);
    let ports = cloud.keys().iter().map(|k| k.port()).collect_vec();
    assert_eq!(ports, vec![7001, 7002, 7003]);
    assert_eq!(cloud.leader().unwrap().key().port(), 7001);
    assert_eq!(n[0].index(&cloud), Some(2));
    let reordered = Cloud::new(vec![n[2].clone(), n[1].clone(), n[0].clone()], 9);
    assert_eq!(reordered.hash(), cloud.hash());
  }

  #[test]
  fn test_larger_wraps() {
    assert!(Cloud::larger(5, 3));
    assert!(!Cloud::larger(3, 5));
    assert!(Cloud::larger(2, 250));
    assert!(!Cloud::larger(250, 2));
    assert!(Cloud::larger(7, 7));
    assert_eq!(next_idx(255), 1);
    assert_eq!(next_idx(1), 2);
  }

  #[test]
  fn test_install_and_history() {
    let (_reg, n) = nodes(&[7001, 7002, 7003]);
    let handle = CloudHandle::new(Cloud::new(vec![n[0].clone()], 1));
    let first = handle.current().hash();
    assert!(handle.install(vec![n[0].clone()]).is_none());
    let c2 = handle.install(n.clone()).unwrap();
    assert_eq!(c2.idx(), 2);
    assert!(handle.is_id_from_prev_cloud(first));
    assert!(!handle.is_id_from_prev_cloud(c2.hash()));
    assert!(!handle.is_id_from_prev_cloud(12345));
  }

  #[test]
  fn test_pinned_replicas() {
    let (_reg, n) = nodes(&[7001, 7002, 7003]);
    let cloud = Cloud::new(n.clone(), 1);
    let gone = NodeKey::new(Ipv4Addr::LOCALHOST, 9999);
    let key = Key::system("pinned", &[n[2].key(), gone][..]);
    assert_eq!(cloud.home(&key).unwrap().key(), n[2].key());
    let fallback = cloud.replica_index(&key, 1).unwrap();
    assert_ne!(fallback, 2);
    assert_eq!(cloud.replica_index(&key, 3), cloud.replica_index(&key, 0));
  }

  #[test]
  fn test_pinned_replicas_distinct() {
    let (_reg, n) = nodes(&[7001, 7002, 7003]);
    let cloud = Cloud::new(n.clone(), 1);
    for name in ["a", "b", "c", "d", "e", "f", "g", "h"].iter() {
      let key = Key::system(name, &[n[0].key()][..]);
      let replicas = (0..3)
        .map(|r| cloud.replica_index(&key, r).unwrap())
        .collect_vec();
      assert_eq!(replicas[0], 0);
      assert_eq!(replicas.iter().unique().count(), 3, "{} -> {:?}", name, replicas);
      let both = Key::system(name, &[n[1].key(), n[1].key(), n[0].key()][..]);
      let replicas = (0..3)
        .map(|r| cloud.replica_index(&both, r).unwrap())
        .collect_vec();
      assert_eq!(&replicas[..2], &[1, 0]);
      assert_eq!(replicas[2], 2);
    }
  }
}
