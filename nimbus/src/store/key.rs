use crate::core::NodeKey;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;
use wyhash::WyHash;

const CHUNK: u8 = 1;
const VEC: u8 = 2;
const SYSTEM: u8 = 3;
// User keys start with a printable byte.
const USER_MIN: u8 = 32;

const CHUNK_LEN: usize = 17;
const VEC_LEN: usize = 13;

/// What a [`Key`] names, read from its first byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyKind {
  /// One chunk of a vector: `[tag, vec, cidx, group]`.
  Chunk,
  /// The header of a vector: `[tag, vec, group]`.
  Vector,
  /// An internal key pinned to a list of nodes.
  System,
  /// Anything else.
  User,
}

pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
  let mut hasher = WyHash::with_seed(0);
  hasher.write(bytes);
  hasher.finish()
}

/// An immutable byte-string key. Cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
  bytes: Arc<[u8]>,
}
impl Key {
  fn from_vec(bytes: Vec<u8>) -> Key {
    Key {
      bytes: bytes.into(),
    }
  }

  /// A user key. Names that would be mistaken for an internal key are prefixed with `$`.
  pub fn user(name: &str) -> Key {
    let mut bytes = Vec::with_capacity(name.len() + 1);
    if name.as_bytes().first().map_or(true, |b| *b < USER_MIN) {
      bytes.push(b'$');
    }
    bytes.extend_from_slice(name.as_bytes());
    Key::from_vec(bytes)
  }

  /// An internal key homed on `replicas`, in order, for as long as they are members.
  pub fn system(name: &str, replicas: &[NodeKey]) -> Key {
    let n = replicas.len().min(u8::MAX as usize);
    let mut bytes = Vec::with_capacity(2 + n * 6 + name.len());
    bytes.push(SYSTEM);
    bytes.push(n as u8);
    for r in &replicas[..n] {
      bytes.extend_from_slice(&r.to_bytes()[..]);
    }
    bytes.extend_from_slice(name.as_bytes());
    Key::from_vec(bytes)
  }

  /// The header key of vector `vec` in `group`.
  pub fn vec(group: u64, vec: u32) -> Key {
    let mut bytes = Vec::with_capacity(VEC_LEN);
    bytes.push(VEC);
    bytes.extend_from_slice(&vec.to_be_bytes()[..]);
    bytes.extend_from_slice(&group.to_be_bytes()[..]);
    Key::from_vec(bytes)
  }

  /// The key of chunk `cidx` of vector `vec` in `group`.
  pub fn chunk(group: u64, vec: u32, cidx: u32) -> Key {
    let mut bytes = Vec::with_capacity(CHUNK_LEN);
    bytes.push(CHUNK);
    bytes.extend_from_slice(&vec.to_be_bytes()[..]);
    bytes.extend_from_slice(&cidx.to_be_bytes()[..]);
    bytes.extend_from_slice(&group.to_be_bytes()[..]);
    Key::from_vec(bytes)
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes[..]
  }

  pub fn kind(&self) -> KeyKind {
    match (self.bytes.first(), self.bytes.len()) {
      (Some(&CHUNK), CHUNK_LEN) => KeyKind::Chunk,
      (Some(&VEC), VEC_LEN) => KeyKind::Vector,
      (Some(&SYSTEM), len) if len >= 2 && len >= 2 + self.bytes[1] as usize * 6 => {
        KeyKind::System
      }
      _ => KeyKind::User,
    }
  }

  /// A 31-bit hash of the whole key.
  pub fn hash31(&self) -> u32 {
    (hash_bytes(self.bytes()) & 0x7fff_ffff) as u32
  }

  fn read_u32(&self, at: usize) -> u32 {
    let b = &self.bytes[at..at + 4];
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
  }

  fn group_bytes(&self) -> Option<&[u8]> {
    match self.kind() {
      KeyKind::Chunk => Some(&self.bytes[9..17]),
      KeyKind::Vector => Some(&self.bytes[5..13]),
      _ => None,
    }
  }

  /// The vector group of a chunk or vector key.
  pub fn group(&self) -> Option<u64> {
    self.group_bytes().map(|b| {
      u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    })
  }

  /// The vector number of a chunk or vector key.
  pub fn vec_index(&self) -> Option<u32> {
    match self.kind() {
      KeyKind::Chunk | KeyKind::Vector => Some(self.read_u32(1)),
      _ => None,
    }
  }

  pub fn chunk_index(&self) -> Option<u32> {
    match self.kind() {
      KeyKind::Chunk => Some(self.read_u32(5)),
      _ => None,
    }
  }

  /// The nodes a system key is pinned to.
  pub fn pinned(&self) -> SmallVec<[NodeKey; 4]> {
    match self.kind() {
      KeyKind::System => (0..self.bytes[1] as usize)
        .map(|i| NodeKey::from_bytes(&self.bytes[2 + i * 6..8 + i * 6]))
        .collect(),
      _ => SmallVec::new(),
    }
  }

  /// The index of replica `repl` in a cloud of `size` members, ignoring pinning. The vector
  /// number is left out of the hash, so every vector of a group co-locates chunk by chunk.
  pub(crate) fn hashed_index(&self, size: usize, repl: usize) -> usize {
    let size = size.max(1) as u64;
    let repl = repl as u64;
    match self.group_bytes() {
      Some(group) => {
        let gh = hash_bytes(group) & 0x7fff_ffff;
        let cidx = self.chunk_index().unwrap_or(0) as u64;
        ((cidx + gh + repl) % size) as usize
      }
      None => ((self.hash31() as u64 + repl) % size) as usize,
    }
  }
}
impl fmt::Display for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.kind() {
      KeyKind::Chunk => write!(
        f,
        "chunk({:#x}, {}, {})",
        self.group().unwrap_or(0),
        self.vec_index().unwrap_or(0),
        self.chunk_index().unwrap_or(0)
      ),
      KeyKind::Vector => write!(
        f,
        "vec({:#x}, {})",
        self.group().unwrap_or(0),
        self.vec_index().unwrap_or(0)
      ),
      KeyKind::System => write!(
        f,
        "system({})",
        String::from_utf8_lossy(&self.bytes[2 + self.bytes[1] as usize * 6..])
      ),
      KeyKind::User => write!(f, "{}", String::from_utf8_lossy(self.bytes())),
    }
  }
}
impl fmt::Debug for Key {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Key({})", self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use std::net::Ipv4Addr;

  #[test]
  fn test_kinds() {
    let c = Key::chunk(0xdead_beef, 3, 17);
    assert_eq!(c.kind(), KeyKind::Chunk);
    assert_eq!(c.group(), Some(0xdead_beef));
    assert_eq!(c.vec_index(), Some(3));
    assert_eq!(c.chunk_index(), Some(17));
    let v = Key::vec(0xdead_beef, 3);
    assert_eq!(v.kind(), KeyKind::Vector);
    assert_eq!(v.chunk_index(), None);
    let u = Key::user("counter");
    assert_eq!(u.kind(), KeyKind::User);
    assert_eq!(u.to_string(), "counter");
    assert_eq!(Key::user("\u{1}x").bytes()[0], b'$');
    let pins = [
      NodeKey::new(Ipv4Addr::LOCALHOST, 5001),
      NodeKey::new(Ipv4Addr::LOCALHOST, 5002),
    ];
    let s = Key::system("ids", &pins[..]);
    assert_eq!(s.kind(), KeyKind::System);
    assert_eq!(&s.pinned()[..], &pins[..]);
    assert_eq!(s.to_string(), "system(ids)");
  }

  #[test]
  fn test_replicas_distinct() {
    for size in 1..12 {
      for i in 0..200 {
        let key = Key::user(&format!("key-{}", i));
        let homes = (0..size)
          .map(|r| key.hashed_index(size, r))
          .collect::<HashSet<_>>();
        assert_eq!(homes.len(), size);
        assert!(homes.iter().all(|h| *h < size));
      }
    }
  }

  #[test]
  fn test_group_colocated() {
    let group = 0x1234_5678_9abc;
    for size in 1..8 {
      for cidx in 0..20 {
        let home = Key::chunk(group, 0, cidx).hashed_index(size, 0);
        for vec in 1..4 {
          assert_eq!(Key::chunk(group, vec, cidx).hashed_index(size, 0), home);
        }
      }
      // Consecutive chunks walk every node.
      let homes = (0..size as u32)
        .map(|cidx| Key::chunk(group, 0, cidx).hashed_index(size, 0))
        .collect::<HashSet<_>>();
      assert_eq!(homes.len(), size);
    }
  }
}
