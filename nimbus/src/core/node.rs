use crate::cluster::{Cloud, HeartBeat};
use crate::core::NodeKey;
use crate::rpc::{Rpc, TaskTracker};
use hashbrown::HashMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Wall clock milliseconds, used for heartbeats and contact tracking.
pub(crate) fn millis_since_epoch() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

/// A peer process, as seen from this process. There is exactly one [`Node`] per [`NodeKey`] in a
/// process; get it from the [`NodeRegistry`].
pub struct Node {
  key: NodeKey,
  unique: u32,
  is_self: bool,
  last_heard: AtomicU64,
  lost_contact: AtomicBool,
  heartbeat: RwLock<Arc<HeartBeat>>,
  tcp_port: AtomicU16,
  outgoing: Mutex<Outgoing>,
  // Tasks this node sent to us.
  work: RwLock<Arc<TaskTracker>>,
  pool: ConnectionPool,
}
impl Node {
  fn new(key: NodeKey, unique: u32, is_self: bool, pool_size: usize) -> Node {
    Node {
      key: key,
      unique: unique,
      is_self: is_self,
      last_heard: AtomicU64::new(0),
      lost_contact: AtomicBool::new(false),
      heartbeat: RwLock::new(Arc::new(HeartBeat::default())),
      tcp_port: AtomicU16::new(key.port()),
      outgoing: Mutex::new(Outgoing::default()),
      work: RwLock::new(Arc::new(TaskTracker::new())),
      pool: ConnectionPool::new(pool_size),
    }
  }

  pub fn key(&self) -> NodeKey {
    self.key
  }

  /// A small integer naming this node for the lifetime of the process.
  pub fn unique_idx(&self) -> u32 {
    self.unique
  }

  /// Whether this is the local process.
  pub fn is_self(&self) -> bool {
    self.is_self
  }

  /// The dense index of this node among the members of `cloud`.
  pub fn index(&self, cloud: &Cloud) -> Option<usize> {
    cloud.nidx(&self.key)
  }

  /// Milliseconds since the epoch at which we last received anything from this node. Zero if we
  /// never have.
  pub fn last_heard_from(&self) -> u64 {
    self.last_heard.load(Ordering::Acquire)
  }

  pub(crate) fn touch(&self, now: u64) {
    self.last_heard.fetch_max(now, Ordering::AcqRel);
  }

  pub fn has_lost_contact(&self) -> bool {
    self.lost_contact.load(Ordering::Acquire)
  }

  /// Returns true only for the caller that flips the flag, so loss is announced once.
  pub(crate) fn mark_lost_contact(&self) -> bool {
    !self.lost_contact.swap(true, Ordering::AcqRel)
  }

  pub(crate) fn mark_regained_contact(&self) -> bool {
    self.lost_contact.swap(false, Ordering::AcqRel)
  }

  /// The latest heartbeat received from this node.
  pub fn heartbeat(&self) -> Arc<HeartBeat> {
    self.heartbeat.read().unwrap().clone()
  }

  /// Installs a new heartbeat, returning the previous one.
  pub(crate) fn set_heartbeat(&self, hb: Arc<HeartBeat>) -> Arc<HeartBeat> {
    self.tcp_port.store(hb.tcp_port, Ordering::Release);
    std::mem::replace(&mut *self.heartbeat.write().unwrap(), hb)
  }

  pub fn tcp_addr(&self) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
      self.key.ip(),
      self.tcp_port.load(Ordering::Acquire),
    ))
  }

  /// Numbers a new task for this node and tables the [`Rpc`] built for it, in one step. `make`
  /// gets the task number and the incarnation of this node the task is meant for. Also returns
  /// the tasks voided because this node restarted since the last one.
  pub(crate) fn start_task<F>(&self, make: F) -> (Arc<Rpc>, Vec<Arc<Rpc>>)
  where
    F: FnOnce(u32, u64) -> Arc<Rpc>,
  {
    let boot = self.heartbeat().boot_ms;
    let mut out = self.outgoing.lock().unwrap();
    let voided = out.adopt(boot);
    let tnum = out.next;
    out.next += 1;
    let rpc = make(tnum, out.incarnation);
    out.tasks.insert(tnum, rpc.clone());
    (rpc, voided)
  }

  /// Whether `rpc` is still tabled, waiting for its answer.
  pub(crate) fn task_is(&self, tnum: u32, rpc: &Arc<Rpc>) -> bool {
    match self.outgoing.lock().unwrap().tasks.get(&tnum) {
      Some(r) => Arc::ptr_eq(r, rpc),
      None => false,
    }
  }

  pub(crate) fn task_remove(&self, tnum: u32) -> Option<Arc<Rpc>> {
    self.outgoing.lock().unwrap().tasks.remove(&tnum)
  }

  /// The number of tasks sent to this node that are still tabled.
  pub fn pending_tasks(&self) -> usize {
    self.outgoing.lock().unwrap().tasks.len()
  }

  /// The tracker for tasks this node sent to us.
  pub fn tracker(&self) -> Arc<TaskTracker> {
    self.work.read().unwrap().clone()
  }

  /// The node restarted as incarnation `boot`: whatever it sent before is void, its task ids
  /// start over, and so do ours for it. Returns the tasks we had sent the old incarnation.
  pub(crate) fn rebooted(&self, boot: u64) -> Vec<Arc<Rpc>> {
    *self.work.write().unwrap() = Arc::new(TaskTracker::new());
    self.outgoing.lock().unwrap().adopt(boot)
  }

  pub(crate) fn pool(&self) -> &ConnectionPool {
    &self.pool
  }
}
/// Tasks we sent to a node, numbered per incarnation of that node.
struct Outgoing {
  incarnation: u64,
  next: u32,
  tasks: HashMap<u32, Arc<Rpc>>,
}
impl Default for Outgoing {
  fn default() -> Self {
    Outgoing {
      incarnation: 0,
      next: 1,
      tasks: HashMap::new(),
    }
  }
}
impl Outgoing {
  /// Moves to incarnation `boot`. Leaving a known incarnation restarts numbering and voids the
  /// tabled tasks; learning the first one does not.
  fn adopt(&mut self, boot: u64) -> Vec<Arc<Rpc>> {
    if boot == 0 || boot == self.incarnation {
      return Vec::new();
    }
    let known = self.incarnation != 0;
    self.incarnation = boot;
    if !known {
      return Vec::new();
    }
    self.next = 1;
    self.tasks.drain().map(|(_, rpc)| rpc).collect()
  }
}

impl std::fmt::Debug for Node {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Node")
      .field("key", &self.key)
      .field("unique", &self.unique)
      .finish()
  }
}
impl PartialEq for Node {
  fn eq(&self, other: &Self) -> bool {
    self.key == other.key
  }
}
impl Eq for Node {}

/// Interns every [`Node`] this process has heard of.
pub struct NodeRegistry {
  nodes: Mutex<HashMap<NodeKey, Arc<Node>>>,
  by_index: RwLock<Vec<Arc<Node>>>,
  self_key: NodeKey,
  pool_size: usize,
}
impl NodeRegistry {
  /// `self_key` is the identity of the local process; `pool_size` bounds the TCP connections
  /// kept to each node.
  pub fn new(self_key: NodeKey, pool_size: usize) -> NodeRegistry {
    NodeRegistry {
      nodes: Mutex::new(HashMap::new()),
      by_index: RwLock::new(Vec::new()),
      self_key: self_key,
      pool_size: pool_size,
    }
  }

  /// Returns the [`Node`] for `key`, creating and registering it the first time. Concurrent
  /// callers always get the same instance.
  pub fn intern(&self, key: NodeKey) -> Arc<Node> {
    let mut nodes = self.nodes.lock().unwrap();
    if let Some(node) = nodes.get(&key) {
      return node.clone();
    }
    let mut by_index = self.by_index.write().unwrap();
    let node = Arc::new(Node::new(
      key,
      by_index.len() as u32 + 1,
      key == self.self_key,
      self.pool_size,
    ));
    by_index.push(node.clone());
    nodes.insert(key, node.clone());
    node
  }

  pub fn get(&self, key: &NodeKey) -> Option<Arc<Node>> {
    self.nodes.lock().unwrap().get(key).cloned()
  }

  pub fn by_index(&self, idx: u32) -> Option<Arc<Node>> {
    let by_index = self.by_index.read().unwrap();
    idx
      .checked_sub(1)
      .and_then(|i| by_index.get(i as usize))
      .cloned()
  }

  pub fn all(&self) -> Vec<Arc<Node>> {
    self.by_index.read().unwrap().clone()
  }

  pub fn len(&self) -> usize {
    self.by_index.read().unwrap().len()
  }
}

struct PoolSlots {
  idle: Vec<Option<TcpStream>>,
  avail: usize,
}

/// A bounded set of TCP connections to one node. Borrowers block while every connection is out.
pub(crate) struct ConnectionPool {
  slots: Mutex<PoolSlots>,
  freed: Condvar,
}
impl ConnectionPool {
  fn new(size: usize) -> ConnectionPool {
    let size = size.max(1);
    ConnectionPool {
      slots: Mutex::new(PoolSlots {
        idle: (0..size).map(|_| None).collect(),
        avail: size,
      }),
      freed: Condvar::new(),
    }
  }

  pub(crate) fn acquire(&self, addr: SocketAddr) -> io::Result<PooledConnection<'_>> {
    let open = {
      let mut slots = self.slots.lock().unwrap();
      while slots.avail == 0 {
        slots = self.freed.wait(slots).unwrap();
      }
      slots.avail -= 1;
      let i = slots.avail;
      slots.idle[i].take()
    };
    let stream = match open {
      Some(s) => s,
      None => match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
        Ok(s) => {
          s.set_nodelay(true)?;
          s
        }
        Err(e) => {
          self.release(None);
          return Err(e);
        }
      },
    };
    Ok(PooledConnection {
      pool: self,
      stream: Some(stream),
    })
  }

  fn release(&self, stream: Option<TcpStream>) {
    let mut slots = self.slots.lock().unwrap();
    let i = slots.avail;
    slots.idle[i] = stream;
    slots.avail += 1;
    self.freed.notify_one();
  }

  pub(crate) fn available(&self) -> usize {
    self.slots.lock().unwrap().avail
  }
}

/// A connection borrowed from a [`ConnectionPool`]. Returned to the pool on drop.
pub(crate) struct PooledConnection<'a> {
  pool: &'a ConnectionPool,
  stream: Option<TcpStream>,
}
impl<'a> PooledConnection<'a> {
  pub(crate) fn stream(&mut self) -> &mut TcpStream {
    // Only None after discard, which consumes self.
    self.stream.as_mut().unwrap()
  }

  /// Closes a connection that failed, so the next borrower reconnects.
  pub(crate) fn discard(mut self) {
    self.stream = None;
  }
}
impl<'a> Drop for PooledConnection<'a> {
  fn drop(&mut self) {
    self.pool.release(self.stream.take());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::net::{Ipv4Addr, TcpListener};

  #[test]
  fn test_intern_once() {
    let key = NodeKey::new(Ipv4Addr::LOCALHOST, 5001);
    let reg = Arc::new(NodeRegistry::new(key, 2));
    let handles = (0..8)
      .map(|_| {
        let reg = reg.clone();
        std::thread::spawn(move || reg.intern(key))
      })
      .collect::<Vec<_>>();
    let nodes = handles
      .into_iter()
      .map(|h| h.join().unwrap())
      .collect::<Vec<_>>();
    assert!(nodes.iter().all(|n| Arc::ptr_eq(n, &nodes[0])));
    assert!(nodes[0].is_self());
    assert_eq!(reg.len(), 1);
    assert!(Arc::ptr_eq(&reg.by_index(nodes[0].unique_idx()).unwrap(), &nodes[0]));
    let other = reg.intern(NodeKey::new(Ipv4Addr::LOCALHOST, 5002));
    assert!(!other.is_self());
    assert_ne!(other.unique_idx(), nodes[0].unique_idx());
  }

  #[test]
  fn test_lost_contact_edges() {
    let key = NodeKey::new(Ipv4Addr::LOCALHOST, 5001);
    let reg = NodeRegistry::new(key, 2);
    let node = reg.intern(key);
    assert!(!node.mark_regained_contact());
    assert!(node.mark_lost_contact());
    assert!(!node.mark_lost_contact());
    assert!(node.mark_regained_contact());
    assert!(!node.mark_regained_contact());
  }

  #[test]
  fn test_pool_bounded() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let pool = Arc::new(ConnectionPool::new(2));
    let a = pool.acquire(addr).unwrap();
    let b = pool.acquire(addr).unwrap();
    assert_eq!(pool.available(), 0);
    let (tx, rx) = crossbeam::channel::unbounded();
    let p = pool.clone();
    let t = std::thread::spawn(move || {
      let _c = p.acquire(addr).unwrap();
      tx.send(()).unwrap();
    });
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    drop(a);
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    t.join().unwrap();
    b.discard();
    assert_eq!(pool.available(), 2);
  }
}
