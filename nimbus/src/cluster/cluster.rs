use crate::cluster::{
  heartbeat_loop, multicast_group, Ballot, Cloud, CloudEvent, CloudHandle, HeartBeat,
  Membership, NodeConfig, Proposal, LOG_LEVEL,
};
use crate::core::{
  deserialize, millis_since_epoch, read_flatfile, tcp_acceptor, udp_receiver, Error, Node,
  NodeKey, NodeRegistry, Opcode, PacketHeader, Transport,
};
use crate::rpc::{ack_scanner, retry_scanner, DelayQueue, RemoteTask, Rpc, RpcCall, TaskRegistry};
use crate::scheduler::{Priority, Scheduler};
use crate::store::{GetKey, Key, PutKey, Store};
use crate::testkit::{FailureConfigMap, LogLevel, Logger, LoggerMsg};
use crate::{info, warn};
use crossbeam::channel::{unbounded, Receiver, Sender};
use hashbrown::HashSet;
use serde::de::DeserializeOwned;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::oneshot;

const IO_THREADS: usize = 2;
const CLOUD_POLL: Duration = Duration::from_millis(50);

pub(crate) struct ClusterInner {
  config: NodeConfig,
  rt: Option<Runtime>,
  self_node: Arc<Node>,
  nodes: NodeRegistry,
  pub(crate) peers: Vec<Arc<Node>>,
  restrict: Option<HashSet<NodeKey>>,
  cloud: CloudHandle,
  pub(crate) membership: Mutex<Membership>,
  store: Store,
  scheduler: Scheduler,
  registry: TaskRegistry,
  transport: Transport,
  retries: Arc<DelayQueue<Arc<Rpc>>>,
  acks: Arc<DelayQueue<Arc<RpcCall>>>,
  subscribers: Mutex<Vec<Sender<CloudEvent>>>,
  pub(crate) logger: UnboundedSender<LoggerMsg>,
  pub(crate) reported_sent: AtomicU64,
  pub(crate) reported_recvd: AtomicU64,
  pub(crate) multicast: Option<SocketAddr>,
  pub(crate) name_hash: u64,
  pub(crate) tcp_port: u16,
  boot_ms: u64,
  stopped: AtomicBool,
}
impl Drop for ClusterInner {
  fn drop(&mut self) {
    self.scheduler.shutdown();
    if let Some(rt) = self.rt.take() {
      rt.shutdown_background();
    }
  }
}

#[derive(Clone)]
pub(crate) struct WeakCluster(Weak<ClusterInner>);
impl WeakCluster {
  pub(crate) fn upgrade(&self) -> Option<Cluster> {
    self.0.upgrade().map(|inner| Cluster { inner: inner })
  }
}

/// A handle on the local process's view of the cloud. Cheap to clone. The process keeps running
/// until [`shutdown`](Cluster::shutdown) is called or the last handle is dropped.
#[derive(Clone)]
pub struct Cluster {
  pub(crate) inner: Arc<ClusterInner>,
}
impl Cluster {
  /// Binds this process's sockets, starts its pools and background tasks, and begins
  /// heartbeating.
  pub fn new(config: NodeConfig) -> Result<Cluster, Error> {
    config.validate()?;
    let rt = tokio::runtime::Builder::new_multi_thread()
      .worker_threads(IO_THREADS)
      .thread_name("nimbus-io")
      .enable_all()
      .build()?;
    let handle = rt.handle().clone();
    let self_key = config.socket.resolve()?;
    let udp = UdpSocket::bind(self_key.addr())?;
    udp.set_nonblocking(true)?;
    let tcp = TcpListener::bind(SocketAddr::new(
      IpAddr::V4(self_key.ip()),
      config.socket.tcp,
    ))?;
    tcp.set_nonblocking(true)?;
    let tcp_port = tcp.local_addr()?.port();
    let (udp_rx, tcp_rx) = {
      let _guard = rt.enter();
      (
        tokio::net::UdpSocket::from_std(udp.try_clone()?)?,
        tokio::net::TcpListener::from_std(tcp)?,
      )
    };

    let nodes = NodeRegistry::new(self_key, config.rpc.tcp_pool);
    let self_node = nodes.intern(self_key);
    let mut peer_keys = Vec::new();
    for socket in config.cloud.seed_nodes.iter() {
      peer_keys.push(socket.resolve()?);
    }
    let restrict = match &config.cloud.flatfile {
      Some(path) => {
        let mut allowed = HashSet::new();
        for socket in read_flatfile(path, self_key.port())? {
          let key = socket.resolve()?;
          allowed.insert(key);
          peer_keys.push(key);
        }
        Some(allowed)
      }
      None => None,
    };
    peer_keys.sort();
    peer_keys.dedup();
    let peers = peer_keys
      .into_iter()
      .filter(|k| *k != self_key)
      .map(|k| nodes.intern(k))
      .collect();

    let (mcast_addr, mcast_rx) = if config.cloud.multicast {
      let group = multicast_group(&config.cloud.name);
      let rx = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()))
        .and_then(|s| {
          s.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
          s.set_nonblocking(true)?;
          Ok(s)
        });
      (Some(SocketAddr::V4(group)), Some(rx))
    } else {
      (None, None)
    };

    let scheduler = Scheduler::new(&format!("nimbus-{}", self_key.port()), &config.scheduler)?;
    let (log_tx, log_rx) = unbounded_channel();
    handle.spawn(Logger::new(format!("[{}]", self_key), config.log_level).run(log_rx));
    let transport = Transport::new(udp, config.rpc.max_udp_payload, handle.clone());

    let cluster = Cluster {
      inner: Arc::new(ClusterInner {
        name_hash: crate::store::hash_bytes(config.cloud.name.as_bytes()),
        config: config,
        rt: Some(rt),
        cloud: CloudHandle::new(Cloud::new(vec![self_node.clone()], 1)),
        self_node: self_node,
        nodes: nodes,
        peers: peers,
        restrict: restrict,
        membership: Mutex::new(Membership::default()),
        store: Store::new(),
        scheduler: scheduler,
        registry: TaskRegistry::new(),
        transport: transport,
        retries: Arc::new(DelayQueue::new()),
        acks: Arc::new(DelayQueue::new()),
        subscribers: Mutex::new(Vec::new()),
        logger: log_tx,
        reported_sent: AtomicU64::new(0),
        reported_recvd: AtomicU64::new(0),
        multicast: mcast_addr,
        tcp_port: tcp_port,
        boot_ms: millis_since_epoch(),
        stopped: AtomicBool::new(false),
      }),
    };
    cluster.register_task::<GetKey>();
    cluster.register_task::<PutKey>();
    crate::mr::register_builtins(&cluster);

    let weak = cluster.downgrade();
    handle.spawn(udp_receiver(weak.clone(), udp_rx));
    handle.spawn(tcp_acceptor(weak.clone(), tcp_rx));
    handle.spawn(retry_scanner(weak.clone(), cluster.inner.retries.clone()));
    handle.spawn(ack_scanner(weak.clone(), cluster.inner.acks.clone()));
    match mcast_rx {
      Some(Ok(socket)) => {
        let _guard = handle.enter();
        match tokio::net::UdpSocket::from_std(socket) {
          Ok(socket) => {
            handle.spawn(udp_receiver(weak.clone(), socket));
          }
          Err(e) => warn!(LOG_LEVEL, cluster, format!("Multicast disabled: {}", e)),
        }
      }
      Some(Err(e)) => warn!(LOG_LEVEL, cluster, format!("Multicast disabled: {}", e)),
      None => {}
    }
    handle.spawn(heartbeat_loop(weak, cluster.config().cloud.heartbeat_interval));
    info!(
      LOG_LEVEL,
      cluster,
      format!(
        "Started {} (tcp {}) in cloud {}",
        self_key,
        tcp_port,
        cluster.config().cloud.name
      )
    );
    Ok(cluster)
  }

  pub(crate) fn downgrade(&self) -> WeakCluster {
    WeakCluster(Arc::downgrade(&self.inner))
  }

  pub fn config(&self) -> &NodeConfig {
    &self.inner.config
  }

  pub fn self_key(&self) -> NodeKey {
    self.inner.self_node.key()
  }

  pub fn self_node(&self) -> &Arc<Node> {
    &self.inner.self_node
  }

  /// When this process started, in milliseconds since the epoch.
  pub fn boot_ms(&self) -> u64 {
    self.inner.boot_ms
  }

  /// The one [`Node`] for `key`.
  pub fn node(&self, key: NodeKey) -> Arc<Node> {
    self.inner.nodes.intern(key)
  }

  pub fn nodes(&self) -> &NodeRegistry {
    &self.inner.nodes
  }

  /// The current membership snapshot.
  pub fn cloud(&self) -> Arc<Cloud> {
    self.inner.cloud.current()
  }

  pub fn cloud_handle(&self) -> &CloudHandle {
    &self.inner.cloud
  }

  pub fn cloud_size(&self) -> usize {
    self.cloud().size()
  }

  /// The node responsible for `key` in the current cloud.
  pub fn home(&self, key: &Key) -> Arc<Node> {
    self
      .cloud()
      .home(key)
      .cloned()
      .unwrap_or_else(|| self.inner.self_node.clone())
  }

  pub fn store(&self) -> &Store {
    &self.inner.store
  }

  pub fn scheduler(&self) -> &Scheduler {
    &self.inner.scheduler
  }

  pub fn registry(&self) -> &TaskRegistry {
    &self.inner.registry
  }

  /// Makes `T` runnable on this process when other processes send it.
  pub fn register_task<T: RemoteTask>(&self) {
    self.inner.registry.register::<T>();
  }

  pub(crate) fn transport(&self) -> &Transport {
    &self.inner.transport
  }

  pub(crate) fn retry_queue(&self) -> &DelayQueue<Arc<Rpc>> {
    &self.inner.retries
  }

  pub(crate) fn ack_queue(&self) -> &DelayQueue<Arc<RpcCall>> {
    &self.inner.acks
  }

  /// Whether `key` may become a member. Only peers in the flatfile may, when there is one.
  pub(crate) fn may_join(&self, key: &NodeKey) -> bool {
    match &self.inner.restrict {
      Some(allowed) => allowed.contains(key),
      None => true,
    }
  }

  /// Receives every [`CloudEvent`] from now on.
  pub fn subscribe(&self) -> Receiver<CloudEvent> {
    let (tx, rx) = unbounded();
    self.inner.subscribers.lock().unwrap().push(tx);
    rx
  }

  pub(crate) fn publish(&self, event: CloudEvent) {
    self
      .inner
      .subscribers
      .lock()
      .unwrap()
      .retain(|tx| tx.send(event.clone()).is_ok());
  }

  /// Blocks until the cloud has `size` members.
  pub fn wait_for_cloud_size(&self, size: usize, timeout: Duration) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    loop {
      let have = self.cloud_size();
      if have == size {
        return Ok(());
      }
      if Instant::now() >= deadline {
        return Err(Error::CloudSize {
          wanted: size,
          have: have,
        });
      }
      std::thread::sleep(CLOUD_POLL);
    }
  }

  pub fn log(&self, level: LogLevel, msg: impl ToString + Send + 'static) {
    let _ = self.inner.logger.send(LoggerMsg::Log(level, Box::new(msg)));
  }

  pub fn set_log_level(&self, level: LogLevel) {
    let _ = self.inner.logger.send(LoggerMsg::SetLevel(level));
  }

  /// Bytes sent, bytes received and lines printed, as tallied by the logger.
  pub fn log_stats(&self) -> Option<(u64, u64, u64)> {
    let (tx, rx) = oneshot::channel();
    self.inner.logger.send(LoggerMsg::Stats(tx)).ok()?;
    rx.blocking_recv().ok()
  }

  /// Replaces the failures injected into this process's outgoing packets.
  pub fn set_failure_map(&self, map: FailureConfigMap) {
    self.transport().set_failure_map(map);
  }

  pub fn failure_map(&self) -> FailureConfigMap {
    self.transport().failure_map()
  }

  pub fn is_stopped(&self) -> bool {
    self.inner.stopped.load(Ordering::Acquire)
  }

  /// Stops heartbeating, receiving and running tasks. Peers will see this process go silent.
  pub fn shutdown(&self) {
    if !self.inner.stopped.swap(true, Ordering::AcqRel) {
      info!(LOG_LEVEL, self, "Shutting down");
      self.inner.scheduler.shutdown();
    }
  }

  pub(crate) fn handle_packet(&self, header: PacketHeader, payload: &[u8]) {
    if self.is_stopped() {
      return;
    }
    let sender = self.node(header.sender);
    sender.touch(millis_since_epoch());
    match header.opcode {
      Opcode::Heartbeat => {
        if let Some(hb) = self.decode::<HeartBeat>(&sender, header.opcode, payload) {
          self.on_heartbeat(&sender, hb);
        }
      }
      Opcode::Exec => self.on_exec(&sender, header.task, payload),
      Opcode::Ack => {
        let cluster = self.clone();
        let payload = payload.to_vec();
        self.scheduler().submit(Priority::ACK, move || {
          cluster.on_ack(&sender, header.task, &payload[..])
        });
      }
      Opcode::AckAck => {
        let cluster = self.clone();
        self.scheduler().submit(Priority::ACK_ACK, move || {
          cluster.on_ackack(&sender, header.task)
        });
      }
      Opcode::Cancel => self.on_cancel(&sender, header.task),
      Opcode::Propose => {
        if let Some(p) = self.decode::<Proposal>(&sender, header.opcode, payload) {
          self.on_propose(&sender, p);
        }
      }
      Opcode::Accept => {
        if let Some(b) = self.decode::<Ballot>(&sender, header.opcode, payload) {
          self.on_accept(&sender, b);
        }
      }
      Opcode::Commit => {
        if let Some(p) = self.decode::<Proposal>(&sender, header.opcode, payload) {
          self.on_commit(&sender, p);
        }
      }
    }
  }

  fn decode<T: DeserializeOwned>(
    &self,
    sender: &Arc<Node>,
    opcode: Opcode,
    payload: &[u8],
  ) -> Option<T> {
    match deserialize(payload) {
      Ok(t) => Some(t),
      Err(e) => {
        warn!(
          LOG_LEVEL,
          self,
          format!("Bad {:?} from {}: {}", opcode, sender.key(), e)
        );
        None
      }
    }
  }
}
impl std::fmt::Debug for Cluster {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Cluster")
      .field("node", &self.self_key())
      .field("cloud", &*self.cloud())
      .finish()
  }
}
