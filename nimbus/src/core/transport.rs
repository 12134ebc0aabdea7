use crate::core::{Node, NodeKey, Packet};
use crate::testkit::FailureConfigMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io::{self, Write};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;

/// Sends packets to other processes. Small packets go out as one datagram on the UDP socket the
/// process is identified by. Larger ones are written to a pooled TCP connection on a blocking
/// thread. Every send consults the [`FailureConfigMap`], which may drop or delay it.
pub(crate) struct Transport {
  udp: Arc<UdpSocket>,
  max_udp: usize,
  handle: Handle,
  fail_map: RwLock<FailureConfigMap>,
  rng: Mutex<SmallRng>,
  sent: AtomicU64,
  recvd: AtomicU64,
}
impl Transport {
  pub(crate) fn new(udp: UdpSocket, max_udp: usize, handle: Handle) -> Transport {
    Transport {
      udp: Arc::new(udp),
      max_udp: max_udp,
      handle: handle,
      fail_map: RwLock::new(FailureConfigMap::default()),
      rng: Mutex::new(SmallRng::from_entropy()),
      sent: AtomicU64::new(0),
      recvd: AtomicU64::new(0),
    }
  }

  pub(crate) fn set_failure_map(&self, map: FailureConfigMap) {
    *self.fail_map.write().unwrap() = map;
  }

  pub(crate) fn failure_map(&self) -> FailureConfigMap {
    self.fail_map.read().unwrap().clone()
  }

  pub(crate) fn bytes_sent(&self) -> u64 {
    self.sent.load(Ordering::Relaxed)
  }

  pub(crate) fn bytes_recvd(&self) -> u64 {
    self.recvd.load(Ordering::Relaxed)
  }

  pub(crate) fn record_recvd(&self, n: usize) {
    self.recvd.fetch_add(n as u64, Ordering::Relaxed);
  }

  /// Returns the delay to apply to this send, or `None` if the packet is dropped.
  fn select(&self, to: &NodeKey) -> Option<Duration> {
    let cfg = *self.fail_map.read().unwrap().get(to);
    let mut rng = self.rng.lock().unwrap();
    if cfg.drop_prob > 0.0 && rng.gen::<f64>() < cfg.drop_prob {
      return None;
    }
    Some(match cfg.delay {
      Some((lo, hi)) if hi > lo => rng.gen_range(lo..hi),
      Some((lo, _)) => lo,
      None => Duration::ZERO,
    })
  }

  /// Sends `packet` to `node`. Delivery is best-effort: failures are reported, never retried here.
  pub(crate) fn send(&self, node: &Arc<Node>, packet: &Packet) -> io::Result<()> {
    let delay = match self.select(&node.key()) {
      Some(d) => d,
      None => return Ok(()),
    };
    self.sent.fetch_add(packet.len() as u64, Ordering::Relaxed);
    if packet.len() > self.max_udp {
      let node = node.clone();
      let packet = packet.clone();
      self.handle.spawn_blocking(move || {
        std::thread::sleep(delay);
        send_stream(&node, &packet)
      });
      Ok(())
    } else if delay > Duration::ZERO {
      let udp = self.udp.clone();
      let addr = node.key().addr();
      let packet = packet.clone();
      self.handle.spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = udp.send_to(packet.bytes(), addr);
      });
      Ok(())
    } else {
      self.udp.send_to(packet.bytes(), node.key().addr()).map(|_| ())
    }
  }

  /// Sends a datagram to a raw address, such as a multicast group. Not subject to failure
  /// injection.
  pub(crate) fn send_to_addr(&self, addr: SocketAddr, packet: &Packet) -> io::Result<()> {
    self.sent.fetch_add(packet.len() as u64, Ordering::Relaxed);
    self.udp.send_to(packet.bytes(), addr).map(|_| ())
  }
}

fn send_stream(node: &Arc<Node>, packet: &Packet) -> io::Result<()> {
  let mut conn = node.pool().acquire(node.tcp_addr())?;
  match conn.stream().write_all(packet.bytes()) {
    Ok(()) => Ok(()),
    Err(e) => {
      conn.discard();
      Err(e)
    }
  }
}
