use crate::cluster::WeakCluster;
use crate::core::{Packet, PacketHeader, LOG_LEVEL};
use crate::{trace, warn};
use std::convert::TryFrom;
use tokio::io::AsyncReadExt;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

const MAX_DATAGRAM: usize = 65536;
// Accept errors are mostly descriptor exhaustion, which takes a moment to clear.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) async fn udp_receiver(cluster: WeakCluster, udp: UdpSocket) {
  let mut buf = vec![0u8; MAX_DATAGRAM];
  loop {
    let res = udp.recv_from(&mut buf[..]).await;
    let cluster = match cluster.upgrade() {
      Some(c) => c,
      None => return,
    };
    if cluster.is_stopped() {
      return;
    }
    let len = match res {
      Ok((len, _)) => len,
      Err(e) => {
        // ICMP port unreachable surfaces here on some platforms.
        trace!(LOG_LEVEL, cluster, format!("UDP receive failed: {}", e));
        continue;
      }
    };
    cluster.transport().record_recvd(len);
    match Packet::parse(&buf[..len]) {
      Ok((header, payload)) => cluster.handle_packet(header, payload),
      Err(e) => warn!(LOG_LEVEL, cluster, format!("Dropping datagram: {}", e)),
    }
  }
}

pub(crate) async fn tcp_acceptor(cluster: WeakCluster, listener: TcpListener) {
  loop {
    let stream = match listener.accept().await {
      Ok((stream, _)) => stream,
      Err(e) => {
        match cluster.upgrade() {
          Some(c) if !c.is_stopped() => {
            warn!(LOG_LEVEL, c, format!("TCP accept failed: {}", e))
          }
          _ => return,
        }
        tokio::time::sleep(ACCEPT_BACKOFF).await;
        continue;
      }
    };
    tokio::spawn(tcp_reader(cluster.clone(), stream));
  }
}

async fn tcp_reader(cluster: WeakCluster, mut stream: TcpStream) {
  let mut header_buf = [0u8; PacketHeader::SIZE];
  loop {
    if stream.read_exact(&mut header_buf[..]).await.is_err() {
      return;
    }
    let cluster = match cluster.upgrade() {
      Some(c) => c,
      None => return,
    };
    let header = match PacketHeader::try_from(&header_buf[..]) {
      Ok(h) => h,
      Err(e) => {
        warn!(LOG_LEVEL, cluster, format!("Closing stream: {}", e));
        return;
      }
    };
    if header.is_oversized() {
      warn!(
        LOG_LEVEL,
        cluster,
        format!(
          "Closing stream: {:?} from {} claims {} bytes",
          header.opcode, header.sender, header.len
        )
      );
      return;
    }
    let mut payload = vec![0u8; header.len as usize];
    if stream.read_exact(&mut payload[..]).await.is_err() {
      return;
    }
    if cluster.is_stopped() {
      return;
    }
    cluster
      .transport()
      .record_recvd(PacketHeader::SIZE + payload.len());
    cluster.handle_packet(header, &payload[..]);
  }
}
