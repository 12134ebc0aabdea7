use crate::core::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;

/// The DNS name or IP address of the machine hosting a [`Node`](crate::core::Node).
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize)]
pub enum Host {
  DNS(String),
  IP(IpAddr),
}
impl From<String> for Host {
  fn from(s: String) -> Self {
    match IpAddr::from_str(s.as_str()) {
      Ok(ip) => Host::IP(ip),
      Err(_) => Host::DNS(s),
    }
  }
}

/// The configured address of a process in the cloud.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, Ord, PartialOrd)]
pub struct Socket {
  /// The DNS name or IP address of the machine hosting the process.
  pub host: Host,
  /// The UDP port the process receives on. Together with the address, this is the identity of
  /// the process.
  pub udp: u16,
  /// The TCP port the process accepts bulk transfers on.
  pub tcp: u16,
}
impl Socket {
  /// Creates a new [`Socket`]
  pub fn new(host: Host, udp: u16, tcp: u16) -> Socket {
    Socket {
      host: host,
      udp: udp,
      tcp: tcp,
    }
  }

  /// A loopback [`Socket`] using `port` for both UDP and TCP. Handy for tests.
  pub fn localhost(port: u16) -> Socket {
    Socket::new(Host::IP(IpAddr::V4(Ipv4Addr::LOCALHOST)), port, port)
  }

  /// Resolves this [`Socket`] to the identity of the process behind it. If the [`Host`] is a DNS
  /// name, this performs a blocking lookup. Fails if no IPv4 address is found.
  pub fn resolve(&self) -> std::io::Result<NodeKey> {
    let ip = match &self.host {
      Host::IP(IpAddr::V4(ip)) => *ip,
      Host::IP(IpAddr::V6(ip)) => {
        return Err(std::io::Error::new(
          std::io::ErrorKind::InvalidInput,
          format!("only IPv4 addresses are supported, got {}", ip),
        ))
      }
      Host::DNS(s) => (s.as_str(), self.udp)
        .to_socket_addrs()?
        .find_map(|a| match a {
          SocketAddr::V4(v4) => Some(*v4.ip()),
          SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| {
          std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no IPv4 address for {}", s),
          )
        })?,
    };
    Ok(NodeKey::new(ip, self.udp))
  }
}
impl fmt::Display for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.host {
      Host::DNS(s) => write!(f, "DNS({}):{}|{}", s, self.udp, self.tcp),
      Host::IP(ip) => write!(f, "IP({}):{}|{}", ip, self.udp, self.tcp),
    }
  }
}
impl Default for Socket {
  fn default() -> Self {
    Socket::localhost(54321)
  }
}

/// The identity of a process: its IPv4 address and UDP port. Keys order by numeric address, then
/// by port, and this order is the order of members in every [`Cloud`](crate::cluster::Cloud).
#[derive(
  Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize,
)]
pub struct NodeKey {
  ip: Ipv4Addr,
  port: u16,
}
impl NodeKey {
  pub const fn new(ip: Ipv4Addr, port: u16) -> NodeKey {
    NodeKey { ip: ip, port: port }
  }

  pub fn ip(&self) -> Ipv4Addr {
    self.ip
  }

  pub fn port(&self) -> u16 {
    self.port
  }

  /// The UDP address of this process.
  pub fn addr(&self) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
  }

  pub(crate) fn to_bytes(&self) -> [u8; 6] {
    let ip = self.ip.octets();
    let port = self.port.to_be_bytes();
    [ip[0], ip[1], ip[2], ip[3], port[0], port[1]]
  }

  pub(crate) fn from_bytes(buf: &[u8]) -> NodeKey {
    NodeKey {
      ip: Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]),
      port: u16::from_be_bytes([buf[4], buf[5]]),
    }
  }
}
impl fmt::Display for NodeKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.ip, self.port)
  }
}

/// Parses the peers listed in a flatfile. Each line is either `ip[:port]` or `name/ip[:port]`.
/// Blank lines and lines starting with `#` are skipped. A line without a port uses
/// `default_port`. Only IPv4 addresses are accepted.
pub fn parse_flatfile(text: &str, default_port: u16) -> Result<Vec<Socket>, Error> {
  let mut peers = Vec::new();
  for (n, line) in text.lines().enumerate() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    let err = |reason: &str| Error::Flatfile {
      line: n + 1,
      reason: format!("{}: {:?}", reason, line),
    };
    let slash = line.find('/');
    let colon = line.find(':');
    if let (Some(s), Some(c)) = (slash, colon) {
      if c < s {
        return Err(err("a name must come before the address"));
      }
    }
    let addr = match slash {
      Some(s) => &line[s + 1..],
      None => line,
    };
    let (ip, port) = match addr.split_once(':') {
      Some((ip, port)) => {
        let port = port.parse::<u16>().map_err(|_| err("invalid port"))?;
        (ip, port)
      }
      None => (addr, default_port),
    };
    let ip = Ipv4Addr::from_str(ip).map_err(|_| err("only IPv4 addresses are allowed"))?;
    peers.push(Socket::new(Host::IP(IpAddr::V4(ip)), port, port));
  }
  Ok(peers)
}

/// Reads and parses a flatfile from disk. See [`parse_flatfile`].
pub fn read_flatfile<P: AsRef<Path>>(path: P, default_port: u16) -> Result<Vec<Socket>, Error> {
  let text = std::fs::read_to_string(path)?;
  parse_flatfile(&text, default_port)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_node_key_order() {
    let a = NodeKey::new(Ipv4Addr::new(10, 0, 0, 2), 9000);
    let b = NodeKey::new(Ipv4Addr::new(10, 0, 0, 10), 80);
    let c = NodeKey::new(Ipv4Addr::new(10, 0, 0, 10), 81);
    let mut keys = vec![c, a, b];
    keys.sort();
    assert_eq!(keys, vec![a, b, c]);
  }

  #[test]
  fn test_node_key_bytes() {
    let k = NodeKey::new(Ipv4Addr::new(192, 168, 1, 77), 0xa1b2);
    assert_eq!(NodeKey::from_bytes(&k.to_bytes()[..]), k);
  }

  #[test]
  fn test_flatfile() {
    let text = "
      # the lab machines
      10.0.0.1
      10.0.0.2:6000
      alpha/10.0.0.3
      beta/10.0.0.4:6001
    ";
    let peers = parse_flatfile(text, 54321).unwrap();
    let ports = peers.iter().map(|s| s.udp).collect::<Vec<_>>();
    assert_eq!(ports, vec![54321, 6000, 54321, 6001]);
    assert_eq!(
      peers[2].host,
      Host::IP(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)))
    );
  }

  #[test]
  fn test_flatfile_errors() {
    assert!(matches!(
      parse_flatfile("10.0.0.1\n::1\n", 1),
      Err(Error::Flatfile { line: 2, .. })
    ));
    assert!(parse_flatfile("10.0.0.1:http", 1).is_err());
    assert!(parse_flatfile("10.0.0.1:80/name", 1).is_err());
  }

  #[test]
  fn test_resolve_ip() {
    let s = Socket::localhost(5001);
    assert_eq!(s.resolve().unwrap(), NodeKey::new(Ipv4Addr::LOCALHOST, 5001));
  }
}
