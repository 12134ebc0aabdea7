use nimbus::cluster::{CloudEvent, Cluster, NodeConfig};
use nimbus::core::Socket;
use std::env::args;
use std::process::exit;

// Usage: nimbus-node <port> [seed-port ...]
fn main() {
  let ports = args()
    .skip(1)
    .map(|a| a.parse::<u16>())
    .collect::<Result<Vec<_>, _>>();
  let ports = match ports {
    Ok(p) if !p.is_empty() => p,
    _ => {
      eprintln!("usage: nimbus-node <port> [seed-port ...]");
      exit(2);
    }
  };
  let mut config = NodeConfig::default();
  config.socket = Socket::localhost(ports[0]);
  config.cloud.seed_nodes = ports[1..].iter().map(|p| Socket::localhost(*p)).collect();
  let cluster = match Cluster::new(config) {
    Ok(c) => c,
    Err(e) => {
      eprintln!("could not start: {}", e);
      exit(1);
    }
  };
  for event in cluster.subscribe().iter() {
    match event {
      CloudEvent::CloudChanged(cloud) => {
        let members = cloud.keys().iter().map(|k| k.port()).collect::<Vec<_>>();
        println!("{} CLOUD {} - {:?}", ports[0], cloud.idx(), members);
      }
      CloudEvent::LostContact(k) => println!("{} LOST - {}", ports[0], k),
      CloudEvent::RegainedContact(k) => println!("{} REGAINED - {}", ports[0], k),
    }
  }
}
