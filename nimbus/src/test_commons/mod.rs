//! Helpers shared by the integration tests and the demo binary.

use crate::cluster::{Cluster, NodeConfig};
use crate::core::{BoxError, Error, Socket};
use crate::mr::{Chunk, MapReduce, NewChunk};
use crate::scheduler::SchedulerConfig;
use crate::testkit::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Timings short enough for tests on loopback.
pub fn test_config(port: u16, seeds: &[u16]) -> NodeConfig {
  let mut config = NodeConfig::default();
  config.socket = Socket::localhost(port);
  config.log_level = LogLevel::Warn;
  config.cloud.seed_nodes = seeds.iter().map(|p| Socket::localhost(*p)).collect();
  config.cloud.heartbeat_interval = Duration::from_millis(100);
  config.cloud.timeout = Duration::from_millis(1000);
  config.cloud.suspect = Duration::from_millis(1500);
  config.cloud.proposal_timeout = Duration::from_millis(500);
  config.rpc.retry = Duration::from_millis(50);
  config.rpc.max_retry = Duration::from_millis(400);
  config.rpc.ack_retry = Duration::from_millis(200);
  config.scheduler = SchedulerConfig {
    low_threads: 2,
    high_threads: 1,
    max_compensation: 64,
  };
  config
}

/// Starts one process per port, each seeded with all the others, and waits until they agree.
pub fn start_cloud(ports: &[u16]) -> Result<Vec<Cluster>, Error> {
  let mut clusters = Vec::new();
  for port in ports {
    let seeds = ports.iter().copied().filter(|p| p != port).collect::<Vec<_>>();
    clusters.push(Cluster::new(test_config(*port, &seeds[..]))?);
  }
  for c in clusters.iter() {
    c.wait_for_cloud_size(ports.len(), Duration::from_secs(30))?;
  }
  if wait_for(Duration::from_secs(30), || converged(&clusters[..])) {
    Ok(clusters)
  } else {
    Err(Error::CloudSize {
      wanted: ports.len(),
      have: clusters[0].cloud_size(),
    })
  }
}

/// Whether every process has installed the same cloud.
pub fn converged(clusters: &[Cluster]) -> bool {
  let hashes = clusters.iter().map(|c| c.cloud().hash()).collect::<Vec<_>>();
  hashes.windows(2).all(|w| w[0] == w[1])
}

/// Polls `f` until it holds or `timeout` passes.
pub fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut f: F) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if f() {
      return true;
    }
    std::thread::sleep(Duration::from_millis(20));
  }
  f()
}

/// Sums the first column and emits each chunk's sum as one row of the first output.
#[derive(Clone, Serialize, Deserialize)]
pub struct SumEmit;
impl MapReduce for SumEmit {
  const NAME: &'static str = "test.SumEmit";
  type Output = f64;

  fn map(&self, chunks: &[Chunk], outputs: &mut [NewChunk]) -> Result<f64, BoxError> {
    let sum = chunks[0].values().iter().sum();
    if let Some(out) = outputs.first_mut() {
      out.add_num(sum);
    }
    Ok(sum)
  }

  fn reduce(&self, left: f64, right: f64) -> Result<f64, BoxError> {
    Ok(left + right)
  }
}

/// Counts the chunks each node maps.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct NodeCensus {
  port: Option<u16>,
}
impl MapReduce for NodeCensus {
  const NAME: &'static str = "test.NodeCensus";
  type Output = BTreeMap<u16, u64>;

  fn setup_local(&mut self, cluster: &Cluster) -> Result<(), BoxError> {
    self.port = Some(cluster.self_key().port());
    Ok(())
  }

  fn map(&self, _: &[Chunk], _: &mut [NewChunk]) -> Result<Self::Output, BoxError> {
    let port = self.port.ok_or("setup_local did not run")?;
    Ok(std::iter::once((port, 1)).collect())
  }

  fn reduce(&self, mut left: Self::Output, right: Self::Output) -> Result<Self::Output, BoxError> {
    for (k, v) in right {
      *left.entry(k).or_insert(0) += v;
    }
    Ok(left)
  }
}
