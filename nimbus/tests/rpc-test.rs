use nimbus::cluster::Cluster;
use nimbus::core::{NodeKey, TaskError};
use nimbus::rpc::RemoteTask;
use nimbus::scheduler::CancelToken;
use nimbus::test_commons::{converged, start_cloud, test_config, wait_for};
use nimbus::testkit::{FailureConfig, FailureConfigMap};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Serialize, Deserialize)]
struct Echo(u32);
impl RemoteTask for Echo {
  const NAME: &'static str = "test.Echo";
  type Output = (u16, u32);

  fn compute(self, cluster: &Cluster, _: &CancelToken) -> Result<(u16, u32), TaskError> {
    Ok((cluster.self_key().port(), self.0))
  }
}

// Spins until cancelled, or gives up after `millis`.
#[derive(Serialize, Deserialize)]
struct Spin {
  millis: u64,
}
impl RemoteTask for Spin {
  const NAME: &'static str = "test.Spin";
  type Output = ();

  fn compute(self, _: &Cluster, cancel: &CancelToken) -> Result<(), TaskError> {
    for _ in 0..self.millis / 10 {
      cancel.check()?;
      std::thread::sleep(Duration::from_millis(10));
    }
    Ok(())
  }
}

fn drained(server: &Cluster, client: &Cluster, watermark: u32) -> bool {
  let tracker = server.node(client.self_key()).tracker();
  tracker.watermark() == watermark
    && tracker.is_empty()
    && client.node(server.self_key()).pending_tasks() == 0
}

#[test]
fn rpc_test_watermark_has_no_holes() {
  let a = Cluster::new(test_config(7401, &[7402])).unwrap();
  a.register_task::<Echo>();
  let b_key = NodeKey::new(Ipv4Addr::LOCALHOST, 7402);
  let early = a.call(&a.node(b_key), &Echo(0)).unwrap();
  assert_eq!(early.get(), Err(TaskError::Unreachable(b_key)));
  assert_eq!(early.rpc().tasknum(), 0);
  assert_eq!(a.node(b_key).pending_tasks(), 0);

  let b = Cluster::new(test_config(7402, &[7401])).unwrap();
  b.register_task::<Echo>();
  let clusters = vec![a, b];
  for c in clusters.iter() {
    c.wait_for_cloud_size(2, Duration::from_secs(30)).unwrap();
  }
  assert!(wait_for(Duration::from_secs(30), || converged(&clusters[..])));
  let (a, b) = (&clusters[0], &clusters[1]);

  let target = a.node(b.self_key());
  let handles = (0..40)
    .map(|i| a.call(&target, &Echo(i)).unwrap())
    .collect::<Vec<_>>();
  for (i, h) in handles.iter().enumerate() {
    assert_eq!(h.get().unwrap(), (7402, i as u32));
    assert_eq!(h.rpc().tasknum(), i as u32 + 1);
  }
  // Every number from 1 to 40 retires once its answer is confirmed.
  assert!(wait_for(Duration::from_secs(10), || drained(b, a, 41)));
}

#[test]
fn rpc_test_cancel_retires_task() {
  let clusters = start_cloud(&[7411, 7412]).unwrap();
  for c in clusters.iter() {
    c.register_task::<Spin>();
  }
  let (a, b) = (&clusters[0], &clusters[1]);
  let target = a.node(b.self_key());

  // Cancelled while computing.
  let running = a.call(&target, &Spin { millis: 10_000 }).unwrap();
  std::thread::sleep(Duration::from_millis(200));
  running.cancel(a);
  assert_eq!(running.get(), Err(TaskError::Cancelled));
  assert!(wait_for(Duration::from_secs(10), || drained(b, a, 2)));

  // Cancelled before the task ever arrived: the cancel alone retires the number.
  a.set_failure_map(FailureConfigMap {
    cluster_wide: FailureConfig::silent(),
    ..FailureConfigMap::default()
  });
  let lost = a.call(&target, &Spin { millis: 10_000 }).unwrap();
  lost.cancel(a);
  assert_eq!(lost.get(), Err(TaskError::Cancelled));
  assert_eq!(target.pending_tasks(), 1);
  a.set_failure_map(FailureConfigMap::default());
  assert!(wait_for(Duration::from_secs(10), || drained(b, a, 3)));

  let after = a.call(&target, &Spin { millis: 0 }).unwrap();
  after.get().unwrap();
  assert!(wait_for(Duration::from_secs(10), || drained(b, a, 4)));
}
