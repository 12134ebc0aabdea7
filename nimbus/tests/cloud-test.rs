use nimbus::cluster::{CloudEvent, Cluster};
use nimbus::core::NodeKey;
use nimbus::mr::Frame;
use nimbus::test_commons::{converged, start_cloud, wait_for, NodeCensus, SumEmit};
use nimbus::testkit::{FailureConfig, FailureConfigMap};
use crossbeam::channel::Receiver;
use itertools::Itertools;
use std::time::Duration;

fn drain(rx: &Receiver<CloudEvent>) -> Vec<CloudEvent> {
  rx.try_iter().collect()
}

fn count_for(events: &[CloudEvent], key: NodeKey, lost: bool) -> usize {
  events
    .iter()
    .filter(|e| match e {
      CloudEvent::LostContact(k) => lost && *k == key,
      CloudEvent::RegainedContact(k) => !lost && *k == key,
      CloudEvent::CloudChanged(_) => false,
    })
    .count()
}

#[test]
fn cloud_test_formation() {
  let clusters = start_cloud(&[7101, 7102, 7103]).unwrap();
  assert!(converged(&clusters[..]));
  let cloud = clusters[2].cloud();
  assert_eq!(cloud.size(), 3);
  assert_eq!(cloud.leader().unwrap().key().port(), 7101);
  let ports = cloud.keys().iter().map(|k| k.port()).collect_vec();
  assert_eq!(ports, vec![7101, 7102, 7103]);
  for c in clusters.iter() {
    assert!(c.cloud().contains(&c.self_key()));
    let hb = c.heartbeat_of(&clusters[0].self_key());
    if c.self_key() != clusters[0].self_key() {
      assert_eq!(hb.unwrap().boot_ms, clusters[0].boot_ms());
    }
  }
}

#[test]
fn cloud_test_lost_and_regained() {
  let clusters = start_cloud(&[7111, 7112, 7113]).unwrap();
  let (a, b, c) = (&clusters[0], &clusters[1], &clusters[2]);
  for cl in clusters.iter() {
    cl.register_job::<SumEmit>();
    cl.register_job::<NodeCensus>();
  }
  let a_events = a.subscribe();
  let c_events = c.subscribe();
  let b_key = b.self_key();

  b.set_failure_map(FailureConfigMap {
    cluster_wide: FailureConfig::silent(),
    ..FailureConfigMap::default()
  });
  a.wait_for_cloud_size(2, Duration::from_secs(20)).unwrap();
  c.wait_for_cloud_size(2, Duration::from_secs(20)).unwrap();
  assert!(!a.cloud().contains(&b_key));
  // Give the scanner a few more rounds to prove it does not repeat itself.
  std::thread::sleep(Duration::from_millis(500));
  let a_seen = drain(&a_events);
  let c_seen = drain(&c_events);
  assert_eq!(count_for(&a_seen[..], b_key, true), 1);
  assert_eq!(count_for(&c_seen[..], b_key, true), 1);

  let frame = Frame::create(a, &["x"], &[(0..40).map(|x| x as f64).collect()], 5).unwrap();
  let res = a.submit(&frame, SumEmit, 0).unwrap().get().unwrap();
  assert_eq!(res.value, Some(780.0));
  assert_eq!(res.map_calls, 8);

  b.set_failure_map(FailureConfigMap::default());
  for cl in clusters.iter() {
    cl.wait_for_cloud_size(3, Duration::from_secs(20)).unwrap();
  }
  assert!(wait_for(Duration::from_secs(10), || converged(&clusters[..])));
  std::thread::sleep(Duration::from_millis(500));
  let a_seen = drain(&a_events);
  assert_eq!(count_for(&a_seen[..], b_key, false), 1);
  assert_eq!(count_for(&a_seen[..], b_key, true), 0);
  assert!(a_seen.iter().any(|e| matches!(e, CloudEvent::CloudChanged(cl) if cl.size() == 3)));

  let frame = Frame::create(a, &["x"], &[vec![1.0; 24]], 2).unwrap();
  let census = a.submit(&frame, NodeCensus::default(), 0).unwrap().get().unwrap();
  let census = census.value.unwrap();
  assert_eq!(census.values().sum::<u64>(), 12);
  assert!(census.contains_key(&b_key.port()));
  assert_eq!(census.len(), 3);
}

#[test]
fn cloud_test_single_node() {
  let clusters = start_cloud(&[7121]).unwrap();
  let a: &Cluster = &clusters[0];
  assert_eq!(a.cloud_size(), 1);
  assert_eq!(a.cloud().idx(), 1);
  assert!(a.wait_for_cloud_size(2, Duration::from_millis(300)).is_err());
  a.shutdown();
  assert!(a.is_stopped());
}
