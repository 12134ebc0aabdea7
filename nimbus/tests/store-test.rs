use nimbus::store::{Atomic, Key, Value};
use nimbus::test_commons::start_cloud;
use nimbus::testkit::{FailureConfig, FailureConfigMap};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;

#[derive(Serialize, Deserialize)]
struct Incr {
  seen: u64,
}
impl Atomic for Incr {
  const NAME: &'static str = "test.Incr";

  fn atomic(&mut self, old: Option<&Value>) -> Option<Value> {
    let n = old.map_or(Ok(0), |v| v.get::<u64>()).ok()?;
    self.seen = n;
    Value::from_object(&(n + 1))
      .ok()
      .map(|v| Value::successor(old, v.bytes().to_vec()))
  }
}

#[test]
fn store_test_remote_get_put() {
  let clusters = start_cloud(&[7201, 7202]).unwrap();
  let (a, b) = (&clusters[0], &clusters[1]);
  let keys = (0..20).map(|i| Key::user(&format!("k{}", i))).collect::<Vec<_>>();
  for (i, k) in keys.iter().enumerate() {
    a.put_home(k, Value::from_object(&(i as u32)).unwrap()).unwrap();
  }
  let mut remote = 0;
  for (i, k) in keys.iter().enumerate() {
    if !b.home(k).is_self() {
      remote += 1;
    }
    let v = b.get_remote(k).unwrap().unwrap();
    assert_eq!(v.get::<u32>().unwrap(), i as u32);
  }
  assert!(remote > 0);

  let k = &keys[3];
  b.remove_home(k).unwrap();
  assert!(a.home(k).is_self() || a.store().get(k).is_none());
  let home = clusters.iter().find(|c| c.home(k).is_self()).unwrap();
  assert!(home.store().get(k).is_none());
  assert!(b.get_remote(&Key::user("missing")).unwrap().is_none());
}

#[test]
fn store_test_atomic_under_loss() {
  let clusters = start_cloud(&[7211, 7212, 7213]).unwrap();
  for c in clusters.iter() {
    c.register_atomic::<Incr>();
  }
  let mut lossy = FailureConfigMap::default();
  lossy.cluster_wide = FailureConfig {
    drop_prob: 0.3,
    delay: None,
  };
  for c in clusters.iter() {
    c.set_failure_map(lossy.clone());
  }

  let key = Key::user("counter");
  let clusters = Arc::new(clusters);
  let workers = (0..6)
    .map(|i| {
      let clusters = clusters.clone();
      let key = key.clone();
      thread::spawn(move || {
        let c = &clusters[i % 3];
        for _ in 0..15 {
          let out = c.atomic(&key, Incr { seen: 0 }).unwrap();
          assert!(out.committed);
        }
      })
    })
    .collect::<Vec<_>>();
  for w in workers {
    w.join().unwrap();
  }
  for c in clusters.iter() {
    c.set_failure_map(FailureConfigMap::default());
  }
  let home = clusters.iter().find(|c| c.home(&key).is_self()).unwrap();
  let value = home.store().get(&key).unwrap();
  assert_eq!(value.get::<u64>().unwrap(), 90);
  assert_eq!(value.version(), 89);
}

#[test]
fn store_test_large_values_over_tcp() {
  let clusters = start_cloud(&[7221, 7222]).unwrap();
  let (a, b) = (&clusters[0], &clusters[1]);
  assert!(b.config().rpc.max_udp_payload < 20_000);
  let key = (0..100)
    .map(|i| Key::user(&format!("big{}", i)))
    .find(|k| b.home(k).key() == a.self_key())
    .unwrap();
  let big = (0..20_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
  b.put_home(&key, Value::from_object(&big).unwrap()).unwrap();
  assert!(a.store().get(&key).is_some());
  let back = b.get_remote(&key).unwrap().unwrap();
  assert_eq!(back.get::<Vec<u8>>().unwrap(), big);
  assert!(b.store().get(&key).is_none());
}
