use maplit::btreemap;
use nimbus::core::{BoxError, TaskError};
use nimbus::mr::{Chunk, Frame, MapReduce, NewChunk};
use nimbus::test_commons::{start_cloud, NodeCensus, SumEmit};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Serialize, Deserialize)]
struct FailOn {
  cidx: u32,
}
impl MapReduce for FailOn {
  const NAME: &'static str = "test.FailOn";
  type Output = u64;

  fn map(&self, chunks: &[Chunk], _: &mut [NewChunk]) -> Result<u64, BoxError> {
    if chunks[0].cidx() == self.cidx {
      Err(format!("bad chunk {}", self.cidx).into())
    } else {
      Ok(1)
    }
  }

  fn reduce(&self, l: u64, r: u64) -> Result<u64, BoxError> {
    Ok(l + r)
  }
}

static SLOW_MAPS: AtomicUsize = AtomicUsize::new(0);

#[derive(Serialize, Deserialize)]
struct Slow;
impl MapReduce for Slow {
  const NAME: &'static str = "test.Slow";
  type Output = ();

  fn map(&self, _: &[Chunk], _: &mut [NewChunk]) -> Result<(), BoxError> {
    SLOW_MAPS.fetch_add(1, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    Ok(())
  }

  fn reduce(&self, _: (), _: ()) -> Result<(), BoxError> {
    Ok(())
  }
}

fn column(rows: usize) -> Vec<f64> {
  (0..rows).map(|x| x as f64).collect()
}

#[test]
fn mr_test_sum_and_emit_single_node() {
  let clusters = start_cloud(&[7301]).unwrap();
  let a = &clusters[0];
  let frame = Frame::create(a, &["x"], &[column(20)], 5).unwrap();
  assert_eq!(frame.num_chunks(), 4);
  let res = a.submit(&frame, SumEmit, 1).unwrap().get().unwrap();
  assert_eq!(res.value, Some(190.0));
  assert_eq!(res.map_calls, 4);
  let out = res.output.unwrap();
  assert_eq!(out.num_rows(), 4);
  assert_eq!(out.group(), frame.group());
  assert_ne!(out.vec(0).index(), frame.vec(0).index());
  assert_eq!(out.column(a, 0).unwrap(), vec![10.0, 35.0, 60.0, 85.0]);

  let again = a.submit(&frame, SumEmit, 1).unwrap().get().unwrap();
  let again = again.output.unwrap();
  assert_ne!(again.vec(0).index(), out.vec(0).index());
}

#[test]
fn mr_test_multi_node() {
  let clusters = start_cloud(&[7311, 7312, 7313]).unwrap();
  for c in clusters.iter() {
    c.register_job::<SumEmit>();
    c.register_job::<NodeCensus>();
  }
  let b = &clusters[1];
  let frame = Frame::create(b, &["x", "y"], &[column(90), vec![0.5; 90]], 10).unwrap();
  let res = b.submit(&frame, SumEmit, 1).unwrap().get().unwrap();
  assert_eq!(res.value, Some((0..90).sum::<usize>() as f64));
  assert_eq!(res.map_calls, 9);
  let out = res.output.unwrap();
  assert_eq!(out.num_rows(), 9);
  let emitted = out.column(&clusters[2], 0).unwrap();
  assert_eq!(emitted.iter().sum::<f64>(), res.value.unwrap());
  assert_eq!(frame.column(&clusters[0], 1).unwrap(), vec![0.5; 90]);

  let census = b.submit(&frame, NodeCensus::default(), 0).unwrap().get().unwrap();
  let census = census.value.unwrap();
  assert_eq!(census.len(), 3);
  assert!(census.values().all(|n| *n == 3));

  let local = b.submit_local(&frame, NodeCensus::default(), 0).unwrap().get().unwrap();
  assert_eq!(local.value.unwrap(), btreemap! { b.self_key().port() => 9 });
}

#[test]
fn mr_test_failure_propagates() {
  let clusters = start_cloud(&[7321, 7322]).unwrap();
  for c in clusters.iter() {
    c.register_job::<FailOn>();
  }
  let a = &clusters[0];
  let frame = Frame::create(a, &["x"], &[column(64)], 8).unwrap();
  let err = a.submit(&frame, FailOn { cidx: 5 }, 0).unwrap().get().unwrap_err();
  match err {
    TaskError::Failed { cause, .. } => assert_eq!(cause, "bad chunk 5"),
    other => panic!("unexpected {:?}", other),
  }
  let ok = a.submit(&frame, FailOn { cidx: 99 }, 0).unwrap().get().unwrap();
  assert_eq!(ok.value, Some(8));
}

#[test]
fn mr_test_cancel() {
  let clusters = start_cloud(&[7331]).unwrap();
  let a = &clusters[0];
  let frame = Frame::create(a, &["x"], &[column(80)], 2).unwrap();
  let handle = a.submit(&frame, Slow, 0).unwrap();
  std::thread::sleep(Duration::from_millis(120));
  handle.cancel();
  assert_eq!(handle.get().unwrap_err(), TaskError::Cancelled);
  std::thread::sleep(Duration::from_millis(200));
  assert!(SLOW_MAPS.load(Ordering::SeqCst) < 40);
}
