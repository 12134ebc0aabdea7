use crate::cluster::Cluster;
use crate::core::{deserialize, serialize, BoxError, NodeKey, TaskError};
use crate::mr::frame::vec_counter;
use crate::mr::{AppendableVec, Chunk, Frame, JobHandle, JobResult, NewChunk, LOG_LEVEL};
use crate::rpc::Rpc;
use crate::scheduler::{CancelToken, Priority};
use crate::store::{Atomic, Key, Value};
use crate::{debug, trace};
use itertools::Itertools;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MAX_NODES: usize = 64;

/// A data-parallel job over the chunks of a [`Frame`](crate::mr::Frame).
///
/// The job value is shipped to every participating node, so anything `map` needs must travel in
/// it. `reduce` must be associative and commutative: partial results are combined in whatever
/// order they complete.
pub trait MapReduce: Serialize + DeserializeOwned + Send + Sync + 'static {
  /// Identifies the job type on the wire. Every node must register it with
  /// [`Cluster::register_job`].
  const NAME: &'static str;
  type Output: Serialize + DeserializeOwned + Send + 'static;

  /// Runs once per chunk. `chunks` holds that chunk of every vector of the frame; `outputs` holds
  /// one [`NewChunk`] per requested output vector. The outputs form one frame, so every output
  /// must get the same number of rows from a call.
  fn map(&self, chunks: &[Chunk], outputs: &mut [NewChunk]) -> Result<Self::Output, BoxError>;

  fn reduce(&self, left: Self::Output, right: Self::Output) -> Result<Self::Output, BoxError>;

  /// Runs on each participating node before its first chunk.
  fn setup_local(&mut self, _cluster: &Cluster) -> Result<(), BoxError> {
    Ok(())
  }

  /// Runs on each participating node after its last chunk.
  fn close_local(&self, _cluster: &Cluster) -> Result<(), BoxError> {
    Ok(())
  }
}

/// What one node of the job tree is responsible for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobDescriptor {
  /// The cloud the job was submitted in.
  pub members: Vec<NodeKey>,
  /// The members, by index, still to visit from here.
  pub nodes: u64,
  pub frame: Frame,
  pub outputs: u32,
  /// The vector number of the first output.
  pub out_vec: u32,
  /// Map every chunk on the submitting node.
  pub run_local: bool,
}
impl JobDescriptor {
  /// The bitmask of members homing at least one chunk of `frame`.
  pub fn homes(frame: &Frame, members: usize) -> u64 {
    (0..frame.num_chunks()).fold(0u64, |mask, cidx| {
      mask | 1 << Key::chunk(frame.group(), 0, cidx).hashed_index(members, 0)
    })
  }

  /// Whether this node maps chunk `cidx`.
  fn maps_here(&self, cidx: u32, self_idx: Option<usize>) -> bool {
    self.run_local
      || Some(Key::chunk(self.frame.group(), 0, cidx).hashed_index(self.members.len(), 0))
        == self_idx
  }

  fn with_nodes(&self, nodes: u64) -> JobDescriptor {
    JobDescriptor {
      nodes: nodes,
      ..self.clone()
    }
  }
}

/// Splits a node mask into its lower and upper halves by bit count. The upper half gets the odd
/// bit.
pub(crate) fn split_mask(nodes: u64) -> (u64, u64) {
  let mut upper = nodes;
  for _ in 0..(nodes.count_ones() >> 1) {
    upper &= upper - 1;
  }
  (nodes & !upper, upper)
}

/// The result of a subtree of the job.
#[derive(Serialize, Deserialize)]
pub(crate) struct Partial<O> {
  pub result: Option<O>,
  pub appendables: Vec<AppendableVec>,
  pub maps: u64,
}
impl<O> Partial<O> {
  pub(crate) fn empty() -> Partial<O> {
    Partial {
      result: None,
      appendables: Vec::new(),
      maps: 0,
    }
  }

  pub(crate) fn merge<F>(self, other: Partial<O>, reduce: F) -> Result<Partial<O>, TaskError>
  where
    F: FnOnce(O, O) -> Result<O, TaskError>,
  {
    let result = match (self.result, other.result) {
      (Some(a), Some(b)) => Some(reduce(a, b)?),
      (a, b) => a.or(b),
    };
    let appendables = if self.appendables.is_empty() {
      other.appendables
    } else {
      let mut mine = self.appendables;
      for (a, b) in mine.iter_mut().zip(other.appendables.iter()) {
        a.merge(b);
      }
      mine
    };
    Ok(Partial {
      result: result,
      appendables: appendables,
      maps: self.maps + other.maps,
    })
  }
}

type PartialResult<M> = Result<Partial<<M as MapReduce>::Output>, TaskError>;

/// Everything the local half of a node's work shares between forks.
struct Local<M> {
  cluster: Cluster,
  desc: JobDescriptor,
  job: M,
  self_idx: Option<usize>,
  cancel: CancelToken,
}
impl<M: MapReduce> Local<M> {
  fn combine(&self, left: PartialResult<M>, right: PartialResult<M>) -> PartialResult<M> {
    let node = self.cluster.self_key();
    match (left, right) {
      (Ok(l), Ok(r)) => l.merge(r, |a, b| {
        self.job.reduce(a, b).map_err(|e| TaskError::from_user(node, e))
      }),
      (Err(a), Err(b)) => Err(a.prefer(b)),
      (Err(e), _) | (_, Err(e)) => Err(e),
    }
  }

  fn fail(&self, res: PartialResult<M>) -> PartialResult<M> {
    if let Err(e) = &res {
      if !e.is_cancelled() {
        debug!(LOG_LEVEL, self.cluster, format!("{} failed: {}", M::NAME, e));
      }
      self.cancel.cancel();
    }
    res
  }
}

/// Maps chunks `lo..hi`, forking the left half and running the right half inline.
fn local_range<M: MapReduce>(ctx: &Arc<Local<M>>, lo: u32, hi: u32) -> PartialResult<M> {
  ctx.cancel.check()?;
  if hi <= lo {
    return Ok(Partial::empty());
  }
  if hi - lo == 1 {
    return ctx.fail(leaf(ctx, lo));
  }
  let mid = (lo + hi) >> 1;
  let left = {
    let ctx = ctx.clone();
    let scheduler = ctx.cluster.scheduler().clone();
    scheduler.fork(Priority::MIN, move || local_range(&ctx, lo, mid))
  };
  let right = local_range(ctx, mid, hi);
  let left = left.join().and_then(|r| r);
  ctx.fail(ctx.combine(left, right))
}

fn leaf<M: MapReduce>(ctx: &Local<M>, cidx: u32) -> PartialResult<M> {
  let desc = &ctx.desc;
  if !desc.maps_here(cidx, ctx.self_idx) {
    return Ok(Partial::empty());
  }
  let cluster = &ctx.cluster;
  let chunks = desc
    .frame
    .vecs()
    .iter()
    .map(|v| v.chunk(cluster, cidx))
    .collect::<Result<Vec<_>, _>>()?;
  let mut outs = (0..desc.outputs).map(|_| NewChunk::new(cidx)).collect_vec();
  let result = ctx
    .job
    .map(&chunks[..], &mut outs[..])
    .map_err(|e| TaskError::from_user(cluster.self_key(), e))?;

  let nchunks = desc.frame.num_chunks();
  let mut appendables = Vec::with_capacity(outs.len());
  for (i, out) in outs.into_iter().enumerate() {
    let vec = desc.out_vec + i as u32;
    let mut av = AppendableVec::new(vec, nchunks);
    av.set_rows(cidx, out.len() as u64);
    if !out.is_empty() {
      let key = Key::chunk(desc.frame.group(), vec, cidx);
      let value = Value::from_object(&out.into_values())?;
      if desc.run_local {
        cluster.put_home(&key, value)?;
      } else {
        cluster.store().put(&key, Arc::new(value));
      }
    }
    appendables.push(av);
  }
  Ok(Partial {
    result: Some(result),
    appendables: appendables,
    maps: 1,
  })
}

fn job_task_name<M: MapReduce>() -> String {
  format!("nimbus.mr/{}", M::NAME)
}

/// Runs this node's share of a job: ships both halves of the other nodes out, maps the local
/// chunks, then folds in the remote answers.
pub(crate) fn run_node<M: MapReduce>(
  cluster: &Cluster,
  desc: JobDescriptor,
  mut job: M,
  cancel: &CancelToken,
) -> PartialResult<M> {
  cancel.check()?;
  let node = cluster.self_key();
  if desc.members.len() > MAX_NODES {
    return Err(TaskError::Failed {
      node: node,
      cause: format!("jobs span at most {} nodes", MAX_NODES),
    });
  }
  let self_idx = desc.members.binary_search(&node).ok();
  let here = self_idx.map_or(0, |i| 1u64 << i);

  let mut remotes: Vec<Arc<Rpc>> = Vec::new();
  let (lower, upper) = split_mask(desc.nodes & !here);
  for half in [lower, upper].iter().filter(|h| **h != 0) {
    let target = cluster.node(desc.members[half.trailing_zeros() as usize]);
    let body = match serialize(&(desc.with_nodes(*half), &job)) {
      Ok(b) => b,
      Err(e) => {
        cancel.cancel();
        return Err(e);
      }
    };
    trace!(
      LOG_LEVEL,
      cluster,
      format!("{} ships nodes {:#x} to {}", M::NAME, half, target.key())
    );
    let rpc = cluster.call_raw(&target, &job_task_name::<M>(), Priority::MIN, &body[..]);
    let weak = cluster.downgrade();
    let r = rpc.clone();
    cancel.on_cancel(move || {
      if let Some(cluster) = weak.upgrade() {
        r.cancel(&cluster);
      }
    });
    remotes.push(rpc);
  }

  let participates = desc.nodes & here != 0 || desc.run_local;
  let setup = if participates {
    job.setup_local(cluster).map_err(|e| TaskError::from_user(node, e))
  } else {
    Ok(())
  };
  let nchunks = desc.frame.num_chunks();
  let ctx = Arc::new(Local {
    cluster: cluster.clone(),
    desc: desc,
    job: job,
    self_idx: self_idx,
    cancel: cancel.clone(),
  });
  let local = match setup {
    Ok(()) if participates => {
      let res = local_range(&ctx, 0, nchunks);
      let closed = ctx
        .job
        .close_local(cluster)
        .map(|_| Partial::empty())
        .map_err(|e| TaskError::from_user(node, e));
      ctx.combine(res, closed)
    }
    Ok(()) => Ok(Partial::empty()),
    Err(e) => Err(e),
  };
  let mut acc = ctx.fail(local);
  for rpc in remotes {
    let remote = rpc
      .get()
      .and_then(|bytes| deserialize::<Partial<M::Output>>(&bytes[..]));
    acc = ctx.fail(ctx.combine(acc, remote));
  }
  acc
}

/// Claims `count` fresh vector numbers in a group.
#[derive(Serialize, Deserialize)]
struct ReserveVecs {
  count: u32,
  floor: u32,
  first: u32,
}
impl Atomic for ReserveVecs {
  const NAME: &'static str = "nimbus.ReserveVecs";

  fn atomic(&mut self, old: Option<&Value>) -> Option<Value> {
    let stored = match old {
      Some(v) => v.get::<u32>().ok()?,
      None => 0,
    };
    self.first = stored.max(self.floor);
    let next = self.first.checked_add(self.count)?;
    Some(Value::successor(old, serialize(&next).ok()?))
  }
}

pub(crate) fn register_builtins(cluster: &Cluster) {
  cluster.register_atomic::<ReserveVecs>();
}

impl Cluster {
  /// Makes jobs of type `M` runnable here on behalf of other nodes.
  pub fn register_job<M: MapReduce>(&self) {
    self.registry().register_raw(
      &job_task_name::<M>(),
      Arc::new(|cluster: &Cluster, body: &[u8], cancel: &CancelToken| {
        let (desc, job): (JobDescriptor, M) = deserialize(body)?;
        serialize(&run_node(cluster, desc, job, cancel)?)
      }),
    );
  }

  /// Runs `job` over every chunk of `frame`, each on the node that homes it, writing `outputs`
  /// new vectors alongside the frame.
  pub fn submit<M: MapReduce>(
    &self,
    frame: &Frame,
    job: M,
    outputs: u32,
  ) -> Result<JobHandle<M::Output>, TaskError> {
    self.start_job(frame, job, outputs, false)
  }

  /// Like [`submit`](Cluster::submit), but maps every chunk on this node, fetching the remote ones.
  pub fn submit_local<M: MapReduce>(
    &self,
    frame: &Frame,
    job: M,
    outputs: u32,
  ) -> Result<JobHandle<M::Output>, TaskError> {
    self.start_job(frame, job, outputs, true)
  }

  fn start_job<M: MapReduce>(
    &self,
    frame: &Frame,
    job: M,
    outputs: u32,
    run_local: bool,
  ) -> Result<JobHandle<M::Output>, TaskError> {
    let cloud = self.cloud();
    if cloud.size() > MAX_NODES {
      return Err(TaskError::Failed {
        node: self.self_key(),
        cause: format!("jobs span at most {} nodes", MAX_NODES),
      });
    }
    if !self.registry().contains(&job_task_name::<M>()) {
      self.register_job::<M>();
    }
    let out_vec = if outputs > 0 {
      self.reserve_vecs(frame, outputs)?
    } else {
      0
    };
    let members = cloud.keys().to_vec();
    let nodes = if run_local {
      cloud.nidx(&self.self_key()).map_or(0, |i| 1u64 << i)
    } else {
      JobDescriptor::homes(frame, members.len())
    };
    debug!(
      LOG_LEVEL,
      self,
      format!(
        "Submitting {} over {} chunks on nodes {:#x}",
        M::NAME,
        frame.num_chunks(),
        nodes
      )
    );
    let desc = JobDescriptor {
      members: members,
      nodes: nodes,
      frame: frame.clone(),
      outputs: outputs,
      out_vec: out_vec,
      run_local: run_local,
    };
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let cluster = self.clone();
    let fork = self.scheduler().fork(Priority::MIN, move || {
      let frame = desc.frame.clone();
      let partial = run_node(&cluster, desc, job, &token)?;
      JobResult::finish(partial, &frame, outputs, out_vec)
    });
    Ok(JobHandle::new(fork, cancel))
  }

  fn reserve_vecs(&self, frame: &Frame, count: u32) -> Result<u32, TaskError> {
    let floor = frame.vecs().iter().map(|v| v.index() + 1).max().unwrap_or(0);
    let tx = ReserveVecs {
      count: count,
      floor: floor,
      first: 0,
    };
    let out = self.atomic(&vec_counter(frame.group()), tx)?;
    if out.committed {
      Ok(out.tx.first)
    } else {
      Err(TaskError::IncompatibleFrame(format!(
        "cannot reserve {} vectors in group {:#018x}",
        count,
        frame.group()
      )))
    }
  }
}
