use crate::cluster::Cluster;
use crate::core::{deserialize, serialize, Node, Opcode, Packet, TaskError};
use crate::rpc::registry::{decode_answer, encode_exec};
use crate::rpc::{RemoteTask, LOG_LEVEL};
use crate::scheduler::{managed_block, Priority};
use crate::{debug, warn};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

enum RpcState {
  Pending,
  Done(Result<Vec<u8>, TaskError>),
}

/// The calling side of one remote task: tracks the request until its answer arrives.
pub struct Rpc {
  target: Arc<Node>,
  tasknum: u32,
  request: Packet,
  state: Mutex<RpcState>,
  done: Condvar,
  backoff: Mutex<Duration>,
}
impl Rpc {
  fn new(cluster: &Cluster, target: &Arc<Node>, tasknum: u32, request: Packet) -> Rpc {
    Rpc {
      target: target.clone(),
      tasknum: tasknum,
      request: request,
      state: Mutex::new(RpcState::Pending),
      done: Condvar::new(),
      backoff: Mutex::new(cluster.config().rpc.retry),
    }
  }

  /// Sends a task to `target`. Fails right away, through the returned [`Rpc`], if `target` is not
  /// a member of the current cloud. Such a call never takes a task number.
  pub(crate) fn call(
    cluster: &Cluster,
    target: &Arc<Node>,
    name: &str,
    priority: Priority,
    body: &[u8],
  ) -> Arc<Rpc> {
    if !cluster.cloud().contains(&target.key()) {
      let empty = Packet::new(Opcode::Exec, cluster.self_key(), 0, &[]);
      let rpc = Arc::new(Rpc::new(cluster, target, 0, empty));
      rpc.complete(Err(TaskError::Unreachable(target.key())));
      return rpc;
    }
    let (rpc, voided) = target.start_task(|tasknum, incarnation| {
      let envelope = encode_exec(name, priority, incarnation, body);
      let request = Packet::new(Opcode::Exec, cluster.self_key(), tasknum, &envelope[..]);
      Arc::new(Rpc::new(cluster, target, tasknum, request))
    });
    for old in voided {
      old.complete(Err(TaskError::Unreachable(target.key())));
    }
    let _ = cluster.transport().send(target, &rpc.request);
    let at = Instant::now() + cluster.config().rpc.retry;
    cluster.retry_queue().push(at, rpc.clone());
    rpc
  }

  pub fn target(&self) -> &Arc<Node> {
    &self.target
  }

  pub fn tasknum(&self) -> u32 {
    self.tasknum
  }

  pub fn is_done(&self) -> bool {
    matches!(*self.state.lock().unwrap(), RpcState::Done(_))
  }

  /// Installs the outcome. Only the first outcome counts.
  pub(crate) fn complete(&self, res: Result<Vec<u8>, TaskError>) -> bool {
    let mut state = self.state.lock().unwrap();
    match *state {
      RpcState::Pending => {
        *state = RpcState::Done(res);
        self.done.notify_all();
        true
      }
      RpcState::Done(_) => false,
    }
  }

  /// Blocks until the answer arrives.
  pub fn get(&self) -> Result<Vec<u8>, TaskError> {
    managed_block(|| {
      let mut state = self.state.lock().unwrap();
      loop {
        match &*state {
          RpcState::Done(res) => return res.clone(),
          RpcState::Pending => state = self.done.wait(state).unwrap(),
        }
      }
    })
  }

  /// Fails the call with [`TaskError::Cancelled`] and asks the target to stop computing it. The
  /// task stays tabled, and the cancel is repeated, until the target acks it.
  pub fn cancel(&self, cluster: &Cluster) {
    if !self.complete(Err(TaskError::Cancelled)) {
      return;
    }
    let _ = cluster.transport().send(&self.target, &self.cancel_packet(cluster));
  }

  fn cancel_packet(&self, cluster: &Cluster) -> Packet {
    Packet::new(Opcode::Cancel, cluster.self_key(), self.tasknum, &[])
  }

  fn next_backoff(&self, max: Duration) -> Duration {
    let mut backoff = self.backoff.lock().unwrap();
    *backoff = (*backoff * 2).min(max);
    *backoff
  }
}

/// A typed view of an [`Rpc`].
pub struct RpcHandle<T> {
  rpc: Arc<Rpc>,
  x: PhantomData<fn() -> T>,
}
impl<T: DeserializeOwned> RpcHandle<T> {
  pub(crate) fn new(rpc: Arc<Rpc>) -> RpcHandle<T> {
    RpcHandle {
      rpc: rpc,
      x: PhantomData,
    }
  }

  /// Blocks until the answer arrives and decodes it.
  pub fn get(&self) -> Result<T, TaskError> {
    deserialize(&self.rpc.get()?[..])
  }

  pub fn is_done(&self) -> bool {
    self.rpc.is_done()
  }

  pub fn cancel(&self, cluster: &Cluster) {
    self.rpc.cancel(cluster)
  }

  pub fn rpc(&self) -> &Arc<Rpc> {
    &self.rpc
  }
}

impl Cluster {
  /// Ships `task` to `target` and returns a handle to its answer. Any node may be the target,
  /// including this one.
  pub fn call<T: RemoteTask>(
    &self,
    target: &Arc<Node>,
    task: &T,
  ) -> Result<RpcHandle<T::Output>, TaskError> {
    let body = serialize(task)?;
    Ok(RpcHandle::new(self.call_raw(
      target,
      T::NAME,
      task.priority(),
      &body[..],
    )))
  }

  pub(crate) fn call_raw(
    &self,
    target: &Arc<Node>,
    name: &str,
    priority: Priority,
    body: &[u8],
  ) -> Arc<Rpc> {
    Rpc::call(self, target, name, priority, body)
  }

  pub(crate) fn on_ack(&self, target: &Arc<Node>, tasknum: u32, payload: &[u8]) {
    if let Some(rpc) = target.task_remove(tasknum) {
      rpc.complete(decode_answer(payload));
    }
    // Confirm even duplicates, so the target can let go of its answer.
    let ackack = Packet::new(Opcode::AckAck, self.self_key(), tasknum, &[]);
    let _ = self.transport().send(target, &ackack);
  }

  /// Resends a task that the target has not acked. A task whose caller gave up, or whose target
  /// left the cloud, is resent as a cancel, so the target can still retire its number.
  pub(crate) fn retry_rpc(&self, rpc: Arc<Rpc>, now: Instant) {
    let target = rpc.target().clone();
    if !target.task_is(rpc.tasknum(), &rpc) {
      return;
    }
    if !self.cloud().contains(&target.key())
      && rpc.complete(Err(TaskError::Unreachable(target.key())))
    {
      warn!(
        LOG_LEVEL,
        self,
        format!("Task {} failed: {} left the cloud", rpc.tasknum(), target.key())
      );
    }
    if rpc.is_done() {
      let _ = self.transport().send(&target, &rpc.cancel_packet(self));
    } else {
      debug!(
        LOG_LEVEL,
        self,
        format!("Resending task {} to {}", rpc.tasknum(), target.key())
      );
      let _ = self.transport().send(&target, &rpc.request);
    }
    let backoff = rpc.next_backoff(self.config().rpc.max_retry);
    self.retry_queue().push(now + backoff, rpc);
  }
}
