use crate::cluster::Cluster;
use crate::core::{Node, Opcode, Packet, TaskError};
use crate::rpc::registry::{decode_exec, encode_answer};
use crate::rpc::{Recorded, LOG_LEVEL};
use crate::scheduler::{panic_message, CancelToken};
use crate::{debug, trace};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

enum CallState {
  Computing,
  // Holds the answer until the caller confirms it.
  Answered(Packet),
  Released,
}

/// The receiving side of one remote task.
pub struct RpcCall {
  client: Arc<Node>,
  tasknum: u32,
  state: Mutex<CallState>,
  cancel: CancelToken,
}
impl RpcCall {
  pub fn new(client: Arc<Node>, tasknum: u32) -> RpcCall {
    RpcCall {
      client: client,
      tasknum: tasknum,
      state: Mutex::new(CallState::Computing),
      cancel: CancelToken::new(),
    }
  }

  pub fn tasknum(&self) -> u32 {
    self.tasknum
  }

  pub fn client(&self) -> &Arc<Node> {
    &self.client
  }

  pub fn cancel_token(&self) -> &CancelToken {
    &self.cancel
  }

  /// Saves the answer. Only the first answer counts.
  pub(crate) fn answer(&self, ack: Packet) -> bool {
    let mut state = self.state.lock().unwrap();
    match *state {
      CallState::Computing => {
        *state = CallState::Answered(ack);
        true
      }
      _ => false,
    }
  }

  /// The saved answer, if computed and not yet released.
  pub(crate) fn ack(&self) -> Option<Packet> {
    match &*self.state.lock().unwrap() {
      CallState::Answered(ack) => Some(ack.clone()),
      _ => None,
    }
  }

  /// Drops the saved answer. True only for the call that released it.
  pub(crate) fn release(&self) -> bool {
    let mut state = self.state.lock().unwrap();
    match *state {
      CallState::Answered(_) => {
        *state = CallState::Released;
        true
      }
      _ => false,
    }
  }

  pub fn is_released(&self) -> bool {
    matches!(*self.state.lock().unwrap(), CallState::Released)
  }
}

impl Cluster {
  pub(crate) fn on_exec(&self, client: &Arc<Node>, tasknum: u32, payload: &[u8]) {
    let decoded = decode_exec(payload);
    if let Ok((_, incarnation, _, _)) = &decoded {
      if *incarnation != 0 && *incarnation != self.boot_ms() {
        trace!(
          LOG_LEVEL,
          self,
          format!("Dropping task {} from {} meant for an earlier run", tasknum, client.key())
        );
        return;
      }
    }
    let call = Arc::new(RpcCall::new(client.clone(), tasknum));
    match client.tracker().record(call.clone()) {
      Recorded::Retired => {
        trace!(
          LOG_LEVEL,
          self,
          format!("Dropping late task {} from {}", tasknum, client.key())
        );
      }
      Recorded::Duplicate(prev) => {
        // Still computing: the answer will go out when it is ready.
        if let Some(ack) = prev.ack() {
          let _ = self.transport().send(client, &ack);
        }
      }
      Recorded::New => {
        let (priority, _, name, body) = match decoded {
          Ok(x) => x,
          Err(e) => return self.answer(call, Err(e)),
        };
        let name = name.to_string();
        let body = body.to_vec();
        let cluster = self.clone();
        self.scheduler().submit(priority, move || {
          let res = match call.cancel_token().check() {
            Ok(()) => catch_unwind(AssertUnwindSafe(|| {
              cluster
                .registry()
                .run(&cluster, &name, &body[..], call.cancel_token())
            }))
            .unwrap_or_else(|p| Err(TaskError::Panicked(panic_message(&*p)))),
            Err(e) => Err(e),
          };
          if let Err(e) = &res {
            debug!(
              LOG_LEVEL,
              cluster,
              format!("Task {} {} from {} failed: {}", name, tasknum, call.client().key(), e)
            );
          }
          cluster.answer(call, res);
        });
      }
    }
  }

  fn answer(&self, call: Arc<RpcCall>, res: Result<Vec<u8>, TaskError>) {
    let ack = Packet::new(
      Opcode::Ack,
      self.self_key(),
      call.tasknum(),
      &encode_answer(&res)[..],
    );
    if !call.answer(ack.clone()) {
      return;
    }
    let _ = self.transport().send(call.client(), &ack);
    let at = Instant::now() + self.config().rpc.ack_retry;
    self.ack_queue().push(at, call);
  }

  pub(crate) fn on_ackack(&self, client: &Arc<Node>, tasknum: u32) {
    client.tracker().remove_tracking(tasknum);
  }

  /// Stops a task the caller gave up on. A cancel that beats its task in answers for it, so the
  /// caller stops resending and the task number still retires.
  pub(crate) fn on_cancel(&self, client: &Arc<Node>, tasknum: u32) {
    let call = Arc::new(RpcCall::new(client.clone(), tasknum));
    match client.tracker().record(call.clone()) {
      Recorded::Retired => {}
      Recorded::Duplicate(prev) => {
        debug!(
          LOG_LEVEL,
          self,
          format!("Cancelling task {} from {}", tasknum, client.key())
        );
        prev.cancel_token().cancel();
        if let Some(ack) = prev.ack() {
          let _ = self.transport().send(client, &ack);
        }
      }
      Recorded::New => {
        call.cancel_token().cancel();
        self.answer(call, Err(TaskError::Cancelled));
      }
    }
  }

  /// Resends an answer the caller has not confirmed, or forgets it if the caller left.
  pub(crate) fn retransmit_ack(&self, call: Arc<RpcCall>, now: Instant) {
    let ack = match call.ack() {
      Some(ack) => ack,
      None => return,
    };
    let client = call.client().clone();
    if !self.cloud().contains(&client.key()) {
      client.tracker().remove_tracking(call.tasknum());
      return;
    }
    let _ = self.transport().send(&client, &ack);
    self.ack_queue().push(now + self.config().rpc.ack_retry, call);
  }
}
