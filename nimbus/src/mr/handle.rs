use crate::core::TaskError;
use crate::mr::engine::Partial;
use crate::mr::{AppendableVec, Frame};
use crate::scheduler::{CancelToken, ForkHandle};

/// What a finished job produced.
#[derive(Debug)]
pub struct JobResult<O> {
  /// The reduction of every map call. `None` when no chunk was mapped.
  pub value: Option<O>,
  /// The output vectors, in the input frame's group, when any were requested.
  pub output: Option<Frame>,
  /// The number of map calls across the cloud.
  pub map_calls: u64,
}
impl<O> JobResult<O> {
  pub(crate) fn finish(
    partial: Partial<O>,
    frame: &Frame,
    outputs: u32,
    out_vec: u32,
  ) -> Result<JobResult<O>, TaskError> {
    let output = if outputs == 0 {
      None
    } else {
      let mut appendables = partial.appendables;
      if appendables.is_empty() {
        appendables = (0..outputs)
          .map(|i| AppendableVec::new(out_vec + i, frame.num_chunks()))
          .collect();
      }
      let names = (0..outputs).map(|i| format!("out{}", i)).collect();
      let vecs = appendables.iter().map(|av| av.close(frame.group())).collect();
      Some(Frame::new(names, vecs)?)
    };
    Ok(JobResult {
      value: partial.result,
      output: output,
      map_calls: partial.maps,
    })
  }
}

/// A submitted job.
pub struct JobHandle<O> {
  fork: ForkHandle<Result<JobResult<O>, TaskError>>,
  cancel: CancelToken,
}
impl<O: Send + 'static> JobHandle<O> {
  pub(crate) fn new(
    fork: ForkHandle<Result<JobResult<O>, TaskError>>,
    cancel: CancelToken,
  ) -> JobHandle<O> {
    JobHandle {
      fork: fork,
      cancel: cancel,
    }
  }

  /// Blocks until the job finishes. A failure anywhere in the cloud fails the whole job.
  pub fn get(self) -> Result<JobResult<O>, TaskError> {
    self.fork.join()?
  }

  /// Stops the job on every node. [`get`](JobHandle::get) then reports
  /// [`TaskError::Cancelled`] unless the job already finished.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  pub fn is_done(&self) -> bool {
    self.fork.is_done()
  }
}
