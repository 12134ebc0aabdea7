use crate::core::TaskError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Hook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct CancelInner {
  cancelled: AtomicBool,
  hooks: Mutex<Vec<Hook>>,
}

/// A shared cancellation flag. Cooperative code polls it; hooks registered with
/// [`on_cancel`](CancelToken::on_cancel) propagate the cancellation to work running elsewhere.
#[derive(Clone, Default)]
pub struct CancelToken {
  inner: Arc<CancelInner>,
}
impl CancelToken {
  pub fn new() -> CancelToken {
    CancelToken::default()
  }

  /// Sets the flag and runs every hook, once. Later calls do nothing.
  pub fn cancel(&self) {
    if self.inner.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    let hooks = std::mem::take(&mut *self.inner.hooks.lock().unwrap());
    for hook in hooks {
      hook();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::Acquire)
  }

  /// `Err(Cancelled)` once the flag is set.
  pub fn check(&self) -> Result<(), TaskError> {
    if self.is_cancelled() {
      Err(TaskError::Cancelled)
    } else {
      Ok(())
    }
  }

  /// Runs `hook` when the token is cancelled, or right away if it already is.
  pub fn on_cancel<F: FnOnce() + Send + 'static>(&self, hook: F) {
    let mut hooks = self.inner.hooks.lock().unwrap();
    if self.is_cancelled() {
      drop(hooks);
      hook();
    } else {
      hooks.push(Box::new(hook));
    }
  }
}

#[test]
fn test_hooks_run_once() {
  use std::sync::atomic::AtomicUsize;
  let count = Arc::new(AtomicUsize::new(0));
  let token = CancelToken::new();
  let c = count.clone();
  token.on_cancel(move || {
    c.fetch_add(1, Ordering::SeqCst);
  });
  assert!(token.check().is_ok());
  token.cancel();
  token.cancel();
  assert_eq!(count.load(Ordering::SeqCst), 1);
  let c = count.clone();
  token.on_cancel(move || {
    c.fetch_add(1, Ordering::SeqCst);
  });
  assert_eq!(count.load(Ordering::SeqCst), 2);
  assert_eq!(token.check(), Err(TaskError::Cancelled));
}
