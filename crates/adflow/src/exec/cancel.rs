//! Cooperative cancellation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::execution::ExecShared;
use crate::error::AdError;

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    registered: Mutex<Vec<Weak<ExecShared>>>,
}

/// Cancels every execution it was handed to.
///
/// Cancelling fails all pending waiters with [`AdError::Cancelled`] and
/// keeps queued tasks from starting. Tasks already running finish and their
/// results are discarded. A token stays cancelled; executions started with
/// it afterwards fail immediately.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let registered = std::mem::take(&mut *self.inner.registered.lock());
        for exec in registered.iter().filter_map(Weak::upgrade) {
            exec.abort(AdError::Cancelled);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Register an execution. Returns `false` if the token was already
    /// cancelled, in which case the execution is not registered.
    pub(crate) fn register(&self, exec: &Arc<ExecShared>) -> bool {
        let mut registered = self.inner.registered.lock();
        if self.is_cancelled() {
            return false;
        }
        registered.retain(|w| w.strong_count() > 0);
        registered.push(Arc::downgrade(exec));
        true
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("registered", &self.inner.registered.lock().len())
            .finish()
    }
}
