//! Cooperative cancellation shared between a stream, its stepper and the
//! tasks it spawns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Per-run cancellation state.
///
/// Cloning is cheap; every clone observes the same flag.
#[derive(Clone, Debug, Default)]
pub struct RunControl {
    token: CancellationToken,
    interrupt_running: Arc<AtomicBool>,
    in_flight: Arc<Mutex<Vec<AbortHandle>>>,
}

impl RunControl {
    /// Create a fresh, un-cancelled control
    pub fn new() -> Self {
        Self::default()
    }

    /// A control for a nested run: cancelled whenever `self` is, sharing the
    /// in-flight registry so interrupting the parent also reaches the child.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            interrupt_running: self.interrupt_running.clone(),
            in_flight: self.in_flight.clone(),
        }
    }

    /// Request cancellation.
    ///
    /// With `interrupt_running`, tracked in-flight tasks are aborted; otherwise
    /// they are left to finish and their results are discarded. Returns `false`
    /// if cancellation had already been requested.
    pub fn cancel(&self, interrupt_running: bool) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.interrupt_running.store(interrupt_running, Ordering::SeqCst);
        self.token.cancel();
        if interrupt_running {
            let handles = std::mem::take(&mut *self.lock_in_flight());
            for handle in handles {
                handle.abort();
            }
        }
        true
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the cancel request asked to interrupt running work
    pub fn interrupt_running(&self) -> bool {
        self.interrupt_running.load(Ordering::SeqCst)
    }

    /// Completes once cancellation is requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The underlying token, for actions that want to observe it directly
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Register a spawned task so an interrupting cancel can abort it
    pub(crate) fn track(&self, handle: AbortHandle) {
        if self.is_cancelled() && self.interrupt_running() {
            handle.abort();
            return;
        }
        let mut in_flight = self.lock_in_flight();
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, Vec<AbortHandle>> {
        // The registry holds plain handles; a poisoned lock is still consistent.
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
