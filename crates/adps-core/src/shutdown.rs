//! Shutdown token shared by the server's worker threads.
//!
//! The quit command, `finalize()` and the process signal handler all stop the
//! server through one `ShutdownToken`. Workers never abandon a request they
//! already took; they check the token only between requests.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Inner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// A one-way stop signal.
///
/// Clones share state: once `trigger()` is called on any clone, every clone
/// observes it and every thread parked in `wait_timeout` wakes up.
///
/// # Example
///
/// ```
/// use adps_core::shutdown::ShutdownToken;
///
/// let token = ShutdownToken::new();
/// let worker_view = token.clone();
///
/// token.trigger();
/// assert!(worker_view.is_triggered());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Park for at most `timeout`; returns `true` if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.inner.lock.lock();
        if self.is_triggered() {
            return true;
        }
        let _ = self.inner.cond.wait_for(&mut guard, timeout);
        self.is_triggered()
    }

    /// Park until shutdown is requested.
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock();
        while !self.is_triggered() {
            self.inner.cond.wait(&mut guard);
        }
    }
}
