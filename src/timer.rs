//! Background timer threads and cooperative shutdown.
//!
//! Window operators own one timer each; CDC sources own one capture worker
//! each. Both sleep on a condvar so `stop()` wakes them immediately, and both
//! are joined with an unbounded wait.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A latch that interruptible sleeps poll. `trigger` wakes every sleeper.
#[derive(Clone, Default)]
pub(crate) struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock() = true;
        cvar.notify_all();
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `dur` or until shutdown. Returns `true` when shutdown was
    /// requested.
    pub(crate) fn sleep(&self, dur: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut stopped = lock.lock();
        if *stopped {
            return true;
        }
        cvar.wait_for(&mut stopped, dur);
        *stopped
    }
}

/// Call a function if this struct goes out of scope without calling `defuse`,
/// including during a panic stack-unwinding.
pub(crate) struct CatchPanic<F: FnOnce()> {
    primed: bool,
    handler: Option<F>,
}

impl<F: FnOnce()> CatchPanic<F> {
    pub(crate) fn new(handler: F) -> Self {
        Self {
            primed: true,
            handler: Some(handler),
        }
    }

    pub(crate) fn defuse(&mut self) {
        self.primed = false;
    }
}

impl<F: FnOnce()> Drop for CatchPanic<F> {
    fn drop(&mut self) {
        if self.primed {
            (self.handler.take().unwrap())();
        }
    }
}

/// A named thread ticking at a fixed period until stopped. Missed ticks do
/// not accumulate: the next sleep always starts after the callback returns.
pub(crate) struct PeriodicTimer {
    shutdown: Shutdown,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    pub(crate) fn spawn(
        name: &str,
        period: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> Self {
        let shutdown = Shutdown::new();
        let thread_shutdown = shutdown.clone();
        let thread_name = format!("timer-{name}");
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut catch_panic = CatchPanic::new({
                    let name = thread_name.clone();
                    move || tracing::error!("timer {} crashed!", name)
                });
                while !thread_shutdown.sleep(period) {
                    tick();
                }
                catch_panic.defuse();
                tracing::debug!("timer {} stopped", thread_name);
            })
            .expect("failed to spawn timer thread");
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    pub(crate) fn stop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("timer thread panicked");
            }
        }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
