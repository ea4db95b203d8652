//! Background task handles with cooperative cancellation.
//!
//! Both cores run periodic maintenance on a dedicated thread. The loop
//! sleeps for its cadence, wakes, does one pass, and goes back to sleep;
//! cancellation is observed only at the sleep point, never mid-pass.
//! Dropping the handle requests a stop and joins the thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{BurrowError, BurrowResult};

/// Granularity at which a sleeping task polls for cancellation.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Cancellation token shared between a background task and its handle.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
}

impl CancelToken {
    /// Request the task to stop at its next sleep point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for `duration`, polling for cancellation in short slices.
    ///
    /// Returns `false` if the sleep was cut short by a cancel request, in
    /// which case the task should exit without starting another pass.
    pub fn sleep(&self, duration: Duration) -> bool {
        let wake_time = Instant::now() + duration;
        while Instant::now() < wake_time {
            if self.is_cancelled() {
                return false;
            }
            let remaining = wake_time.saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(POLL_SLICE));
        }
        !self.is_cancelled()
    }
}

/// Handle to a running background task.
/// Dropping this handle signals the task to stop and waits for it.
pub struct TaskHandle {
    token: Arc<CancelToken>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn a named background thread running `entry`.
    ///
    /// `entry` receives the shared cancel token and is expected to check it
    /// via [`CancelToken::sleep`] between passes.
    pub fn spawn<F>(name: &str, entry: F) -> BurrowResult<Self>
    where
        F: FnOnce(Arc<CancelToken>) + Send + 'static,
    {
        let token = Arc::new(CancelToken::default());
        let task_token = Arc::clone(&token);

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || entry(task_token))
            .map_err(|e| BurrowError::Thread {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            token,
            thread: Some(thread),
        })
    }

    /// Request graceful shutdown and wait for the task to finish.
    pub fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Check if the task is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
