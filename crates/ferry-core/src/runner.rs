//! Bounded task runner: run one unit of work on its own thread under a deadline.
//!
//! Cancellation is cooperative. On expiry the runner sets the work's
//! [`CancellationToken`] and hands control back to the caller. Before
//! returning it gives the worker one short grace period to notice; a worker
//! still alive afterwards is reported as [`RunError::NonCooperative`], because
//! the process now holds a background thread it cannot reclaim.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

/// Default time a cancelled worker gets to wind down before it counts as stuck.
pub const DEFAULT_PROBE_GRACE: Duration = Duration::from_millis(100);

/// Cooperative cancellation signal shared between the runner and its worker.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

/// Returned by [`CancellationToken::checkpoint`] once cancellation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancellation was requested. Call it between units
    /// of work.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Why a bounded run produced no value.
#[derive(Debug, thiserror::Error)]
pub enum RunError<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Failed(E),

    #[error("deadline of {deadline:?} elapsed; worker stopped after cancellation")]
    Timeout { deadline: Duration },

    #[error("deadline of {deadline:?} elapsed; worker ignored cancellation and is still running")]
    NonCooperative { deadline: Duration },

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl<E: std::error::Error + 'static> RunError<E> {
    /// Both deadline outcomes.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RunError::Timeout { .. } | RunError::NonCooperative { .. }
        )
    }

    pub fn is_non_cooperative(&self) -> bool {
        matches!(self, RunError::NonCooperative { .. })
    }
}

/// Runs work on a dedicated thread and waits at most a deadline for it.
#[derive(Debug, Clone, Copy)]
pub struct BoundedRunner {
    deadline: Duration,
    probe_grace: Duration,
}

impl BoundedRunner {
    /// Create a runner applying `deadline` to every call of [`run`](Self::run).
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            probe_grace: DEFAULT_PROBE_GRACE,
        }
    }

    /// Set how long a cancelled worker may take to stop.
    pub fn with_probe_grace(mut self, grace: Duration) -> Self {
        self.probe_grace = grace;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run `work` under the runner's deadline.
    pub fn run<T, E, F>(&self, label: &str, work: F) -> Result<T, RunError<E>>
    where
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, E> + Send + 'static,
    {
        self.run_with_deadline(label, self.deadline, work)
    }

    /// Run `work` under an explicit deadline.
    pub fn run_with_deadline<T, E, F>(
        &self,
        label: &str,
        deadline: Duration,
        work: F,
    ) -> Result<T, RunError<E>>
    where
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, E> + Send + 'static,
    {
        let token = CancellationToken::new();
        let worker_token = token.clone();
        let (tx, rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name(format!("bounded-{label}"))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(worker_token)));
                // The receiver is gone if the runner already gave up.
                let _ = tx.send(outcome);
            })
            .map_err(RunError::Spawn)?;

        match rx.recv_timeout(deadline) {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(RunError::Failed(err)),
            Ok(Err(payload)) => Err(RunError::Panicked(panic_message(payload))),
            Err(RecvTimeoutError::Disconnected) => Err(RunError::Panicked(
                "worker exited without reporting a result".into(),
            )),
            Err(RecvTimeoutError::Timeout) => {
                tracing::debug!(label, ?deadline, "deadline elapsed, cancelling worker");
                token.cancel();

                // Single liveness probe: either the worker reports back within
                // the grace period or it is checked once and classified.
                let stopped = match rx.recv_timeout(self.probe_grace) {
                    Ok(_) | Err(RecvTimeoutError::Disconnected) => true,
                    Err(RecvTimeoutError::Timeout) => handle.is_finished(),
                };

                if stopped {
                    Err(RunError::Timeout { deadline })
                } else {
                    tracing::error!(
                        label,
                        ?deadline,
                        "worker still running despite cancellation; leaving it detached"
                    );
                    Err(RunError::NonCooperative { deadline })
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
