//! Sentinel error types shared across the job scheduling core.
//!
//! Three conditions need to be discriminable by callers rather than just
//! logged: a full pending queue, a cancelled run, and a timed-out run.
//! Everything else is an opaque `anyhow::Error` wrapped with context.

use thiserror::Error;

/// Errors raised by the Job Store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error(transparent)]
    Io(#[from] sqlx::Error),
}

/// Errors raised by the Scheduler when enqueuing a job.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// The bounded pending queue is full. Callers must translate this into
    /// "service unavailable" and must not retry synchronously.
    #[error("job queue is full")]
    QueueFull,
}

/// Outcome of a process run, distinguishing the two cancellation sentinels
/// the worker loop must map to distinct terminal statuses.
#[derive(Debug, Error)]
pub enum RunError {
    /// The run's cancellation token was cancelled externally (user cancel).
    #[error("job cancelled by user")]
    Cancelled,
    /// The run's deadline elapsed.
    #[error("job timed out after {0}m")]
    TimedOut(i64),
    /// The child process could not be spawned.
    #[error("failed to spawn assistant process: {0}")]
    Spawn(#[source] std::io::Error),
    /// Reading the child's stdout stream failed.
    #[error("failed to read assistant output: {0}")]
    Stream(#[source] std::io::Error),
    /// The child exited with a non-zero status.
    #[error("{0}")]
    Exit(String),
}

impl RunError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunError::Cancelled)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, RunError::TimedOut(_))
    }
}
