use thiserror::Error;
use uuid::Uuid;

use crate::queue::job::JobStatus;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("job {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("illegal transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("worker {0} failed to initialize")]
    WorkerInitFailed(u64),

    #[error("worker pool is shutting down")]
    PoolShuttingDown,

    #[error("worker {worker_id} crashed: {message}")]
    WorkerCrashed { worker_id: u64, message: String },

    #[error("worker {0} exited unexpectedly")]
    WorkerExited(u64),

    #[error("executor failed: {0}")]
    Executor(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

// ENOMEM, EMFILE, ENOSPC
const UNRECOVERABLE_ERRNOS: [i32; 3] = [12, 24, 28];

/// IO errors after which the process cannot make progress and must exit.
pub fn is_unrecoverable_io(err: &std::io::Error) -> bool {
    err.raw_os_error()
        .map(|code| UNRECOVERABLE_ERRNOS.contains(&code))
        .unwrap_or(false)
}
