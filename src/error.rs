use std::time::Duration;

use thiserror::Error;

use crate::scheduler::job::JobId;

/// Which lock a job could not obtain when it tried to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockConflict {
    /// The work row itself is locked, i.e. this same job is already executing.
    OwnRow,
    /// The group lock is held by another job sharing the group key.
    Group,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job is already running ({0:?} lock held)")]
    JobRunning(LockConflict),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Job failed temporarily, retry in {0:?}")]
    JobTemporary(Duration),

    #[error("No capacity for work")]
    NoCapacity,

    #[error("Node has no worker pool")]
    NoWorkerPool,

    #[error("No such job: {0}")]
    NoSuchRecord(JobId),

    #[error("Unknown work type: {0}")]
    UnknownWorkType(String),

    #[error("Invalid work: {0}")]
    InvalidWork(String),

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Unexpected command: {0}")]
    UnexpectedCommand(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl QueueError {
    /// Build a permanent failure from any application error.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        QueueError::JobFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
