use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::config::QueueConfig;
use crate::error::{LockConflict, Result};
use crate::store::Transaction;

pub type JobId = i64;

/// Priority class used to order work in the job queue.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    #[default]
    Low = 0,
    Medium = 1,
    High = 2,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Capacity cost of a job; any one worker can carry at most `WEIGHT_CAPACITY`.
pub type Weight = u8;

pub const WEIGHT_CAPACITY: Weight = 10;
pub const DEFAULT_WEIGHT: Weight = 5;

/// A row of the `JOB` table.
///
/// `assigned` is set when a node claims the job and dispatches it; a non-null
/// value means the job is believed to be executing somewhere. `overdue` is the
/// point after which the poll loop re-checks whether it is really still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub work_type: String,
    pub priority: Priority,
    pub weight: Weight,
    pub not_before: DateTime<Utc>,
    pub assigned: Option<DateTime<Utc>>,
    pub overdue: Option<DateTime<Utc>>,
    pub failed: u32,
    pub pause: bool,
}

/// Column values for a new `JOB` row; the store assigns `job_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub work_type: String,
    pub priority: Priority,
    pub weight: Weight,
    pub not_before: DateTime<Utc>,
    pub pause: bool,
}

/// Wire-level reference to a job: enough to route it without shipping the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: JobId,
    pub weight: Weight,
    pub work_type: String,
}

impl JobRecord {
    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            job_id: self.job_id,
            weight: self.weight,
            work_type: self.work_type.clone(),
        }
    }

    /// True when the job may be picked up by a poller at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
            && !self.pause
            && match (self.assigned, self.overdue) {
                (None, _) => true,
                (Some(_), Some(overdue)) => overdue < now,
                (Some(_), None) => false,
            }
    }

    /// Mark the job as handed to a performer at `when`, overdue `overdue` later.
    pub async fn assign(
        &mut self,
        txn: &mut dyn Transaction,
        when: DateTime<Utc>,
        overdue: Duration,
    ) -> Result<()> {
        self.assigned = Some(when);
        self.overdue = Some(clock::add(when, overdue));
        txn.update_job(self).await
    }

    /// Push the overdue deadline of a still-running job to `bump` past `now`.
    pub async fn bump_overdue(
        &mut self,
        txn: &mut dyn Transaction,
        now: DateTime<Utc>,
        bump: Duration,
    ) -> Result<()> {
        self.overdue = Some(clock::add(now, bump));
        txn.update_job(self).await
    }

    /// The attempt to run failed: unassign, and push `not_before` out.
    ///
    /// Delays scale with `failed + 1`. Contention on the job's own row only
    /// defers it; every other kind of failure increments `failed`.
    pub async fn failed_to_run(
        &mut self,
        txn: &mut dyn Transaction,
        now: DateTime<Utc>,
        failure: Failure,
        config: &QueueConfig,
    ) -> Result<()> {
        let attempts = self.failed.saturating_add(1);
        let (delay, counted) = match failure {
            Failure::Error => (config.failure_reschedule_interval.saturating_mul(attempts), true),
            Failure::Locked(conflict) => (
                config.lock_reschedule_interval.saturating_mul(attempts),
                conflict == LockConflict::Group,
            ),
            Failure::Temporary(delay) => (delay.saturating_mul(attempts), true),
        };
        self.assigned = None;
        self.overdue = None;
        if counted {
            self.failed = attempts;
        }
        self.not_before = clock::add(now, delay);
        txn.update_job(self).await
    }

    pub async fn pause_it(&mut self, txn: &mut dyn Transaction, pause: bool) -> Result<()> {
        self.pause = pause;
        txn.update_job(self).await
    }
}

/// Why a job attempt did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Permanent application failure, or the job could not be dispatched.
    Error,
    /// The job's locks could not be obtained.
    Locked(LockConflict),
    /// The application asked for a retry after the given delay.
    Temporary(Duration),
}
