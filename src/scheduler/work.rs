use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock;
use crate::error::{QueueError, Result};
use crate::queuer::Queuer;
use crate::scheduler::job::{JobDescriptor, JobId, JobRecord, Priority, Weight, DEFAULT_WEIGHT};
use crate::store::Transaction;

pub type WorkId = i64;

/// A row of one work type's table, one-to-one with a `JOB` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRecord {
    pub work_id: WorkId,
    pub job_id: JobId,
    pub work_type: String,
    /// Rows sharing a group never run concurrently.
    pub group: Option<String>,
    pub payload: Value,
}

impl WorkRecord {
    /// Parse the application payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| QueueError::InvalidWork(format!("{}: {}", self.work_type, e)))
    }

    /// Delete this row and its job, job last.
    pub async fn remove(&self, txn: &mut dyn Transaction) -> Result<()> {
        txn.delete_work(&self.work_type, self.work_id).await?;
        txn.delete_job(self.job_id).await?;
        Ok(())
    }

    /// Name of the advisory lock serialising this row's group.
    pub fn group_lock_name(&self) -> Option<String> {
        self.group
            .as_ref()
            .map(|group| format!("{}:{}", self.work_type, group))
    }
}

/// Column values for a new work row; the store assigns `work_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkRow {
    pub work_type: String,
    pub job_id: JobId,
    pub group: Option<String>,
    pub payload: Value,
}

/// A request to enqueue work. Unset fields fall back to the work type's defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWork {
    pub work_type: String,
    pub payload: Value,
    pub group: Option<String>,
    pub priority: Option<Priority>,
    pub weight: Option<Weight>,
    pub not_before: Option<DateTime<Utc>>,
    pub pause: bool,
    /// For singletons: replace existing instances instead of being ignored.
    pub force: bool,
}

impl NewWork {
    pub fn new(work_type: impl Into<String>, payload: &impl Serialize) -> Result<Self> {
        Ok(Self::from_value(work_type, serde_json::to_value(payload)?))
    }

    pub fn from_value(work_type: impl Into<String>, payload: Value) -> Self {
        Self {
            work_type: work_type.into(),
            payload,
            group: None,
            priority: None,
            weight: None,
            not_before: None,
            pause: false,
            force: false,
        }
    }

    /// A copy of an existing row's payload and group, for re-enqueueing.
    pub fn from_record(work: &WorkRecord) -> Self {
        Self {
            group: work.group.clone(),
            ..Self::from_value(work.work_type.clone(), work.payload.clone())
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_weight(mut self, weight: Weight) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn not_before(mut self, when: DateTime<Utc>) -> Self {
        self.not_before = Some(when);
        self
    }

    pub fn paused(mut self) -> Self {
        self.pause = true;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Handle returned once work has been written in the caller's transaction.
///
/// It only confirms the rows exist in that transaction; it says nothing about
/// whether or when the work runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkProposal {
    pub job_id: JobId,
    pub work_id: WorkId,
    pub work_type: String,
    pub weight: Weight,
    pub not_before: DateTime<Utc>,
}

impl WorkProposal {
    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            job_id: self.job_id,
            weight: self.weight,
            work_type: self.work_type.clone(),
        }
    }
}

/// How a work type treats its siblings before and after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkPolicy {
    /// Claim the row and run.
    #[default]
    Plain,
    /// At most one row of the type exists at a time.
    Singleton,
    /// Rows matching [`WorkItem::aggregates`] collapse into one execution.
    Aggregator,
    /// A singleton that re-enqueues itself `interval` after each run.
    Regenerating { interval: Duration },
}

impl WorkPolicy {
    pub fn is_singleton(&self) -> bool {
        matches!(self, WorkPolicy::Singleton | WorkPolicy::Regenerating { .. })
    }

    /// Runs under the work row lock before `do_work`. Returns false when the
    /// row was already consumed and the work should be skipped.
    pub async fn before_work(
        &self,
        item: &dyn WorkItem,
        ctx: &mut WorkContext<'_>,
        work: &WorkRecord,
    ) -> Result<bool> {
        match self {
            WorkPolicy::Plain => ctx.txn.delete_work(&work.work_type, work.work_id).await,
            WorkPolicy::Singleton | WorkPolicy::Regenerating { .. } => {
                let all = ctx.txn.all_work(&work.work_type).await?;
                remove_matching(ctx, work, all).await
            }
            WorkPolicy::Aggregator => {
                let all = ctx.txn.all_work(&work.work_type).await?;
                let matching = all
                    .into_iter()
                    .filter(|other| other.work_id == work.work_id || item.aggregates(work, other))
                    .collect();
                remove_matching(ctx, work, matching).await
            }
        }
    }

    /// Runs after `do_work` succeeded, in the same transaction.
    pub async fn after_work(&self, ctx: &mut WorkContext<'_>, work: &WorkRecord) -> Result<()> {
        if let WorkPolicy::Regenerating { interval } = self {
            let when = clock::add(ctx.now(), *interval);
            tracing::debug!(work_type = %work.work_type, when = %when, "Scheduling next regeneration");
            ctx.enqueue(NewWork::from_record(work).not_before(when)).await?;
        }
        Ok(())
    }
}

/// Delete every row in `rows`; sibling jobs go too. Reports whether this
/// row itself was still there.
async fn remove_matching(
    ctx: &mut WorkContext<'_>,
    work: &WorkRecord,
    rows: Vec<WorkRecord>,
) -> Result<bool> {
    let mut found = false;
    for other in rows {
        if other.work_id == work.work_id {
            found = ctx.txn.delete_work(&other.work_type, other.work_id).await?;
        } else {
            other.remove(&mut *ctx.txn).await?;
        }
    }
    Ok(found)
}

/// Application handler for one work type.
#[async_trait]
pub trait WorkItem: Send + Sync + 'static {
    /// Name of the work table; the `workType` column of its jobs.
    fn work_type(&self) -> &str;

    fn policy(&self) -> WorkPolicy {
        WorkPolicy::Plain
    }

    fn default_priority(&self) -> Priority {
        Priority::Low
    }

    fn default_weight(&self) -> Weight {
        DEFAULT_WEIGHT
    }

    /// For aggregators: whether running `this` also covers `other`.
    fn aggregates(&self, this: &WorkRecord, other: &WorkRecord) -> bool {
        this.group.is_some() && this.group == other.group
    }

    /// The actual work. Return `QueueError::JobTemporary` to retry later
    /// without the failure backoff; any other error fails the job.
    async fn do_work(&self, ctx: &mut WorkContext<'_>, work: &WorkRecord) -> Result<()>;
}

/// What a running work item can see: the job's transaction and a queuer for
/// follow-up work.
pub struct WorkContext<'a> {
    pub txn: &'a mut dyn Transaction,
    queuer: &'a dyn Queuer,
    job: &'a JobRecord,
    now: DateTime<Utc>,
}

impl<'a> WorkContext<'a> {
    pub fn new(
        txn: &'a mut dyn Transaction,
        queuer: &'a dyn Queuer,
        job: &'a JobRecord,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            txn,
            queuer,
            job,
            now,
        }
    }

    pub fn job(&self) -> &JobRecord {
        self.job
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Enqueue more work in this job's transaction.
    pub async fn enqueue(&mut self, work: NewWork) -> Result<Option<WorkProposal>> {
        self.queuer.enqueue_work(&mut *self.txn, work).await
    }
}
