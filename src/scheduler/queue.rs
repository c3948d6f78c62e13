use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::clock::{self, Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::{LockConflict, QueueError, Result};
use crate::metrics::WorkMetrics;
use crate::queuer::Queuer;
use crate::scheduler::job::{Failure, JobId, JobRecord, NewJob, Priority, WEIGHT_CAPACITY};
use crate::scheduler::registry::WorkRegistry;
use crate::scheduler::work::{
    NewWork, NewWorkRow, WorkContext, WorkItem, WorkProposal, WorkRecord,
};
use crate::store::{DueJobs, Store, Transaction};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Jobs considered per `next_job` query.
const NEXT_JOB_LIMIT: usize = 1;

/// Snapshot of one work type's jobs, as reported by [`JobQueue::histogram`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkHistogram {
    pub queued: usize,
    pub assigned: usize,
    /// Unassigned and past `not_before`.
    pub late: usize,
    pub failed: usize,
    pub completed: u64,
    pub time: Duration,
}

/// The job table and the work item lifecycle on top of it.
///
/// Everything that reads or writes `JOB` and the work tables goes through
/// here: creating work, claiming due jobs, and running a claimed job to
/// completion with the right locks and failure handling.
pub struct JobQueue {
    store: Arc<dyn Store>,
    registry: WorkRegistry,
    clock: Arc<dyn Clock>,
    metrics: Arc<WorkMetrics>,
    config: QueueConfig,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>, registry: WorkRegistry) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(WorkMetrics::new()),
            config: QueueConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<WorkMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn registry(&self) -> &WorkRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<WorkMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Write a job row and its work row in `txn`.
    ///
    /// Returns `None` when a singleton type already has a row and `force`
    /// was not given; forcing removes the existing rows first.
    pub async fn make_job(
        &self,
        txn: &mut dyn Transaction,
        work: NewWork,
    ) -> Result<Option<WorkProposal>> {
        let item = self.registry.get(&work.work_type)?;
        let weight = work.weight.unwrap_or_else(|| item.default_weight());
        if weight > WEIGHT_CAPACITY {
            return Err(QueueError::InvalidWork(format!(
                "weight {} exceeds capacity {}",
                weight, WEIGHT_CAPACITY
            )));
        }

        if item.policy().is_singleton() {
            let existing = txn.all_work(&work.work_type).await?;
            if !existing.is_empty() {
                if !work.force {
                    tracing::debug!(work_type = %work.work_type, "Singleton already queued, ignoring");
                    return Ok(None);
                }
                for old in &existing {
                    old.remove(txn).await?;
                }
            }
        }

        let job = txn
            .insert_job(NewJob {
                work_type: work.work_type.clone(),
                priority: work.priority.unwrap_or_else(|| item.default_priority()),
                weight,
                not_before: work.not_before.unwrap_or_else(|| self.now()),
                pause: work.pause,
            })
            .await?;
        let record = txn
            .insert_work(NewWorkRow {
                work_type: work.work_type,
                job_id: job.job_id,
                group: work.group,
                payload: work.payload,
            })
            .await?;

        tracing::debug!(job_id = job.job_id, work_type = %job.work_type, "Job created");
        Ok(Some(WorkProposal {
            job_id: job.job_id,
            work_id: record.work_id,
            work_type: job.work_type,
            weight: job.weight,
            not_before: job.not_before,
        }))
    }

    /// Enqueue `work` to run `delay` from now.
    pub async fn reschedule(
        &self,
        txn: &mut dyn Transaction,
        queuer: &dyn Queuer,
        work: NewWork,
        delay: Duration,
    ) -> Result<Option<WorkProposal>> {
        let when = clock::add(self.now(), delay);
        tracing::debug!(work_type = %work.work_type, when = %when, "Scheduling next run");
        queuer.enqueue_work(txn, work.not_before(when)).await
    }

    /// Claim the best due job at or above `min_priority`, locked for update.
    pub async fn next_job(
        &self,
        txn: &mut dyn Transaction,
        now: DateTime<Utc>,
        min_priority: Priority,
    ) -> Result<Option<JobRecord>> {
        Ok(self
            .next_jobs(txn, now, min_priority, NEXT_JOB_LIMIT)
            .await?
            .into_iter()
            .next())
    }

    pub async fn next_jobs(
        &self,
        txn: &mut dyn Transaction,
        now: DateTime<Utc>,
        min_priority: Priority,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        txn.due_jobs(DueJobs {
            now,
            min_priority,
            limit,
        })
        .await
    }

    /// The work row belonging to `job`, if exactly one exists.
    pub async fn work_item(
        &self,
        txn: &mut dyn Transaction,
        job: &JobRecord,
    ) -> Result<Option<WorkRecord>> {
        let mut rows = txn.work_for_job(&job.work_type, job.job_id).await?;
        Ok(if rows.len() == 1 { rows.pop() } else { None })
    }

    /// True when the job's work row is locked, i.e. someone is executing it.
    pub async fn is_running(&self, txn: &mut dyn Transaction, job: &JobRecord) -> Result<bool> {
        match self.work_item(txn, job).await? {
            Some(work) => Ok(!txn.try_lock_work(&work.work_type, work.work_id, None).await?),
            None => Ok(false),
        }
    }

    /// Run a claimed job to completion in its own transaction.
    ///
    /// Lock contention, application failures and temporary failures are
    /// turned into a rescheduled `JOB` row and reported as `Ok`. Only
    /// unexpected errors (store failures, unknown work types) are returned.
    pub async fn ultimately_perform(&self, job_id: JobId, queuer: &dyn Queuer) -> Result<()> {
        let started = Instant::now();
        tracing::debug!(job_id, "Job starting to run");

        let mut txn = self
            .store
            .begin(&format!("ultimately_perform: {}", job_id))
            .await?;
        let job = match txn.load_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                txn.commit().await?;
                tracing::debug!(job_id, elapsed = ?started.elapsed(), "Job already removed");
                return Ok(());
            }
            Err(e) => {
                abort_quietly(txn).await;
                return Err(e);
            }
        };

        let failure = match self.run_job(txn.as_mut(), &job, queuer).await {
            Ok(()) => {
                txn.commit().await?;
                let late = self.now() - job.not_before;
                tracing::debug!(
                    job_id,
                    work_type = %job.work_type,
                    elapsed = ?started.elapsed(),
                    late_ms = late.num_milliseconds(),
                    "Job completed"
                );
                return Ok(());
            }
            Err(QueueError::JobTemporary(delay)) => Failure::Temporary(delay),
            Err(QueueError::JobRunning(conflict)) => Failure::Locked(conflict),
            Err(QueueError::JobFailed(_)) => Failure::Error,
            Err(e) => {
                tracing::error!(job_id, error = %e, elapsed = ?started.elapsed(), "Job hit unexpected error");
                abort_quietly(txn).await;
                return Err(e);
            }
        };

        tracing::debug!(
            job_id,
            work_type = %job.work_type,
            failure = ?failure,
            attempt = job.failed + 1,
            elapsed = ?started.elapsed(),
            "Job did not complete"
        );
        txn.abort().await?;
        self.failure_clean_up(job_id, failure).await
    }

    /// Mark a job as failed to run, in a fresh transaction.
    pub async fn failure_clean_up(&self, job_id: JobId, failure: Failure) -> Result<()> {
        let mut txn = self
            .store
            .begin(&format!("failure_clean_up: {}", job_id))
            .await?;
        let result = match txn.load_job(job_id).await {
            Ok(Some(mut job)) => {
                job.failed_to_run(txn.as_mut(), self.now(), failure, &self.config)
                    .await
            }
            Ok(None) => {
                tracing::debug!(job_id, "Job disappeared before it could be marked failed");
                Ok(())
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => txn.commit().await,
            Err(e) => {
                abort_quietly(txn).await;
                Err(e)
            }
        }
    }

    /// Lock, run and delete one job inside `txn`.
    async fn run_job(
        &self,
        txn: &mut dyn Transaction,
        job: &JobRecord,
        queuer: &dyn Queuer,
    ) -> Result<()> {
        let item = self.registry.get(&job.work_type)?;
        if let Some(work) = self.work_item(txn, job).await? {
            self.runlock(txn, &work).await?;

            let mut ctx = WorkContext::new(&mut *txn, queuer, job, self.now());
            if let Err(e) = run_work(item.as_ref(), &mut ctx, &work).await {
                tracing::error!(
                    job_id = job.job_id,
                    work_id = work.work_id,
                    error = %e,
                    "Work failed"
                );
                return Err(match e {
                    QueueError::JobTemporary(delay) => QueueError::JobTemporary(delay),
                    QueueError::JobFailed(reason) => QueueError::JobFailed(reason),
                    other => QueueError::failed(other),
                });
            }
        }

        // Last, so the job row stays locked for as short a time as possible.
        txn.delete_job(job.job_id).await?;
        Ok(())
    }

    /// Take the group lock, then the work row lock.
    async fn runlock(&self, txn: &mut dyn Transaction, work: &WorkRecord) -> Result<()> {
        let wait = Some(self.config.lock_timeout);
        if let Some(name) = work.group_lock_name() {
            if !txn.try_named_lock(&name, wait).await? {
                return Err(QueueError::JobRunning(LockConflict::Group));
            }
        }
        if !txn.try_lock_work(&work.work_type, work.work_id, wait).await? {
            return Err(QueueError::JobRunning(LockConflict::OwnRow));
        }
        Ok(())
    }

    /// Per work type counts of what is in `JOB`, plus completion stats.
    pub async fn histogram(
        &self,
        txn: &mut dyn Transaction,
    ) -> Result<BTreeMap<String, WorkHistogram>> {
        let now = self.now();
        let mut results: BTreeMap<String, WorkHistogram> = BTreeMap::new();
        for work_type in self.registry.work_types() {
            let stats = self.metrics.stats(&work_type);
            results.insert(
                work_type,
                WorkHistogram {
                    completed: stats.completed,
                    time: stats.time,
                    ..Default::default()
                },
            );
        }

        for job in txn.all_jobs().await? {
            let entry = results.entry(job.work_type.clone()).or_default();
            entry.queued += 1;
            if job.assigned.is_some() {
                entry.assigned += 1;
            } else if job.not_before < now {
                entry.late += 1;
            }
            if job.failed > 0 {
                entry.failed += 1;
            }
        }
        Ok(results)
    }

    /// Wait for `JOB` to drain. Returns false on timeout.
    pub async fn wait_empty(&self, timeout: Duration) -> Result<bool> {
        self.wait_until(timeout, "wait_empty", |txn| {
            Box::pin(async move { Ok(txn.all_jobs().await?.is_empty()) })
        })
        .await
    }

    /// Wait for one job row to go away. Returns false on timeout.
    pub async fn wait_job_done(&self, job_id: JobId, timeout: Duration) -> Result<bool> {
        self.wait_until(timeout, "wait_job_done", move |txn| {
            Box::pin(async move { Ok(txn.load_job(job_id).await?.is_none()) })
        })
        .await
    }

    /// Wait for every row of the given work types to go away.
    pub async fn wait_work_done(&self, work_types: &[&str], timeout: Duration) -> Result<bool> {
        let types: Vec<String> = work_types.iter().map(|t| t.to_string()).collect();
        self.wait_until(timeout, "wait_work_done", move |txn| {
            let types = types.clone();
            Box::pin(async move {
                for work_type in &types {
                    if !txn.all_work(work_type).await?.is_empty() {
                        return Ok(false);
                    }
                }
                Ok(true)
            })
        })
        .await
    }

    async fn wait_until<F>(&self, timeout: Duration, label: &str, check: F) -> Result<bool>
    where
        F: for<'t> Fn(&'t mut dyn Transaction) -> futures::future::BoxFuture<'t, Result<bool>>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let mut txn = self.store.begin(label).await?;
            let done = check(txn.as_mut()).await;
            txn.commit().await?;
            if done? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

async fn run_work(item: &dyn WorkItem, ctx: &mut WorkContext<'_>, work: &WorkRecord) -> Result<()> {
    let policy = item.policy();
    if policy.before_work(item, ctx, work).await? {
        item.do_work(ctx, work).await?;
        policy.after_work(ctx, work).await?;
    } else {
        tracing::debug!(work_id = work.work_id, "Work already consumed, skipping");
    }
    Ok(())
}

async fn abort_quietly(txn: Box<dyn Transaction>) {
    let label = txn.label().to_string();
    if let Err(e) = txn.abort().await {
        tracing::warn!(label = %label, error = %e, "Failed to abort transaction");
    }
}
