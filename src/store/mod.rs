//! Transactional storage consumed by the job queue.
//!
//! The queue never talks SQL directly. It needs a transaction that can read
//! and write the `JOB`, `NODE_INFO` and per-type work tables, take row locks
//! (`SELECT … FOR UPDATE`), take named advisory locks, and run hooks once the
//! outcome of the transaction is known. [`Transaction`] is that contract;
//! [`MemoryStore`] implements it in-process.
//!
//! # Locking
//!
//! Locks belong to a transaction and are released when it commits or aborts.
//! `due_jobs` skips rows locked by someone else, so concurrent pollers never
//! pick the same job. Updates and deletes lock the row implicitly and wait for
//! other holders.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::scheduler::job::{JobId, JobRecord, NewJob, Priority};
use crate::scheduler::node_info::NodeInfo;
use crate::scheduler::work::{NewWorkRow, WorkId, WorkRecord};

pub use memory::{MemoryStore, MemoryTransaction};

/// Callback run after a transaction commits or aborts.
pub type TxnHook = Box<dyn FnOnce() + Send>;

/// Produces transactions against the shared database.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self, label: &str) -> Result<Box<dyn Transaction>>;
}

/// Selection criteria for `Transaction::due_jobs`.
#[derive(Debug, Clone, Copy)]
pub struct DueJobs {
    pub now: DateTime<Utc>,
    pub min_priority: Priority,
    pub limit: usize,
}

#[async_trait]
pub trait Transaction: Send {
    fn label(&self) -> &str;

    async fn insert_job(&mut self, job: NewJob) -> Result<JobRecord>;
    async fn load_job(&mut self, job_id: JobId) -> Result<Option<JobRecord>>;
    /// Write back every column of an existing row. Fails with `NoSuchRecord`
    /// if the row is gone.
    async fn update_job(&mut self, job: &JobRecord) -> Result<()>;
    async fn delete_job(&mut self, job_id: JobId) -> Result<bool>;
    /// Due, unpaused jobs at or above `min_priority`, unassigned or overdue,
    /// ordered unassigned-first then by descending priority, locked for update.
    async fn due_jobs(&mut self, query: DueJobs) -> Result<Vec<JobRecord>>;
    async fn all_jobs(&mut self) -> Result<Vec<JobRecord>>;

    async fn insert_work(&mut self, work: NewWorkRow) -> Result<WorkRecord>;
    async fn work_for_job(&mut self, work_type: &str, job_id: JobId) -> Result<Vec<WorkRecord>>;
    async fn all_work(&mut self, work_type: &str) -> Result<Vec<WorkRecord>>;
    async fn delete_work(&mut self, work_type: &str, work_id: WorkId) -> Result<bool>;
    /// Lock a work row. `None` means do not wait at all.
    async fn try_lock_work(
        &mut self,
        work_type: &str,
        work_id: WorkId,
        wait: Option<Duration>,
    ) -> Result<bool>;
    /// Take a database-wide advisory lock held until the transaction ends.
    async fn try_named_lock(&mut self, name: &str, wait: Option<Duration>) -> Result<bool>;

    async fn lock_nodes_exclusive(&mut self) -> Result<()>;
    async fn all_nodes(&mut self) -> Result<Vec<NodeInfo>>;
    async fn upsert_node(&mut self, node: &NodeInfo) -> Result<()>;

    fn on_commit(&mut self, hook: TxnHook);
    fn on_abort(&mut self, hook: TxnHook);
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Run `op` in a fresh transaction, committing on success and aborting on error.
pub async fn in_transaction<T, F>(store: &dyn Store, label: &str, op: F) -> Result<T>
where
    F: for<'t> FnOnce(&'t mut dyn Transaction) -> BoxFuture<'t, Result<T>>,
{
    let mut txn = store.begin(label).await?;
    match op(txn.as_mut()).await {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(abort_err) = txn.abort().await {
                tracing::warn!(label, error = %abort_err, "Failed to abort transaction");
            }
            Err(e)
        }
    }
}
