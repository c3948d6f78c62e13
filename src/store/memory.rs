use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{QueueError, Result};
use crate::scheduler::job::{JobId, JobRecord, NewJob};
use crate::scheduler::node_info::NodeInfo;
use crate::scheduler::work::{NewWorkRow, WorkId, WorkRecord};
use crate::store::{DueJobs, Store, Transaction, TxnHook};

const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

type TxnId = u64;
type NodeKey = (String, u16);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockKey {
    Job(JobId),
    Work(String, WorkId),
    Node(NodeKey),
    Named(String),
    NodeTable,
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKey::Job(id) => write!(f, "JOB {}", id),
            LockKey::Work(table, id) => write!(f, "{} {}", table, id),
            LockKey::Node((host, port)) => write!(f, "NODE_INFO {}:{}", host, port),
            LockKey::Named(name) => write!(f, "named lock {}", name),
            LockKey::NodeTable => write!(f, "table NODE_INFO"),
        }
    }
}

/// A stored row. `inserted_by` hides it from everyone but its creator until
/// commit; `deleted_by` hides it from its deleter only, so everyone else keeps
/// seeing the row until the delete commits.
#[derive(Debug, Clone)]
struct Row<T> {
    value: T,
    inserted_by: Option<TxnId>,
    deleted_by: Option<TxnId>,
}

impl<T> Row<T> {
    fn new(value: T, inserted_by: Option<TxnId>) -> Self {
        Self {
            value,
            inserted_by,
            deleted_by: None,
        }
    }

    fn visible_to(&self, txn: TxnId) -> bool {
        self.inserted_by.map_or(true, |owner| owner == txn) && self.deleted_by != Some(txn)
    }

    fn committed(&self) -> bool {
        self.inserted_by.is_none()
    }
}

/// Previous value of a row touched by a transaction, restored on rollback.
#[derive(Debug)]
enum Undo {
    Job(JobId, Option<JobRecord>),
    Work(String, WorkId, Option<WorkRecord>),
    Node(NodeKey, Option<NodeInfo>),
    DeleteJob(JobId),
    DeleteWork(String, WorkId),
}

#[derive(Debug, Default)]
struct State {
    job_seq: JobId,
    work_seq: WorkId,
    jobs: BTreeMap<JobId, Row<JobRecord>>,
    work: BTreeMap<String, BTreeMap<WorkId, Row<WorkRecord>>>,
    nodes: BTreeMap<NodeKey, Row<NodeInfo>>,
    locks: HashMap<LockKey, TxnId>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    released: Notify,
    next_txn: AtomicU64,
    lock_wait: Duration,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take `key` for `owner`, waiting up to `wait` for its holder to finish.
    async fn acquire(&self, owner: TxnId, key: &LockKey, wait: Option<Duration>) -> bool {
        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                match state.locks.get(key) {
                    Some(holder) if *holder != owner => {}
                    _ => {
                        state.locks.insert(key.clone(), owner);
                        return true;
                    }
                }
            }

            let Some(deadline) = deadline else {
                return false;
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Implicit write lock: wait the store's lock wait, then fail.
    async fn write_lock(&self, owner: TxnId, key: LockKey) -> Result<()> {
        if self.acquire(owner, &key, Some(self.lock_wait)).await {
            Ok(())
        } else {
            Err(QueueError::LockTimeout(key.to_string()))
        }
    }
}

/// An in-process database with the row-locking behaviour the queue relies on.
///
/// Writes are applied in place and undone on abort. Rows inserted by an open
/// transaction stay invisible to every other transaction until it commits.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_wait(DEFAULT_LOCK_WAIT)
    }

    /// How long implicit row locks (updates, deletes) wait for other holders.
    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                released: Notify::new(),
                next_txn: AtomicU64::new(1),
                lock_wait,
            }),
        }
    }

    pub fn transaction(&self, label: &str) -> MemoryTransaction {
        MemoryTransaction {
            id: self.shared.next_txn.fetch_add(1, Ordering::Relaxed),
            label: label.to_string(),
            shared: self.shared.clone(),
            undo: Vec::new(),
            commit_hooks: Vec::new(),
            abort_hooks: Vec::new(),
            finished: false,
        }
    }

    /// Number of committed `JOB` rows.
    pub fn job_count(&self) -> usize {
        self.shared
            .state()
            .jobs
            .values()
            .filter(|row| row.committed())
            .count()
    }

    /// Number of committed rows in one work table.
    pub fn work_count(&self, work_type: &str) -> usize {
        self.shared.state().work.get(work_type).map_or(0, |table| {
            table.values().filter(|row| row.committed()).count()
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, label: &str) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(self.transaction(label)))
    }
}

pub struct MemoryTransaction {
    id: TxnId,
    label: String,
    shared: Arc<Shared>,
    undo: Vec<Undo>,
    commit_hooks: Vec<TxnHook>,
    abort_hooks: Vec<TxnHook>,
    finished: bool,
}

impl MemoryTransaction {
    fn finish(&mut self, commit: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        let undo = std::mem::take(&mut self.undo);
        {
            let mut state = self.shared.state();
            if commit {
                for entry in &undo {
                    Self::publish(&mut state, entry, self.id);
                }
            } else {
                for entry in undo.into_iter().rev() {
                    Self::restore(&mut state, entry);
                }
            }
            let id = self.id;
            state.locks.retain(|_, owner| *owner != id);
        }
        self.shared.released.notify_waiters();
    }

    fn publish(state: &mut State, entry: &Undo, id: TxnId) {
        match entry {
            Undo::Job(job_id, None) => {
                if let Some(row) = state.jobs.get_mut(job_id) {
                    if row.inserted_by == Some(id) {
                        row.inserted_by = None;
                    }
                }
            }
            Undo::Work(table, work_id, None) => {
                if let Some(row) = state
                    .work
                    .get_mut(table)
                    .and_then(|rows| rows.get_mut(work_id))
                {
                    if row.inserted_by == Some(id) {
                        row.inserted_by = None;
                    }
                }
            }
            Undo::Node(key, None) => {
                if let Some(row) = state.nodes.get_mut(key) {
                    if row.inserted_by == Some(id) {
                        row.inserted_by = None;
                    }
                }
            }
            Undo::DeleteJob(job_id) => {
                if state.jobs.get(job_id).map_or(false, |row| row.deleted_by == Some(id)) {
                    state.jobs.remove(job_id);
                }
            }
            Undo::DeleteWork(table, work_id) => {
                if let Some(rows) = state.work.get_mut(table) {
                    if rows.get(work_id).map_or(false, |row| row.deleted_by == Some(id)) {
                        rows.remove(work_id);
                    }
                }
            }
            _ => {}
        }
    }

    fn restore(state: &mut State, entry: Undo) {
        match entry {
            Undo::Job(job_id, previous) => match previous {
                Some(value) => {
                    state.jobs.insert(job_id, Row::new(value, None));
                }
                None => {
                    state.jobs.remove(&job_id);
                }
            },
            Undo::Work(table, work_id, previous) => {
                let rows = state.work.entry(table).or_default();
                match previous {
                    Some(value) => {
                        rows.insert(work_id, Row::new(value, None));
                    }
                    None => {
                        rows.remove(&work_id);
                    }
                }
            }
            Undo::Node(key, previous) => match previous {
                Some(value) => {
                    state.nodes.insert(key, Row::new(value, None));
                }
                None => {
                    state.nodes.remove(&key);
                }
            },
            Undo::DeleteJob(job_id) => {
                if let Some(row) = state.jobs.get_mut(&job_id) {
                    row.deleted_by = None;
                }
            }
            Undo::DeleteWork(table, work_id) => {
                if let Some(row) = state
                    .work
                    .get_mut(&table)
                    .and_then(|rows| rows.get_mut(&work_id))
                {
                    row.deleted_by = None;
                }
            }
        }
    }

    fn run_hooks(hooks: Vec<TxnHook>) {
        for hook in hooks {
            hook();
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(label = %self.label, "Transaction dropped without commit, rolling back");
            self.finish(false);
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn label(&self) -> &str {
        &self.label
    }

    async fn insert_job(&mut self, job: NewJob) -> Result<JobRecord> {
        let record = {
            let mut state = self.shared.state();
            state.job_seq += 1;
            let record = JobRecord {
                job_id: state.job_seq,
                work_type: job.work_type,
                priority: job.priority,
                weight: job.weight,
                not_before: job.not_before,
                assigned: None,
                overdue: None,
                failed: 0,
                pause: job.pause,
            };
            state
                .jobs
                .insert(record.job_id, Row::new(record.clone(), Some(self.id)));
            state.locks.insert(LockKey::Job(record.job_id), self.id);
            record
        };
        self.undo.push(Undo::Job(record.job_id, None));
        Ok(record)
    }

    async fn load_job(&mut self, job_id: JobId) -> Result<Option<JobRecord>> {
        let state = self.shared.state();
        Ok(state
            .jobs
            .get(&job_id)
            .filter(|row| row.visible_to(self.id))
            .map(|row| row.value.clone()))
    }

    async fn update_job(&mut self, job: &JobRecord) -> Result<()> {
        self.shared
            .write_lock(self.id, LockKey::Job(job.job_id))
            .await?;
        let previous = {
            let mut state = self.shared.state();
            match state.jobs.get_mut(&job.job_id) {
                Some(row) if row.visible_to(self.id) => {
                    std::mem::replace(&mut row.value, job.clone())
                }
                _ => return Err(QueueError::NoSuchRecord(job.job_id)),
            }
        };
        self.undo.push(Undo::Job(job.job_id, Some(previous)));
        Ok(())
    }

    async fn delete_job(&mut self, job_id: JobId) -> Result<bool> {
        self.shared
            .write_lock(self.id, LockKey::Job(job_id))
            .await?;
        let id = self.id;
        let deleted = match self.shared.state().jobs.get_mut(&job_id) {
            Some(row) if row.visible_to(id) => {
                row.deleted_by = Some(id);
                true
            }
            _ => false,
        };
        if deleted {
            self.undo.push(Undo::DeleteJob(job_id));
        }
        Ok(deleted)
    }

    async fn due_jobs(&mut self, query: DueJobs) -> Result<Vec<JobRecord>> {
        let mut state = self.shared.state();
        let id = self.id;
        let mut due: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|row| row.visible_to(id))
            .map(|row| &row.value)
            .filter(|job| job.priority >= query.min_priority && job.is_due(query.now))
            .filter(|job| {
                state
                    .locks
                    .get(&LockKey::Job(job.job_id))
                    .map_or(true, |owner| *owner == id)
            })
            .cloned()
            .collect();

        // Unassigned rows first, then oldest assignment, then highest priority.
        due.sort_by(|a, b| {
            a.assigned
                .is_some()
                .cmp(&b.assigned.is_some())
                .then(a.assigned.cmp(&b.assigned))
                .then(b.priority.cmp(&a.priority))
                .then(a.not_before.cmp(&b.not_before))
                .then(a.job_id.cmp(&b.job_id))
        });
        due.truncate(query.limit);

        for job in &due {
            state.locks.insert(LockKey::Job(job.job_id), id);
        }
        Ok(due)
    }

    async fn all_jobs(&mut self) -> Result<Vec<JobRecord>> {
        let state = self.shared.state();
        Ok(state
            .jobs
            .values()
            .filter(|row| row.visible_to(self.id))
            .map(|row| row.value.clone())
            .collect())
    }

    async fn insert_work(&mut self, work: NewWorkRow) -> Result<WorkRecord> {
        let record = {
            let mut state = self.shared.state();
            let id = self.id;
            if !state
                .jobs
                .get(&work.job_id)
                .map_or(false, |row| row.visible_to(id))
            {
                return Err(QueueError::Store(format!(
                    "{} row references missing JOB {}",
                    work.work_type, work.job_id
                )));
            }
            state.work_seq += 1;
            let record = WorkRecord {
                work_id: state.work_seq,
                job_id: work.job_id,
                work_type: work.work_type,
                group: work.group,
                payload: work.payload,
            };
            state
                .work
                .entry(record.work_type.clone())
                .or_default()
                .insert(record.work_id, Row::new(record.clone(), Some(id)));
            state
                .locks
                .insert(LockKey::Work(record.work_type.clone(), record.work_id), id);
            record
        };
        self.undo
            .push(Undo::Work(record.work_type.clone(), record.work_id, None));
        Ok(record)
    }

    async fn work_for_job(&mut self, work_type: &str, job_id: JobId) -> Result<Vec<WorkRecord>> {
        let state = self.shared.state();
        Ok(state.work.get(work_type).map_or_else(Vec::new, |rows| {
            rows.values()
                .filter(|row| row.visible_to(self.id) && row.value.job_id == job_id)
                .map(|row| row.value.clone())
                .collect()
        }))
    }

    async fn all_work(&mut self, work_type: &str) -> Result<Vec<WorkRecord>> {
        let state = self.shared.state();
        Ok(state.work.get(work_type).map_or_else(Vec::new, |rows| {
            rows.values()
                .filter(|row| row.visible_to(self.id))
                .map(|row| row.value.clone())
                .collect()
        }))
    }

    async fn delete_work(&mut self, work_type: &str, work_id: WorkId) -> Result<bool> {
        self.shared
            .write_lock(self.id, LockKey::Work(work_type.to_string(), work_id))
            .await?;
        let id = self.id;
        let deleted = match self
            .shared
            .state()
            .work
            .get_mut(work_type)
            .and_then(|rows| rows.get_mut(&work_id))
        {
            Some(row) if row.visible_to(id) => {
                row.deleted_by = Some(id);
                true
            }
            _ => false,
        };
        if deleted {
            self.undo
                .push(Undo::DeleteWork(work_type.to_string(), work_id));
        }
        Ok(deleted)
    }

    async fn try_lock_work(
        &mut self,
        work_type: &str,
        work_id: WorkId,
        wait: Option<Duration>,
    ) -> Result<bool> {
        let key = LockKey::Work(work_type.to_string(), work_id);
        Ok(self.shared.acquire(self.id, &key, wait).await)
    }

    async fn try_named_lock(&mut self, name: &str, wait: Option<Duration>) -> Result<bool> {
        let key = LockKey::Named(name.to_string());
        Ok(self.shared.acquire(self.id, &key, wait).await)
    }

    async fn lock_nodes_exclusive(&mut self) -> Result<()> {
        self.shared.write_lock(self.id, LockKey::NodeTable).await
    }

    async fn all_nodes(&mut self) -> Result<Vec<NodeInfo>> {
        let state = self.shared.state();
        Ok(state
            .nodes
            .values()
            .filter(|row| row.visible_to(self.id))
            .map(|row| row.value.clone())
            .collect())
    }

    async fn upsert_node(&mut self, node: &NodeInfo) -> Result<()> {
        let key = (node.hostname.clone(), node.port);
        self.shared
            .write_lock(self.id, LockKey::Node(key.clone()))
            .await?;
        let previous = {
            let mut state = self.shared.state();
            let id = self.id;
            match state.nodes.get_mut(&key) {
                Some(row) if row.visible_to(id) => {
                    Some(std::mem::replace(&mut row.value, node.clone()))
                }
                _ => {
                    state
                        .nodes
                        .insert(key.clone(), Row::new(node.clone(), Some(id)));
                    None
                }
            }
        };
        self.undo.push(Undo::Node(key, previous));
        Ok(())
    }

    fn on_commit(&mut self, hook: TxnHook) {
        self.commit_hooks.push(hook);
    }

    fn on_abort(&mut self, hook: TxnHook) {
        self.abort_hooks.push(hook);
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.finish(true);
        self.abort_hooks.clear();
        Self::run_hooks(std::mem::take(&mut self.commit_hooks));
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.finish(false);
        self.commit_hooks.clear();
        Self::run_hooks(std::mem::take(&mut self.abort_hooks));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::scheduler::job::{Priority, DEFAULT_WEIGHT};

    fn new_job(priority: Priority) -> NewJob {
        NewJob {
            work_type: "DUMMY_WORK".to_string(),
            priority,
            weight: DEFAULT_WEIGHT,
            not_before: Utc::now(),
            pause: false,
        }
    }

    fn work_row(job_id: JobId) -> NewWorkRow {
        NewWorkRow {
            work_type: "DUMMY_WORK".to_string(),
            job_id,
            group: None,
            payload: json!({}),
        }
    }

    fn due(limit: usize) -> DueJobs {
        DueJobs {
            now: Utc::now(),
            min_priority: Priority::Low,
            limit,
        }
    }

    #[tokio::test]
    async fn inserts_are_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut writer = store.transaction("writer");
        let job = writer.insert_job(new_job(Priority::Low)).await.unwrap();

        let mut reader = store.transaction("reader");
        assert!(reader.load_job(job.job_id).await.unwrap().is_none());
        assert_eq!(store.job_count(), 0);

        Box::new(writer).commit().await.unwrap();
        assert!(reader.load_job(job.job_id).await.unwrap().is_some());
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test]
    async fn abort_rolls_back_every_write() {
        let store = MemoryStore::new();
        let mut setup = store.transaction("setup");
        let mut job = setup.insert_job(new_job(Priority::Low)).await.unwrap();
        Box::new(setup).commit().await.unwrap();

        let mut txn = store.transaction("abort");
        job.failed = 3;
        txn.update_job(&job).await.unwrap();
        txn.insert_job(new_job(Priority::High)).await.unwrap();
        Box::new(txn).abort().await.unwrap();

        let mut check = store.transaction("check");
        let jobs = check.all_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].failed, 0);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut txn = store.transaction("dropped");
            txn.insert_job(new_job(Priority::Low)).await.unwrap();
        }
        assert_eq!(store.job_count(), 0);
        let mut txn = store.transaction("after");
        assert!(txn.all_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_jobs_skips_rows_locked_elsewhere() {
        let store = MemoryStore::new();
        let mut setup = store.transaction("setup");
        setup.insert_job(new_job(Priority::Low)).await.unwrap();
        setup.insert_job(new_job(Priority::Low)).await.unwrap();
        Box::new(setup).commit().await.unwrap();

        let mut first = store.transaction("first");
        let mut second = store.transaction("second");
        let a = first.due_jobs(due(1)).await.unwrap();
        let b = second.due_jobs(due(1)).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].job_id, b[0].job_id);

        let c = store.transaction("third").due_jobs(due(10)).await.unwrap();
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn due_jobs_orders_by_priority() {
        let store = MemoryStore::new();
        let mut setup = store.transaction("setup");
        let low = setup.insert_job(new_job(Priority::Low)).await.unwrap();
        let high = setup.insert_job(new_job(Priority::High)).await.unwrap();
        let medium = setup.insert_job(new_job(Priority::Medium)).await.unwrap();
        Box::new(setup).commit().await.unwrap();

        let mut txn = store.transaction("poll");
        let ids: Vec<JobId> = txn
            .due_jobs(due(10))
            .await
            .unwrap()
            .iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(ids, vec![high.job_id, medium.job_id, low.job_id]);
    }

    #[tokio::test]
    async fn work_lock_is_exclusive_until_release() {
        let store = MemoryStore::new();
        let mut setup = store.transaction("setup");
        let job = setup.insert_job(new_job(Priority::Low)).await.unwrap();
        let work = setup.insert_work(work_row(job.job_id)).await.unwrap();
        Box::new(setup).commit().await.unwrap();

        let mut holder = store.transaction("holder");
        assert!(holder
            .try_lock_work("DUMMY_WORK", work.work_id, None)
            .await
            .unwrap());

        let mut other = store.transaction("other");
        assert!(!other
            .try_lock_work("DUMMY_WORK", work.work_id, None)
            .await
            .unwrap());

        Box::new(holder).commit().await.unwrap();
        assert!(other
            .try_lock_work("DUMMY_WORK", work.work_id, Some(Duration::from_millis(10)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn waiting_lock_is_granted_on_release() {
        let store = MemoryStore::new();
        let mut holder = store.transaction("holder");
        assert!(holder.try_named_lock("group-a", None).await.unwrap());

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            let mut txn = waiter_store.transaction("waiter");
            txn.try_named_lock("group-a", Some(Duration::from_secs(5)))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        Box::new(holder).commit().await.unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn hooks_follow_outcome() {
        let store = MemoryStore::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let mut txn = store.transaction("commit");
        let (c, a) = (fired.clone(), fired.clone());
        txn.on_commit(Box::new(move || c.lock().unwrap().push("commit")));
        txn.on_abort(Box::new(move || a.lock().unwrap().push("abort")));
        Box::new(txn).commit().await.unwrap();

        let mut txn = store.transaction("abort");
        let (c, a) = (fired.clone(), fired.clone());
        txn.on_commit(Box::new(move || c.lock().unwrap().push("commit")));
        txn.on_abort(Box::new(move || a.lock().unwrap().push("abort")));
        Box::new(txn).abort().await.unwrap();

        assert_eq!(*fired.lock().unwrap(), vec!["commit", "abort"]);
    }

    #[tokio::test]
    async fn deleted_rows_stay_visible_to_others_until_commit() {
        let store = MemoryStore::new();
        let mut setup = store.transaction("setup");
        let job = setup.insert_job(new_job(Priority::Low)).await.unwrap();
        let work = setup.insert_work(work_row(job.job_id)).await.unwrap();
        Box::new(setup).commit().await.unwrap();

        let mut runner = store.transaction("runner");
        assert!(runner.try_lock_work("DUMMY_WORK", work.work_id, None).await.unwrap());
        assert!(runner.delete_work("DUMMY_WORK", work.work_id).await.unwrap());
        assert!(runner.work_for_job("DUMMY_WORK", job.job_id).await.unwrap().is_empty());

        let mut poller = store.transaction("poller");
        let rows = poller.work_for_job("DUMMY_WORK", job.job_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!poller.try_lock_work("DUMMY_WORK", work.work_id, None).await.unwrap());
        assert_eq!(store.work_count("DUMMY_WORK"), 1);

        runner.delete_job(job.job_id).await.unwrap();
        Box::new(runner).commit().await.unwrap();
        assert!(poller.work_for_job("DUMMY_WORK", job.job_id).await.unwrap().is_empty());
        assert!(poller.load_job(job.job_id).await.unwrap().is_none());
        assert_eq!(store.work_count("DUMMY_WORK"), 0);
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn aborted_delete_keeps_the_row() {
        let store = MemoryStore::new();
        let mut setup = store.transaction("setup");
        let job = setup.insert_job(new_job(Priority::Low)).await.unwrap();
        let work = setup.insert_work(work_row(job.job_id)).await.unwrap();
        Box::new(setup).commit().await.unwrap();

        let mut txn = store.transaction("abort");
        txn.delete_work("DUMMY_WORK", work.work_id).await.unwrap();
        txn.delete_job(job.job_id).await.unwrap();
        Box::new(txn).abort().await.unwrap();

        let mut check = store.transaction("check");
        assert!(check.load_job(job.job_id).await.unwrap().is_some());
        assert_eq!(check.all_work("DUMMY_WORK").await.unwrap().len(), 1);
        assert!(check.delete_work("DUMMY_WORK", work.work_id).await.unwrap());
    }

    #[tokio::test]
    async fn work_without_job_row_is_rejected() {
        let store = MemoryStore::new();
        let mut txn = store.transaction("orphan");
        let err = txn.insert_work(work_row(99)).await.unwrap_err();
        assert!(matches!(err, QueueError::Store(_)));
        assert_eq!(store.work_count("DUMMY_WORK"), 0);
    }
}
