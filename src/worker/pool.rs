use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::metrics::WorkMetrics;
use crate::performer::PerformFuture;
use crate::rpc::{Command, Connection, RemoteCall, Responder};
use crate::scheduler::job::{JobDescriptor, Weight};
use crate::scheduler::timer::PollTimer;

/// Controller-side view of one worker process.
pub struct WorkerConnection {
    remote: Arc<dyn RemoteCall>,
    /// Sum of the weights of jobs sent and not yet acknowledged.
    load: AtomicU64,
    assigned: AtomicU64,
    completed: AtomicU64,
}

impl WorkerConnection {
    pub fn new(remote: Arc<dyn RemoteCall>) -> Self {
        Self {
            remote,
            load: AtomicU64::new(0),
            assigned: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.remote.id()
    }

    pub fn current_load(&self) -> u64 {
        self.load.load(Ordering::SeqCst)
    }

    pub fn current_assigned(&self) -> u64 {
        self.assigned.load(Ordering::SeqCst)
    }

    pub fn total_completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}

/// Holds a job's weight against a worker until the job finishes.
struct LoadGuard {
    worker: Arc<WorkerConnection>,
    weight: u64,
}

impl LoadGuard {
    fn new(worker: Arc<WorkerConnection>, weight: Weight) -> Self {
        let weight = u64::from(weight);
        worker.load.fetch_add(weight, Ordering::SeqCst);
        worker.assigned.fetch_add(1, Ordering::SeqCst);
        Self { worker, weight }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.worker.load.fetch_sub(self.weight, Ordering::SeqCst);
        self.worker.assigned.fetch_sub(1, Ordering::SeqCst);
        self.worker.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// The local worker processes of one node.
pub struct WorkerPool {
    workers: RwLock<Vec<Arc<WorkerConnection>>>,
    max_load_per_worker: Weight,
    metrics: Arc<WorkMetrics>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.len())
            .field("max_load_per_worker", &self.max_load_per_worker)
            .finish()
    }
}

impl WorkerPool {
    pub fn new(max_load_per_worker: Weight, metrics: Arc<WorkMetrics>) -> Self {
        Self {
            workers: RwLock::new(Vec::new()),
            max_load_per_worker,
            metrics,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<WorkerConnection>>> {
        self.workers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<WorkerConnection>>> {
        self.workers.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_worker(&self, remote: Arc<dyn RemoteCall>) -> Arc<WorkerConnection> {
        let worker = Arc::new(WorkerConnection::new(remote));
        tracing::info!(worker_id = %worker.id(), "Worker connected");
        self.write().push(worker.clone());
        worker
    }

    pub fn remove_worker(&self, id: Uuid) {
        let mut workers = self.write();
        let before = workers.len();
        workers.retain(|w| w.id() != id);
        if workers.len() != before {
            tracing::info!(worker_id = %id, "Worker disconnected");
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// True if some worker is below the per-worker load ceiling.
    pub fn has_available_capacity(&self) -> bool {
        let max = u64::from(self.max_load_per_worker);
        self.read().iter().any(|w| w.current_load() < max)
    }

    /// Total load as a percentage of total capacity; 100 with no workers.
    pub fn load_level(&self) -> u32 {
        let workers = self.read();
        let total = workers.len() as u64 * u64::from(self.max_load_per_worker);
        if total == 0 {
            return 100;
        }
        let current: u64 = workers.iter().map(|w| w.current_load()).sum();
        u32::try_from(current * 100 / total).unwrap_or(u32::MAX)
    }

    pub fn all_worker_load(&self) -> u64 {
        self.read().iter().map(|w| w.current_load()).sum()
    }

    /// `(assigned, load, completed)` for each worker, in connection order.
    pub fn each_worker_load(&self) -> Vec<(u64, u64, u64)> {
        self.read()
            .iter()
            .map(|w| (w.current_assigned(), w.current_load(), w.total_completed()))
            .collect()
    }

    /// Lowest current load; ties go to the earliest connected.
    fn least_loaded(&self) -> Option<Arc<WorkerConnection>> {
        self.read()
            .iter()
            .min_by_key(|w| w.current_load())
            .cloned()
    }

    /// Send `job` to the least loaded worker. The weight is charged now and
    /// released when the worker answers.
    pub fn perform_job(&self, job: JobDescriptor) -> PerformFuture {
        let Some(worker) = self.least_loaded() else {
            return Box::pin(async { Err(QueueError::NoCapacity) });
        };
        let guard = LoadGuard::new(worker.clone(), job.weight);
        let metrics = self.metrics.clone();
        tracing::debug!(job_id = job.job_id, worker_id = %worker.id(), "Job sent to worker");

        Box::pin(async move {
            let started = Instant::now();
            let work_type = job.work_type.clone();
            let result = worker.remote.call(Command::PerformJob { job }).await;
            drop(guard);
            metrics.record(&work_type, started.elapsed());
            result
        })
    }
}

/// Answers the commands a worker process sends to its controller.
pub struct WorkerResponder {
    pool: Arc<WorkerPool>,
    timer: Arc<PollTimer>,
}

impl WorkerResponder {
    pub fn new(pool: Arc<WorkerPool>, timer: Arc<PollTimer>) -> Self {
        Self { pool, timer }
    }
}

#[async_trait]
impl Responder for WorkerResponder {
    async fn connected(&self, conn: &Arc<Connection>) {
        self.pool.add_worker(conn.clone());
    }

    async fn respond(&self, _conn: &Arc<Connection>, command: Command) -> Result<()> {
        match command {
            Command::EnqueuedJob => {
                self.timer.enqueued();
                Ok(())
            }
            other => Err(QueueError::UnexpectedCommand(other.name())),
        }
    }

    async fn disconnected(&self, conn: &Arc<Connection>) {
        self.pool.remove_worker(conn.id());
    }
}
