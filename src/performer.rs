use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::error::Result;
use crate::peer::PeerConnection;
use crate::queuer::Queuer;
use crate::scheduler::job::JobDescriptor;
use crate::scheduler::queue::JobQueue;
use crate::worker::WorkerPool;

/// Completes when the performer reports the job done (or failed to hand it off).
pub type PerformFuture = BoxFuture<'static, Result<()>>;

/// Where a claimed job gets sent.
///
/// `perform_job` does its load bookkeeping before returning, so a caller
/// that spawns the future and moves on still sees the new load on its next
/// capacity check.
#[derive(Clone)]
pub enum Performer {
    /// Least loaded local worker process.
    Workers(Arc<WorkerPool>),
    /// Another node.
    Peer(Arc<PeerConnection>),
    /// This process.
    Local(LocalPerformer),
    /// Drops the job; pollers elsewhere will run it.
    NonPerformer,
}

impl std::fmt::Debug for Performer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Performer::Workers(_) => write!(f, "Performer::Workers"),
            Performer::Peer(peer) => write!(f, "Performer::Peer({})", peer.id()),
            Performer::Local(_) => write!(f, "Performer::Local"),
            Performer::NonPerformer => write!(f, "Performer::NonPerformer"),
        }
    }
}

impl Performer {
    pub fn perform_job(&self, job: JobDescriptor) -> PerformFuture {
        match self {
            Performer::Workers(pool) => pool.perform_job(job),
            Performer::Peer(peer) => peer.perform_job(job),
            Performer::Local(local) => local.perform_job(job),
            Performer::NonPerformer => {
                tracing::debug!(job_id = job.job_id, "Not performing job");
                Box::pin(async { Ok(()) })
            }
        }
    }
}

/// Runs jobs in-process, in their own transaction.
#[derive(Clone)]
pub struct LocalPerformer {
    queue: Arc<JobQueue>,
    queuer: Arc<dyn Queuer>,
}

impl LocalPerformer {
    pub fn new(queue: Arc<JobQueue>, queuer: Arc<dyn Queuer>) -> Self {
        Self { queue, queuer }
    }

    pub fn perform_job(&self, job: JobDescriptor) -> PerformFuture {
        let queue = self.queue.clone();
        let queuer = self.queuer.clone();
        Box::pin(async move {
            let started = Instant::now();
            let result = queue.ultimately_perform(job.job_id, queuer.as_ref()).await;
            queue.metrics().record(&job.work_type, started.elapsed());
            result
        })
    }
}
