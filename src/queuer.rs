//! Entry points for enqueueing work.
//!
//! Every queuer writes the job and work rows in the caller's transaction;
//! they differ in what happens once that transaction commits.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::performer::LocalPerformer;
use crate::scheduler::queue::JobQueue;
use crate::scheduler::work::{NewWork, WorkProposal};
use crate::store::Transaction;

/// Something that can add work to the queue.
#[async_trait]
pub trait Queuer: Send + Sync {
    /// Write `work` in `txn`. Returns `None` when a singleton swallowed it.
    async fn enqueue_work(
        &self,
        txn: &mut dyn Transaction,
        work: NewWork,
    ) -> Result<Option<WorkProposal>>;
}

pub type ProposalCallback = Arc<dyn Fn(&WorkProposal) + Send + Sync>;

/// Observers notified of every enqueue that commits.
#[derive(Clone, Default)]
pub struct ProposalCallbacks {
    callbacks: Arc<Mutex<Vec<ProposalCallback>>>,
}

impl std::fmt::Debug for ProposalCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProposalCallbacks")
            .field("count", &self.lock().len())
            .finish()
    }
}

impl ProposalCallbacks {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ProposalCallback>> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, callback: impl Fn(&WorkProposal) + Send + Sync + 'static) {
        self.lock().push(Arc::new(callback));
    }

    pub fn fire(&self, proposal: &WorkProposal) {
        let callbacks = self.lock().clone();
        for callback in callbacks {
            callback(proposal);
        }
    }
}

/// Performs committed work in this process as soon as it is due.
///
/// Used when there is no poll loop at all, e.g. single process tools.
pub struct LocalQueuer {
    queue: Arc<JobQueue>,
    callbacks: ProposalCallbacks,
    me: Weak<LocalQueuer>,
}

impl LocalQueuer {
    pub fn new(queue: Arc<JobQueue>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            queue,
            callbacks: ProposalCallbacks::default(),
            me: me.clone(),
        })
    }

    pub fn callbacks(&self) -> &ProposalCallbacks {
        &self.callbacks
    }

    fn perform_when_due(self: Arc<Self>, proposal: WorkProposal) {
        let delay = (proposal.not_before - self.queue.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let performer = LocalPerformer::new(self.queue.clone(), self.clone());
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = performer.perform_job(proposal.descriptor()).await {
                tracing::warn!(job_id = proposal.job_id, error = %e, "Local job failed");
            }
        });
    }
}

#[async_trait]
impl Queuer for LocalQueuer {
    async fn enqueue_work(
        &self,
        txn: &mut dyn Transaction,
        work: NewWork,
    ) -> Result<Option<WorkProposal>> {
        let proposal = self.queue.make_job(txn, work).await?;
        if let Some(proposal) = &proposal {
            let callbacks = self.callbacks.clone();
            let me = self.me.clone();
            let proposal = proposal.clone();
            txn.on_commit(Box::new(move || {
                callbacks.fire(&proposal);
                if let Some(queuer) = me.upgrade() {
                    queuer.perform_when_due(proposal);
                }
            }));
        }
        Ok(proposal)
    }
}

/// Writes work and nothing else; some polling node will pick it up.
#[derive(Debug)]
pub struct NonPerformingQueuer {
    queue: Arc<JobQueue>,
    callbacks: ProposalCallbacks,
}

impl NonPerformingQueuer {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self {
            queue,
            callbacks: ProposalCallbacks::default(),
        }
    }

    pub fn callbacks(&self) -> &ProposalCallbacks {
        &self.callbacks
    }
}

#[async_trait]
impl Queuer for NonPerformingQueuer {
    async fn enqueue_work(
        &self,
        txn: &mut dyn Transaction,
        work: NewWork,
    ) -> Result<Option<WorkProposal>> {
        let proposal = self.queue.make_job(txn, work).await?;
        if let Some(proposal) = &proposal {
            let callbacks = self.callbacks.clone();
            let proposal = proposal.clone();
            txn.on_commit(Box::new(move || callbacks.fire(&proposal)));
        }
        Ok(proposal)
    }
}
