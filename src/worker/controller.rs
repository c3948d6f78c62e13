use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{QueueError, Result};
use crate::queuer::{ProposalCallbacks, Queuer};
use crate::rpc::{self, Command, Connection, RemoteCall, Responder};
use crate::scheduler::queue::JobQueue;
use crate::scheduler::work::{NewWork, WorkProposal};
use crate::store::Transaction;

/// A worker process's connection back to its node controller.
///
/// The controller sends `PerformJob`; the worker runs the job against the
/// shared database and acknowledges once it is done. Work enqueued from the
/// worker is written locally and the controller is told to poll.
pub struct ControllerConnection {
    queue: Arc<JobQueue>,
    callbacks: ProposalCallbacks,
    conn: OnceLock<Arc<Connection>>,
}

impl ControllerConnection {
    pub async fn connect(addr: SocketAddr, queue: Arc<JobQueue>) -> Result<Arc<Self>> {
        let controller = Arc::new(Self::unattached(queue));
        let conn = rpc::connect(addr, controller.clone()).await?;
        controller.attach(conn);
        Ok(controller)
    }

    /// Run over an already established stream.
    pub fn spawn<T>(io: T, queue: Arc<JobQueue>) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let controller = Arc::new(Self::unattached(queue));
        let conn = Connection::spawn(io, controller.clone());
        controller.attach(conn);
        controller
    }

    fn unattached(queue: Arc<JobQueue>) -> Self {
        Self {
            queue,
            callbacks: ProposalCallbacks::default(),
            conn: OnceLock::new(),
        }
    }

    fn attach(&self, conn: Arc<Connection>) {
        tracing::info!(conn = %conn.id(), "Worker connected to controller");
        let _ = self.conn.set(conn);
    }

    pub fn callbacks(&self) -> &ProposalCallbacks {
        &self.callbacks
    }

    pub fn close(&self) {
        if let Some(conn) = self.conn.get() {
            conn.close();
        }
    }

    /// Tell the controller new work exists.
    pub async fn enqueued_job(&self) -> Result<()> {
        match self.conn.get() {
            Some(conn) => conn.call(Command::EnqueuedJob).await,
            None => Err(QueueError::ConnectionClosed),
        }
    }
}

#[async_trait]
impl Responder for ControllerConnection {
    async fn respond(&self, _conn: &Arc<Connection>, command: Command) -> Result<()> {
        match command {
            Command::PerformJob { job } => self.queue.ultimately_perform(job.job_id, self).await,
            other => Err(QueueError::UnexpectedCommand(other.name())),
        }
    }

    async fn disconnected(&self, conn: &Arc<Connection>) {
        tracing::info!(conn = %conn.id(), "Lost connection to controller");
    }
}

#[async_trait]
impl Queuer for ControllerConnection {
    async fn enqueue_work(
        &self,
        txn: &mut dyn Transaction,
        work: NewWork,
    ) -> Result<Option<WorkProposal>> {
        let proposal = self.queue.make_job(txn, work).await?;
        if let Some(proposal) = &proposal {
            let callbacks = self.callbacks.clone();
            let conn = self.conn.get().cloned();
            let proposal = proposal.clone();
            txn.on_commit(Box::new(move || {
                callbacks.fire(&proposal);
                if let Some(conn) = conn {
                    tokio::spawn(async move {
                        if let Err(e) = conn.call(Command::EnqueuedJob).await {
                            tracing::debug!(error = %e, "Failed to notify controller of new job");
                        }
                    });
                }
            }));
        }
        Ok(proposal)
    }
}
