use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{QueueError, Result};
use crate::peer::PeerPool;
use crate::performer::{LocalPerformer, Performer};
use crate::queuer::{ProposalCallbacks, Queuer};
use crate::rpc::{self, Command, Connection, RemoteCall, Responder};
use crate::scheduler::job::{Failure, JobDescriptor, JobId, JobRecord, Priority};
use crate::scheduler::node_info::NodeInfo;
use crate::scheduler::queue::JobQueue;
use crate::scheduler::timer::PollTimer;
use crate::scheduler::work::{NewWork, WorkProposal};
use crate::store::{self, Transaction};
use crate::worker::{WorkerPool, WorkerResponder};

/// Result of looking at the next due job inside the claim transaction.
enum Claim {
    /// Nothing due at this priority.
    Idle,
    /// An overdue job that is still running; its deadline was pushed out.
    Bumped,
    Claimed(JobRecord),
}

/// The per-node service that polls `JOB` and hands work out.
///
/// Every node sharing the database runs one. Each poll cycle it works out how
/// loaded its workers are, claims due jobs it has room for, and passes each to
/// a [`Performer`] without waiting for the result:
///
/// 1. local workers, while any of them is below its load ceiling
/// 2. the least loaded peer node, for requests that may leave this node
/// 3. this process, when the node runs without a worker pool
///
/// It also accepts worker and peer connections, registers itself in
/// `NODE_INFO`, and reports its load to its peers.
pub struct NodeCoordinator {
    config: NodeConfig,
    queue: Arc<JobQueue>,
    workers: Option<Arc<WorkerPool>>,
    peers: Arc<PeerPool>,
    timer: Arc<PollTimer>,
    callbacks: ProposalCallbacks,
    enabled: AtomicBool,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    worker_addr: Mutex<Option<SocketAddr>>,
    this_node: Mutex<Option<NodeInfo>>,
    /// Admission limit of the previous cycle; `None` inside means overloaded.
    last_min_priority: Mutex<Option<Option<Priority>>>,
    me: Weak<NodeCoordinator>,
}

impl std::fmt::Debug for NodeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCoordinator")
            .field("hostname", &self.config.hostname)
            .field("enabled", &self.is_enabled())
            .field("workers", &self.workers)
            .field("peers", &self.peers)
            .finish()
    }
}

impl NodeCoordinator {
    pub fn new(config: NodeConfig, queue: Arc<JobQueue>) -> Arc<Self> {
        let workers = config.use_worker_pool.then(|| {
            Arc::new(WorkerPool::new(
                config.max_load_per_worker,
                queue.metrics().clone(),
            ))
        });
        let timer = Arc::new(PollTimer::new(queue.config().clone()));
        Arc::new_cyclic(|me| Self {
            enabled: AtomicBool::new(!config.disable_work_processing),
            config,
            queue,
            workers,
            peers: Arc::new(PeerPool::new()),
            timer,
            callbacks: ProposalCallbacks::default(),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            peer_addr: Mutex::new(None),
            worker_addr: Mutex::new(None),
            this_node: Mutex::new(None),
            last_min_priority: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn workers(&self) -> Option<&Arc<WorkerPool>> {
        self.workers.as_ref()
    }

    pub fn peers(&self) -> &Arc<PeerPool> {
        &self.peers
    }

    pub fn timer(&self) -> &Arc<PollTimer> {
        &self.timer
    }

    pub fn callbacks(&self) -> &ProposalCallbacks {
        &self.callbacks
    }

    /// Address the peer listener is bound to, once started.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *lock(&self.peer_addr)
    }

    /// Address the worker listener is bound to, once started.
    pub fn worker_addr(&self) -> Option<SocketAddr> {
        *lock(&self.worker_addr)
    }

    /// This node's `NODE_INFO` row, once registered.
    pub fn this_node(&self) -> Option<NodeInfo> {
        lock(&self.this_node).clone()
    }

    /// Resume work processing and poll right away.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        self.timer.enqueued();
        tracing::info!(hostname = %self.config.hostname, "Work processing enabled");
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        tracing::info!(hostname = %self.config.hostname, "Work processing disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn arc(&self) -> Result<Arc<Self>> {
        self.me.upgrade().ok_or(QueueError::ConnectionClosed)
    }

    fn spawn_task(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        lock(&self.tasks).push(tokio::spawn(task));
    }

    /// Bind listeners, register in `NODE_INFO`, connect to the other nodes,
    /// and start the poll loop and load reports. A failed start may be retried.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.launch().await {
            self.started.store(false, Ordering::SeqCst);
            tracing::error!(hostname = %self.config.hostname, error = %e, "Node failed to start");
            return Err(e);
        }
        Ok(())
    }

    /// Nothing is spawned until every fallible step has succeeded.
    async fn launch(&self) -> Result<()> {
        let node = self.arc()?;

        let worker_listener = match (&self.workers, self.config.worker_listen_addr) {
            (Some(_), Some(addr)) => Some(bind(addr).await?),
            _ => None,
        };
        let peer_listener = match self.config.listen_addr {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };
        let others = match &peer_listener {
            Some((_, bound)) => self.register(bound.port()).await?,
            None => Vec::new(),
        };

        if let (Some(pool), Some((listener, bound))) = (&self.workers, worker_listener) {
            *lock(&self.worker_addr) = Some(bound);
            tracing::info!(addr = %bound, "Listening for workers");
            let responder = Arc::new(WorkerResponder::new(pool.clone(), self.timer.clone()));
            self.spawn_task(rpc::serve(listener, responder, self.cancel.clone()));
        }

        if let Some((listener, bound)) = peer_listener {
            *lock(&self.peer_addr) = Some(bound);
            tracing::info!(addr = %bound, "Listening for peers");
            let responder = Arc::new(PeerResponder {
                node: self.me.clone(),
            });
            self.spawn_task(rpc::serve(listener, responder, self.cancel.clone()));
            for other in others {
                self.connect_to_node(other);
            }
        }

        self.spawn_task(node.clone().poll_loop());
        self.spawn_task(node.load_report_loop());
        Ok(())
    }

    /// Stop polling, listening and reporting. Jobs already handed to workers
    /// or peers are left alone. A stopped node cannot be restarted.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Node task ended abnormally");
            }
        }
        tracing::info!(hostname = %self.config.hostname, "Node stopped");
    }

    /// Insert or refresh this node's row under an exclusive table lock and
    /// return every other registered node.
    async fn register(&self, port: u16) -> Result<Vec<NodeInfo>> {
        let me = NodeInfo::new(self.config.hostname.clone(), port, self.queue.now());
        let row = me.clone();
        let nodes = store::in_transaction(self.queue.store(), "register_node", move |txn| {
            Box::pin(async move {
                txn.lock_nodes_exclusive().await?;
                let nodes = txn.all_nodes().await?;
                txn.upsert_node(&row).await?;
                Ok(nodes)
            })
        })
        .await?;
        tracing::info!(hostname = %me.hostname, port, pid = me.pid, "Node registered");
        *lock(&self.this_node) = Some(me.clone());
        Ok(nodes
            .into_iter()
            .filter(|n| !n.is(&me.hostname, me.port))
            .collect())
    }

    fn connect_to_node(&self, other: NodeInfo) {
        let node = self.me.clone();
        let responder: Arc<dyn Responder> = Arc::new(PeerResponder {
            node: self.me.clone(),
        });
        tokio::spawn(async move {
            match rpc::connect((other.hostname.as_str(), other.port), responder).await {
                Ok(conn) => {
                    if let Some(node) = node.upgrade() {
                        node.identify_to(conn, &other.hostname, other.port).await;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        host = %other.hostname,
                        port = other.port,
                        error = %e,
                        "Could not connect to cluster peer"
                    );
                }
            }
        });
    }

    /// Accept a worker process over an established stream.
    pub fn accept_worker<T>(&self, io: T) -> Result<Arc<Connection>>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let pool = self.workers.as_ref().ok_or(QueueError::NoWorkerPool)?;
        let responder = Arc::new(WorkerResponder::new(pool.clone(), self.timer.clone()));
        let conn = Connection::spawn(io, responder);
        self.close_on_stop(conn.clone());
        Ok(conn)
    }

    /// Accept a connection from another node over an established stream.
    pub fn accept_peer<T>(&self, io: T) -> Arc<Connection>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Connection::spawn(
            io,
            Arc::new(PeerResponder {
                node: self.me.clone(),
            }),
        );
        self.close_on_stop(conn.clone());
        conn
    }

    /// Connect to the node at `host:port` over an established stream and
    /// identify ourselves to it.
    pub async fn connect_peer<T>(&self, io: T, host: &str, port: u16) -> Arc<Connection>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = self.accept_peer(io);
        self.identify_to(conn.clone(), host, port).await;
        conn
    }

    async fn identify_to(&self, conn: Arc<Connection>, host: &str, port: u16) {
        self.close_on_stop(conn.clone());
        self.peers.map_peer(host, port, conn.id());
        let (my_host, my_port) = match self.this_node() {
            Some(me) => (me.hostname, me.port),
            None => (self.config.hostname.clone(), self.config.port()),
        };
        if let Err(e) = conn
            .call(Command::IdentifyNode {
                host: my_host,
                port: my_port,
            })
            .await
        {
            tracing::error!(host, port, error = %e, "Could not identify to cluster peer");
        }
    }

    fn close_on_stop(&self, conn: Arc<Connection>) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => conn.close(),
                _ = conn.closed() => {}
            }
        });
    }

    /// Load percentage used for admission; 0 without a worker pool, since
    /// then this process takes all the work itself.
    pub fn load_level(&self) -> u32 {
        self.workers.as_ref().map_or(0, |pool| pool.load_level())
    }

    /// Outstanding job weight across local workers.
    pub fn total_load(&self) -> u64 {
        self.workers.as_ref().map_or(0, |pool| pool.all_worker_load())
    }

    /// Pick who should run the next job.
    pub fn choose_performer(&self, only_locally: bool) -> Result<Performer> {
        if let Some(pool) = &self.workers {
            if pool.has_available_capacity() {
                return Ok(Performer::Workers(pool.clone()));
            }
            if !only_locally {
                if let Some(peer) = self.peers.least_loaded() {
                    return Ok(Performer::Peer(peer));
                }
            }
            return Err(QueueError::NoCapacity);
        }
        let queuer: Arc<dyn Queuer> = self.arc()?;
        Ok(Performer::Local(LocalPerformer::new(self.queue.clone(), queuer)))
    }

    /// A peer asked us to run a job; keep it on this node.
    pub async fn perform_job_for_peer(&self, job: JobDescriptor) -> Result<()> {
        self.choose_performer(true)?.perform_job(job).await
    }

    /// New work may exist; poll now if the loop has backed off.
    pub fn enqueued_job(&self) {
        self.timer.enqueued();
    }

    /// Tell every connected peer our current load.
    pub async fn report_load_to_peers(&self) {
        let load = i64::try_from(self.total_load()).unwrap_or(i64::MAX);
        let peers = self.peers.all();
        let calls = peers.iter().map(|peer| async move {
            if let Err(e) = peer.remote().call(Command::ReportLoad { load }).await {
                tracing::debug!(peer = %peer.id(), error = %e, "Failed to report load");
            }
        });
        futures::future::join_all(calls).await;
    }

    /// Lowest priority to admit at `level`, logging transitions.
    fn admit(&self, level: u32) -> Option<Priority> {
        let min_priority = self.queue.config().min_priority_for_load(level);
        let mut last = lock(&self.last_min_priority);
        if *last != Some(min_priority) {
            match (min_priority, *last) {
                (None, _) => tracing::error!(level, "Job queue is overloaded"),
                (Some(priority), Some(None)) => {
                    tracing::error!(level, min_priority = %priority, "Job queue is no longer overloaded")
                }
                (Some(priority), _) => {
                    tracing::debug!(level, min_priority = %priority, "Job queue priority limit changed")
                }
            }
            *last = Some(min_priority);
        }
        min_priority
    }

    /// One poll cycle: claim and dispatch due jobs until none are left, the
    /// node runs out of capacity, or it is disabled. Returns how many jobs
    /// were dispatched.
    pub async fn work_check(&self) -> Result<usize> {
        let mut dispatched = 0;
        loop {
            if !self.is_enabled() || self.cancel.is_cancelled() {
                break;
            }

            let level = self.load_level();
            let Some(min_priority) = self.admit(level) else {
                self.timer.work_seen();
                break;
            };
            let performer = match self.choose_performer(true) {
                Ok(performer) => performer,
                Err(QueueError::NoCapacity) => {
                    self.timer.work_seen();
                    break;
                }
                Err(e) => return Err(e),
            };

            let now = self.queue.now();
            let mut txn = self.queue.store().begin("work_check").await?;
            let mut candidate = None;
            let job = match self
                .claim_next(txn.as_mut(), now, min_priority, &mut candidate)
                .await
            {
                Ok(Claim::Idle) => {
                    txn.commit().await?;
                    break;
                }
                Ok(Claim::Bumped) => {
                    txn.commit().await?;
                    continue;
                }
                Ok(Claim::Claimed(job)) => {
                    txn.commit().await?;
                    job
                }
                Err(e) => {
                    tracing::error!(job_id = ?candidate, error = %e, "Failed to pick a new job");
                    if let Err(abort_err) = txn.abort().await {
                        tracing::warn!(error = %abort_err, "Failed to abort claim transaction");
                    }
                    match candidate {
                        Some(job_id) => {
                            if !self.mark_failed(job_id).await {
                                break;
                            }
                            continue;
                        }
                        None => {
                            tracing::error!("Cannot mark failed new job");
                            break;
                        }
                    }
                }
            };

            self.timer.work_seen();
            dispatched += 1;
            let job_id = job.job_id;
            let done = performer.perform_job(job.descriptor());
            tokio::spawn(async move {
                if let Err(e) = done.await {
                    tracing::warn!(job_id, error = %e, "Failed to perform job");
                }
            });
        }

        if dispatched > 0 {
            tracing::debug!(count = dispatched, "Processed jobs in one poll cycle");
        }
        Ok(dispatched)
    }

    async fn claim_next(
        &self,
        txn: &mut dyn Transaction,
        now: chrono::DateTime<chrono::Utc>,
        min_priority: Priority,
        candidate: &mut Option<JobId>,
    ) -> Result<Claim> {
        let Some(mut job) = self.queue.next_job(txn, now, min_priority).await? else {
            return Ok(Claim::Idle);
        };
        *candidate = Some(job.job_id);

        if job.assigned.is_some() {
            if self.queue.is_running(txn, &job).await? {
                job.bump_overdue(txn, now, self.queue.config().overdue_timeout)
                    .await?;
                tracing::debug!(job_id = job.job_id, "Bumped overdue timeout on running job");
                return Ok(Claim::Bumped);
            }
            tracing::debug!(job_id = job.job_id, "Overdue job re-assigned");
        }

        job.assign(txn, now, self.queue.config().overdue_timeout)
            .await?;
        Ok(Claim::Claimed(job))
    }

    /// Best-effort `failed_to_run` for a job that broke the claim. Returns
    /// false if even that failed.
    async fn mark_failed(&self, job_id: JobId) -> bool {
        match self.queue.failure_clean_up(job_id, Failure::Error).await {
            Ok(()) => {
                tracing::error!(job_id, "Marked failed new job");
                true
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to mark failed new job");
                false
            }
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.work_check().await {
                tracing::error!(error = %e, "Work check failed");
            }
            let interval = self.timer.next_interval();
            tokio::select! {
                _ = self.timer.wait(interval) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        tracing::debug!("Poll loop stopped");
    }

    async fn load_report_loop(self: Arc<Self>) {
        let interval = self.queue.config().load_report_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => break,
            }
            self.report_load_to_peers().await;
        }
    }
}

#[async_trait]
impl Queuer for NodeCoordinator {
    async fn enqueue_work(
        &self,
        txn: &mut dyn Transaction,
        work: NewWork,
    ) -> Result<Option<WorkProposal>> {
        let proposal = self.queue.make_job(txn, work).await?;
        if let Some(proposal) = &proposal {
            let callbacks = self.callbacks.clone();
            let timer = self.timer.clone();
            let proposal = proposal.clone();
            txn.on_commit(Box::new(move || {
                callbacks.fire(&proposal);
                timer.enqueued();
            }));
        }
        Ok(proposal)
    }
}

/// Answers commands from other nodes.
struct PeerResponder {
    node: Weak<NodeCoordinator>,
}

impl PeerResponder {
    fn node(&self) -> Result<Arc<NodeCoordinator>> {
        self.node.upgrade().ok_or(QueueError::ConnectionClosed)
    }
}

#[async_trait]
impl Responder for PeerResponder {
    async fn connected(&self, conn: &Arc<Connection>) {
        if let Ok(node) = self.node() {
            node.peers.add(conn.clone());
        }
    }

    async fn respond(&self, conn: &Arc<Connection>, command: Command) -> Result<()> {
        let node = self.node()?;
        match command {
            Command::IdentifyNode { host, port } => {
                node.peers.map_peer(&host, port, conn.id());
                Ok(())
            }
            Command::ReportLoad { load } => {
                node.peers.report_load(conn.id(), load);
                Ok(())
            }
            Command::PerformJob { job } => node.perform_job_for_peer(job).await,
            Command::EnqueuedJob => {
                node.enqueued_job();
                Ok(())
            }
        }
    }

    async fn disconnected(&self, conn: &Arc<Connection>) {
        if let Ok(node) = self.node() {
            node.peers.remove(conn.id());
        }
    }
}

async fn bind(addr: SocketAddr) -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    Ok((listener, bound))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
