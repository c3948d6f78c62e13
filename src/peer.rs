use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::performer::PerformFuture;
use crate::rpc::{Command, RemoteCall};
use crate::scheduler::job::JobDescriptor;

/// Connection to another node, with an estimate of how busy it is.
pub struct PeerConnection {
    remote: Arc<dyn RemoteCall>,
    /// Last `ReportLoad` from the peer, less our own jobs it already counted.
    reported_load: AtomicI64,
    /// Weight of jobs we have sent it that are still outstanding.
    bonus_load: AtomicI64,
}

impl PeerConnection {
    pub fn new(remote: Arc<dyn RemoteCall>) -> Self {
        Self {
            remote,
            reported_load: AtomicI64::new(0),
            bonus_load: AtomicI64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.remote.id()
    }

    pub fn remote(&self) -> &Arc<dyn RemoteCall> {
        &self.remote
    }

    /// Reported load plus whatever we have sent since.
    pub fn current_load_estimate(&self) -> i64 {
        self.reported_load.load(Ordering::SeqCst) + self.bonus_load.load(Ordering::SeqCst)
    }

    /// The peer reported its total load, which includes our outstanding jobs.
    pub fn report_load(&self, load: i64) {
        let bonus = self.bonus_load.load(Ordering::SeqCst);
        self.reported_load.store(load - bonus, Ordering::SeqCst);
    }

    /// Ask the peer to perform `job`; its weight counts against the peer
    /// until the call returns.
    pub fn perform_job(self: &Arc<Self>, job: JobDescriptor) -> PerformFuture {
        let weight = i64::from(job.weight);
        self.bonus_load.fetch_add(weight, Ordering::SeqCst);
        tracing::debug!(job_id = job.job_id, peer = %self.id(), "Job sent to peer");

        let peer = self.clone();
        Box::pin(async move {
            let result = peer.remote.call(Command::PerformJob { job }).await;
            peer.bonus_load.fetch_sub(weight, Ordering::SeqCst);
            result
        })
    }
}

/// The other nodes this node is connected to.
#[derive(Default)]
pub struct PeerPool {
    peers: RwLock<Vec<Arc<PeerConnection>>>,
    mapped: RwLock<HashMap<(String, u16), Uuid>>,
}

impl std::fmt::Debug for PeerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerPool")
            .field("peers", &self.len())
            .finish()
    }
}

impl PeerPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<PeerConnection>>> {
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, remote: Arc<dyn RemoteCall>) -> Arc<PeerConnection> {
        let peer = Arc::new(PeerConnection::new(remote));
        tracing::info!(peer = %peer.id(), "Peer connected");
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(peer.clone());
        peer
    }

    pub fn remove(&self, id: Uuid) {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| p.id() != id);
        self.mapped
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, peer| *peer != id);
        tracing::info!(peer = %id, "Peer disconnected");
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<PeerConnection>> {
        self.peers().iter().find(|p| p.id() == id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<PeerConnection>> {
        self.peers().clone()
    }

    pub fn len(&self) -> usize {
        self.peers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers().is_empty()
    }

    /// Record which node a connection belongs to; the newest one wins.
    pub fn map_peer(&self, host: &str, port: u16, id: Uuid) {
        tracing::debug!(host, port, peer = %id, "Peer identified");
        self.mapped
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((host.to_string(), port), id);
    }

    pub fn mapped_peer(&self, host: &str, port: u16) -> Option<Arc<PeerConnection>> {
        let id = *self
            .mapped
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(host.to_string(), port))?;
        self.get(id)
    }

    /// Peer with the lowest load estimate; ties go to the earliest connected.
    pub fn least_loaded(&self) -> Option<Arc<PeerConnection>> {
        self.peers()
            .iter()
            .min_by_key(|p| p.current_load_estimate())
            .cloned()
    }

    pub fn report_load(&self, id: Uuid, load: i64) {
        if let Some(peer) = self.get(id) {
            peer.report_load(load);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::Result;

    struct Gate {
        id: Uuid,
        open: Notify,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                open: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl RemoteCall for Gate {
        fn id(&self) -> Uuid {
            self.id
        }

        async fn call(&self, _command: Command) -> Result<()> {
            self.open.notified().await;
            Ok(())
        }
    }

    fn job(weight: u8) -> JobDescriptor {
        JobDescriptor {
            job_id: 1,
            weight,
            work_type: "DUMMY_WORK".to_string(),
        }
    }

    #[tokio::test]
    async fn bonus_load_counts_until_call_returns() {
        let gate = Gate::new();
        let peer = Arc::new(PeerConnection::new(gate.clone()));
        peer.report_load(2);
        assert_eq!(peer.current_load_estimate(), 2);

        let pending = tokio::spawn(peer.perform_job(job(5)));
        assert_eq!(peer.current_load_estimate(), 7);

        // The peer's own report now includes our job.
        peer.report_load(9);
        assert_eq!(peer.current_load_estimate(), 9);

        tokio::task::yield_now().await;
        gate.open.notify_one();
        pending.await.unwrap().unwrap();
        assert_eq!(peer.current_load_estimate(), 4);
    }

    #[test]
    fn least_loaded_prefers_lowest_estimate_then_order() {
        let pool = PeerPool::new();
        let a = pool.add(Gate::new());
        let b = pool.add(Gate::new());
        assert_eq!(pool.least_loaded().unwrap().id(), a.id());

        a.report_load(3);
        b.report_load(1);
        assert_eq!(pool.least_loaded().unwrap().id(), b.id());
    }

    #[test]
    fn mapping_follows_removal() {
        let pool = PeerPool::new();
        let a = pool.add(Gate::new());
        pool.map_peer("node-b", 7000, a.id());
        assert_eq!(pool.mapped_peer("node-b", 7000).unwrap().id(), a.id());

        pool.report_load(a.id(), 4);
        assert_eq!(a.current_load_estimate(), 4);

        pool.remove(a.id());
        assert!(pool.is_empty());
        assert!(pool.mapped_peer("node-b", 7000).is_none());
    }
}
