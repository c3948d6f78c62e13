use std::net::SocketAddr;
use std::time::Duration;

use crate::scheduler::job::{Priority, Weight, WEIGHT_CAPACITY};

/// Tuning for the job table poll loop and the failure/backoff curve.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Fast poll interval used while there is work around.
    pub poll_interval: Duration,
    /// `(idle_for, interval)` stages, checked in order: once the loop has been
    /// idle longer than `idle_for`, poll every `interval` instead.
    pub polling_backoff: Vec<(Duration, Duration)>,
    /// How long after assignment a job is considered possibly orphaned.
    pub overdue_timeout: Duration,
    /// Base delay before retrying a job whose locks were held.
    pub lock_reschedule_interval: Duration,
    /// Base delay before retrying a job that failed.
    pub failure_reschedule_interval: Duration,
    /// Load percentage above which polling stops for the cycle.
    pub overload_level: u32,
    /// Load percentage above which only high priority work is taken.
    pub high_priority_level: u32,
    /// Load percentage above which only medium and high priority work is taken.
    pub medium_priority_level: u32,
    /// How long a job waits for its work row and group locks before giving up.
    pub lock_timeout: Duration,
    /// How often this node tells its peers about its load.
    pub load_report_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            polling_backoff: vec![
                (Duration::from_secs(60), Duration::from_secs(60)),
                (Duration::from_secs(5), Duration::from_secs(1)),
            ],
            overdue_timeout: Duration::from_secs(5 * 60),
            lock_reschedule_interval: Duration::from_secs(60),
            failure_reschedule_interval: Duration::from_secs(60),
            overload_level: 95,
            high_priority_level: 80,
            medium_priority_level: 50,
            lock_timeout: Duration::from_secs(2),
            load_report_interval: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    /// Lowest priority admissible at the given load percentage, or `None` when
    /// the node is overloaded and should not take any work.
    pub fn min_priority_for_load(&self, level: u32) -> Option<Priority> {
        if level > self.overload_level {
            None
        } else if level > self.high_priority_level {
            Some(Priority::High)
        } else if level > self.medium_priority_level {
            Some(Priority::Medium)
        } else {
            Some(Priority::Low)
        }
    }

    /// Poll interval after the loop has found nothing to do for `idle`.
    pub fn poll_interval_after(&self, idle: Duration) -> Duration {
        self.polling_backoff
            .iter()
            .find(|(threshold, _)| idle > *threshold)
            .map(|(_, interval)| *interval)
            .unwrap_or(self.poll_interval)
    }

    pub fn with_polling_backoff(mut self, stages: Vec<(Duration, Duration)>) -> Self {
        self.polling_backoff = stages;
        self
    }
}

/// Networking and dispatch settings of one node. Queue tuning lives in the
/// [`QueueConfig`] of the node's `JobQueue`.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name this node registers under in `NODE_INFO`; peers connect to it.
    pub hostname: String,
    /// Where to listen for peer nodes. `None` runs without peer networking.
    pub listen_addr: Option<SocketAddr>,
    /// Where to listen for local worker processes.
    pub worker_listen_addr: Option<SocketAddr>,
    /// Dispatch to worker processes; when false all work runs in-process.
    pub use_worker_pool: bool,
    /// Start with job processing switched off.
    pub disable_work_processing: bool,
    pub max_load_per_worker: Weight,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            listen_addr: None,
            worker_listen_addr: None,
            use_worker_pool: true,
            disable_work_processing: false,
            max_load_per_worker: WEIGHT_CAPACITY,
        }
    }
}

impl NodeConfig {
    pub fn new(hostname: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            hostname: hostname.into(),
            listen_addr: Some(listen_addr),
            ..Default::default()
        }
    }

    /// A node that performs everything itself, without workers or peers.
    pub fn standalone() -> Self {
        Self {
            use_worker_pool: false,
            ..Default::default()
        }
    }

    pub fn with_worker_listener(mut self, addr: SocketAddr) -> Self {
        self.worker_listen_addr = Some(addr);
        self
    }

    pub fn with_max_load_per_worker(mut self, max: Weight) -> Self {
        self.max_load_per_worker = max;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disable_work_processing = true;
        self
    }

    /// Port advertised in `NODE_INFO`; 0 when not listening for peers.
    pub fn port(&self) -> u16 {
        self.listen_addr.map(|a| a.port()).unwrap_or(0)
    }
}
