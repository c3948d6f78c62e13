use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row of `NODE_INFO`: one per node process sharing the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub hostname: String,
    pub port: u16,
    pub pid: u32,
    pub last_seen: DateTime<Utc>,
}

impl NodeInfo {
    pub fn new(hostname: impl Into<String>, port: u16, last_seen: DateTime<Utc>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            pid: std::process::id(),
            last_seen,
        }
    }

    /// True when this row describes the node at `hostname:port`.
    pub fn is(&self, hostname: &str, port: u16) -> bool {
        self.hostname == hostname && self.port == port
    }
}
