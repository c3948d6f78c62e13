//! Commands exchanged between nodes and their workers.
//!
//! Connections are symmetric: either side may send a [`Command`] and wait for
//! its empty acknowledgement. Inbound commands are handed to a [`Responder`].
//!
//! | Command        | Sent by                     | Meaning                             |
//! |----------------|-----------------------------|-------------------------------------|
//! | `IdentifyNode` | connecting node             | who is on the other end             |
//! | `ReportLoad`   | every node, periodically    | total outstanding job weight        |
//! | `PerformJob`   | controller, or peer node    | run this job; ack when done         |
//! | `EnqueuedJob`  | worker                      | new work exists, poll now           |

pub mod codec;
pub mod connection;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::JobDescriptor;

pub use connection::{connect, serve, Connection};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    IdentifyNode { host: String, port: u16 },
    ReportLoad { load: i64 },
    PerformJob { job: JobDescriptor },
    EnqueuedJob,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::IdentifyNode { .. } => "IdentifyNode",
            Command::ReportLoad { .. } => "ReportLoad",
            Command::PerformJob { .. } => "PerformJob",
            Command::EnqueuedJob => "EnqueuedJob",
        }
    }
}

/// The calling half of a connection.
#[async_trait]
pub trait RemoteCall: Send + Sync {
    fn id(&self) -> Uuid;

    /// Send `command` and wait for the other side to acknowledge it.
    async fn call(&self, command: Command) -> Result<()>;
}

/// The answering half of a connection.
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    /// Called once, before any command from `conn` is handled.
    async fn connected(&self, _conn: &Arc<Connection>) {}

    async fn respond(&self, conn: &Arc<Connection>, command: Command) -> Result<()>;

    /// Called once the connection has closed and pending calls have failed.
    async fn disconnected(&self, _conn: &Arc<Connection>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format() {
        let cmd = Command::PerformJob {
            job: JobDescriptor {
                job_id: 7,
                weight: 5,
                work_type: "DUMMY_WORK".to_string(),
            },
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["command"], "perform_job");
        assert_eq!(json["job"]["job_id"], 7);

        let back: Command = serde_json::from_value(json).unwrap();
        assert_eq!(back, cmd);
        assert_eq!(back.name(), "PerformJob");
    }

    #[test]
    fn unit_command_round_trips() {
        let json = serde_json::to_string(&Command::EnqueuedJob).unwrap();
        assert_eq!(json, r#"{"command":"enqueued_job"}"#);
    }
}
