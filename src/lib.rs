//! A distributed job queue backed by a shared transactional database.
//!
//! Work is written as a `JOB` row plus a payload row in the caller's
//! transaction. Every node polls `JOB`, claims due rows under row locks, and
//! hands them to its local worker processes, an idle peer node, or itself.

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod performer;
pub mod queuer;
pub mod rpc;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use config::{NodeConfig, QueueConfig};
pub use error::{LockConflict, QueueError, Result};
pub use node::NodeCoordinator;
pub use queuer::{LocalQueuer, NonPerformingQueuer, Queuer};
pub use scheduler::{JobQueue, NewWork, WorkContext, WorkItem, WorkPolicy, WorkRecord, WorkRegistry};
pub use store::{MemoryStore, Store, Transaction};
