//! Job and work records and their lifecycle.
//!
//! - [`job`]: the `JOB` row and its bookkeeping (assign, overdue, failure backoff)
//! - [`work`]: work rows, the [`WorkItem`] trait and the per-type [`WorkPolicy`]
//! - [`registry`]: maps `workType` strings to handlers
//! - [`queue`]: [`JobQueue`], which creates, claims and runs jobs
//! - [`timer`]: [`PollTimer`], the poll loop's backoff clock

pub mod job;
pub mod node_info;
pub mod queue;
pub mod registry;
pub mod timer;
pub mod work;

pub use job::{Failure, JobDescriptor, JobId, JobRecord, Priority, Weight};
pub use node_info::NodeInfo;
pub use queue::{JobQueue, WorkHistogram};
pub use registry::WorkRegistry;
pub use timer::PollTimer;
pub use work::{NewWork, WorkContext, WorkItem, WorkPolicy, WorkProposal, WorkRecord};
