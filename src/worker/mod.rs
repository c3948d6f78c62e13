//! Local worker processes and their controller.
//!
//! A node's controller accepts connections from worker processes and hands
//! them claimed jobs; the workers run the jobs against the shared database.
//!
//! # Components
//!
//! - [`WorkerPool`]: controller side; tracks per-worker load and picks the
//!   least loaded worker for each job
//! - [`WorkerResponder`]: controller side; registers workers as they connect
//!   and handles their `EnqueuedJob` notifications
//! - [`ControllerConnection`]: worker side; performs `PerformJob` requests and
//!   notifies the controller of work it enqueues
//!
//! # Load accounting
//!
//! A job's weight is charged to its worker when it is sent and released when
//! the worker acknowledges it, whether the job succeeded or not. A worker
//! with load at or above `max_load_per_worker` is not offered more work.

pub mod controller;
pub mod pool;

pub use controller::ControllerConnection;
pub use pool::{WorkerConnection, WorkerPool, WorkerResponder};
