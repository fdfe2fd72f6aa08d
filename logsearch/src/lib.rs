//! Distributed log search.
//!
//! A task group fans one search request out to many nodes. Each task streams the
//! node's matching log lines into a zip bundle under the scratch directory and
//! keeps the first lines as a preview in the local database.

pub mod download;
pub mod merger;
pub mod metrics_defs;
pub mod model;
pub mod rpc;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use model::{SearchLogRequest, Target, Task, TaskGroup};
pub use rpc::{GrpcLogStreamClient, LogStreamClient};
pub use scheduler::{Scheduler, SchedulerError};
pub use store::TaskStore;
