//! App - application layer.
//!
//! Combines the ports into the running worker process.
//!
//! # Components
//! - **AppBuilder**: wiring plus fail-fast startup checks
//! - **WorkerLoop**: claim → generate → persist → complete/fail
//! - **ResultWriter**: writes assets, builds the task result, commits
//! - **ReaperLoop**: redelivers stale stream claims
//! - **IdleBackoff**: wait between iterations

pub mod backoff;
pub mod builder;
pub mod reaper_loop;
pub mod result_writer;
mod shutdown;
pub mod status;
pub mod worker_loop;

pub use self::backoff::IdleBackoff;
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::reaper_loop::ReaperLoop;
pub use self::result_writer::ResultWriter;
pub use self::status::QueueCounts;
pub use self::worker_loop::{WorkerExit, WorkerLoop, WorkerReport, WorkerSettings};
