//! Execution engine for the anomaly workloads.
//!
//! Three layers:
//!
//! - [`runner::TransactionRunner`] wraps one unit of transactional work
//!   in the retry-with-backoff discipline every resilient SQL client
//!   needs against a serializable store.
//! - [`scheduler::IterationScheduler`] drives a fixed worker pool
//!   through N iterations of a protocol and harvests per-iteration
//!   results as they complete.
//! - [`workload`] holds the five anomaly protocols themselves, each a
//!   [`workload::Workload`] with its own post-run verification.

pub mod export;
pub mod runner;
pub mod scheduler;
pub mod stats;
pub mod workload;

pub use export::{Exporter, NullExporter};
pub use runner::{RetryPolicy, TransactionRunner};
pub use scheduler::{IterationScheduler, Progress, WorkloadOutcome};
pub use stats::LatencySummary;
pub use workload::{instantiate, Verification, Workload};
