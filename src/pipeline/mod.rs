//! Concurrent extraction of a partition plan.

mod controller;
mod metrics;
mod summary;
mod worker;


pub use controller::{Controller, ControllerConfig};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use summary::{ChunkFailure, ChunkOutcome, CompletionSignal, RunSummary};
pub use worker::{run_worker, ChunkExtractor};
