//! Work distribution and completion tracking.
//!
//! The controller feeds every chunk of the partition plan into a bounded work
//! queue shared by a fixed pool of workers, closes the queue, and then waits
//! for one completion signal per chunk.

use crate::config::ProcessingConfig;
use crate::error::ChunkError;
use crate::pipeline::summary::{ChunkOutcome, CompletionSignal, RunSummary};
use crate::pipeline::worker::{run_worker, ChunkExtractor};
use crate::pipeline::{Metrics, MetricsReporter};
use crate::plan::{Chunk, PartitionPlan};
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Configuration for the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of extraction workers
    pub workers: usize,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save the run summary JSON after the run completes
    pub summary_output_path: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 6,
            enable_metrics: true,
            metrics_interval_secs: 10,
            summary_output_path: None,
        }
    }
}

impl From<&ProcessingConfig> for ControllerConfig {
    fn from(processing: &ProcessingConfig) -> Self {
        Self {
            workers: processing.workers,
            enable_metrics: processing.enable_metrics,
            metrics_interval_secs: processing.metrics_interval_secs,
            summary_output_path: processing.summary_output_path.clone(),
        }
    }
}

/// Orchestrates a run over a partition plan.
pub struct Controller {
    /// Shared chunk extractor
    extractor: Arc<ChunkExtractor>,

    /// Metrics
    metrics: Arc<Metrics>,

    /// Configuration
    config: ControllerConfig,
}

impl Controller {
    /// Create a new controller.
    pub fn new(extractor: Arc<ChunkExtractor>, metrics: Arc<Metrics>, config: ControllerConfig) -> Self {
        Self {
            extractor,
            metrics,
            config,
        }
    }

    /// Extract every chunk of the plan and return the run summary.
    pub async fn run(&self, plan: &PartitionPlan) -> Result<RunSummary> {
        let started = Instant::now();
        let workers = self.config.workers.max(1);
        let total_chunks = plan.len();
        let mut summary = RunSummary::new(plan, workers);

        if plan.is_empty() {
            tracing::info!("Partition plan is empty, nothing to extract");
            summary.set_elapsed(started.elapsed());
            return Ok(summary);
        }

        tracing::info!(
            "Scheduling {} chunks for extraction ({} workers)",
            total_chunks,
            workers
        );

        // Start metrics reporter if enabled
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                total_chunks as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        // Both channels hold the whole plan, so neither side blocks on capacity.
        let (work_tx, work_rx) = async_channel::bounded::<Chunk>(total_chunks);
        let (done_tx, mut done_rx) = mpsc::channel::<CompletionSignal>(total_chunks);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 1..=workers {
            handles.push(tokio::spawn(run_worker(
                worker_id,
                self.extractor.clone(),
                work_rx.clone(),
                done_tx.clone(),
            )));
        }
        drop(work_rx);
        drop(done_tx);

        for chunk in plan.iter() {
            if work_tx.send(*chunk).await.is_err() {
                tracing::error!("All workers stopped before the work queue was loaded");
                break;
            }
        }
        work_tx.close();
        tracing::debug!("Work queue loaded and closed");

        let mut reported = vec![false; total_chunks];
        for _ in 0..total_chunks {
            match done_rx.recv().await {
                Some(signal) => {
                    reported[signal.chunk.index] = true;
                    summary.record(&signal);
                }
                None => break,
            }
        }

        // Chunks whose worker died never produced a signal.
        for chunk in plan.iter().filter(|c| !reported[c.index]) {
            tracing::error!("No completion signal for chunk {}", chunk);
            self.metrics.add_chunk_failed();
            summary.record(&CompletionSignal {
                chunk: *chunk,
                worker: 0,
                outcome: ChunkOutcome::Failed {
                    error: ChunkError::WorkerLost,
                    attempts: 0,
                },
            });
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Worker task ended abnormally: {}", e);
            }
        }

        // Shutdown metrics reporter
        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        summary.set_elapsed(started.elapsed());

        if let Some(ref path) = self.config.summary_output_path {
            if let Err(e) = summary.save_to_file(path) {
                tracing::warn!("Failed to save run summary to {}: {}", path, e);
            }
        }

        Ok(summary)
    }
}
