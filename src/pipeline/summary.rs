//! Completion signals and the run summary built from them.

use crate::error::{ChunkError, FailureKind};
use crate::plan::{Chunk, PartitionPlan};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Result of extracting one chunk.
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// The artifact was persisted.
    Succeeded {
        rows: u64,
        bytes: u64,
        artifact: PathBuf,
        attempts: usize,
    },

    /// The chunk was abandoned; no artifact was left behind.
    Failed { error: ChunkError, attempts: usize },
}

impl ChunkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ChunkOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> usize {
        match self {
            ChunkOutcome::Succeeded { attempts, .. } | ChunkOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Acknowledgement sent by a worker for every chunk it receives.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    pub chunk: Chunk,
    /// 1-based worker id; 0 when the controller fills in for a lost worker
    pub worker: usize,
    pub outcome: ChunkOutcome,
}

/// A failed chunk as reported in the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub kind: FailureKind,
    pub cause: String,
    pub attempts: usize,
}

/// Aggregate outcome of an export run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub span: u64,
    pub chunk_size: u64,
    pub workers: usize,
    pub chunks_attempted: usize,
    pub chunks_succeeded: usize,
    pub chunks_failed: usize,
    pub rows_written: u64,
    pub bytes_written: u64,
    pub elapsed_secs: f64,
    pub failures: Vec<ChunkFailure>,
}

impl RunSummary {
    pub fn new(plan: &PartitionPlan, workers: usize) -> Self {
        Self {
            span: plan.span(),
            chunk_size: plan.chunk_size(),
            workers,
            ..Default::default()
        }
    }

    /// Fold one completion signal into the summary.
    pub fn record(&mut self, signal: &CompletionSignal) {
        self.chunks_attempted += 1;
        match &signal.outcome {
            ChunkOutcome::Succeeded { rows, bytes, .. } => {
                self.chunks_succeeded += 1;
                self.rows_written += rows;
                self.bytes_written += bytes;
            }
            ChunkOutcome::Failed { error, attempts } => {
                self.chunks_failed += 1;
                self.failures.push(ChunkFailure {
                    index: signal.chunk.index,
                    start: signal.chunk.start,
                    end: signal.chunk.end,
                    kind: error.kind(),
                    cause: error.to_string(),
                    attempts: *attempts,
                });
            }
        }
    }

    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed_secs = elapsed.as_secs_f64();
    }

    /// True when every chunk was extracted.
    pub fn is_success(&self) -> bool {
        self.chunks_failed == 0
    }

    /// Save the summary to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Run summary saved to {}", path);
        Ok(())
    }

    /// Print a human-readable report.
    pub fn print_report(&self) {
        println!("\n=== Export Summary ===");
        println!("Key span: [1, {}] in chunks of {}", self.span, self.chunk_size);
        println!("Workers: {}", self.workers);
        println!("Chunks attempted: {}", self.chunks_attempted);
        println!("Chunks succeeded: {}", self.chunks_succeeded);
        println!("Chunks failed: {}", self.chunks_failed);
        println!("Rows written: {}", self.rows_written);
        println!(
            "Data written: {:.2} MB",
            self.bytes_written as f64 / (1024.0 * 1024.0)
        );
        println!("Total time: {:.1}s", self.elapsed_secs);

        if !self.failures.is_empty() {
            println!("\n--- Failed Chunks ---");
            let mut failures = self.failures.clone();
            failures.sort_by_key(|f| f.index);
            for failure in &failures {
                println!(
                    "#{} [{}, {}] {} after {} attempt(s): {}",
                    failure.index,
                    failure.start,
                    failure.end,
                    failure.kind,
                    failure.attempts,
                    failure.cause
                );
            }
        }
        println!("======================\n");
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Succeeded: {}, Failed: {}, Attempted: {}, Rows: {}",
            self.chunks_succeeded, self.chunks_failed, self.chunks_attempted, self.rows_written
        )
    }
}
