//! Throughput monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for an export run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Rows written to artifacts
    pub rows_written: AtomicU64,

    /// Bytes written to artifacts
    pub bytes_written: AtomicU64,

    /// Chunks whose artifact was persisted
    pub chunks_succeeded: AtomicU64,

    /// Chunks that failed after all attempts
    pub chunks_failed: AtomicU64,

    /// Query attempts that were retried
    pub retries: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    /// Time spent waiting for range queries to start returning (microseconds)
    pub query_us: AtomicU64,

    /// Time spent streaming rows into artifacts (microseconds)
    pub transfer_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record a persisted artifact.
    pub fn add_chunk_succeeded(&self, rows: u64, bytes: u64) {
        self.chunks_succeeded.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a failed chunk.
    pub fn add_chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retried attempt.
    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_query_time(&self, duration: Duration) {
        self.query_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_transfer_time(&self, duration: Duration) {
        self.transfer_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Rows written per second.
    pub fn rows_per_second(&self) -> f64 {
        let rows = self.rows_written.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            rows as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rows_written: self.rows_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            chunks_succeeded: self.chunks_succeeded.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            rows_per_second: self.rows_per_second(),
            query_secs: self.query_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            transfer_secs: self.transfer_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub rows_written: u64,
    pub bytes_written: u64,
    pub chunks_succeeded: u64,
    pub chunks_failed: u64,
    pub retries: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub rows_per_second: f64,
    /// Total time waiting on range queries (seconds, summed across workers)
    pub query_secs: f64,
    /// Total time streaming rows to disk (seconds, summed across workers)
    pub transfer_secs: f64,
}

impl MetricsSnapshot {
    /// Chunks that reached a final outcome.
    pub fn chunks_done(&self) -> u64 {
        self.chunks_succeeded + self.chunks_failed
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunks: {} ok, {} failed | Rows: {} @ {:.0} rows/s | Written: {:.2} MB | \
             Retries: {} | Elapsed: {:.1}s",
            self.chunks_succeeded,
            self.chunks_failed,
            self.rows_written,
            self.rows_per_second,
            self.bytes_written as f64 / (1024.0 * 1024.0),
            self.retries,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_chunks: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_chunks: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_chunks,
        }
    }

    fn progress(&self, snapshot: &MetricsSnapshot) -> f64 {
        if self.total_chunks > 0 {
            snapshot.chunks_done() as f64 / self.total_chunks as f64 * 100.0
        } else {
            0.0
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("[{:.1}%] {}", self.progress(&snapshot), snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }
}
