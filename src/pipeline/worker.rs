//! Extraction workers.
//!
//! A worker repeatedly takes a chunk from the shared work queue, streams the
//! chunk's key range from the source into a fresh artifact and reports the
//! outcome on the completion channel. The query stream and the artifact are
//! both released before the next chunk is taken.

use crate::config::{IfExists, OutputConfig, RetryConfig};
use crate::error::ChunkError;
use crate::io::{artifact_name, ArtifactStats, ArtifactWriter, RecordFormat};
use crate::pipeline::summary::{ChunkOutcome, CompletionSignal};
use crate::pipeline::Metrics;
use crate::plan::Chunk;
use crate::source::RangeSource;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Extracts single chunks from a source into artifacts.
pub struct ChunkExtractor {
    /// Shared data source
    source: Arc<dyn RangeSource>,

    /// Record rendering rules
    format: RecordFormat,

    /// Artifact directory
    directory: PathBuf,

    /// Artifact name template
    name_template: String,

    /// Policy for pre-existing artifacts
    if_exists: IfExists,

    /// Retry policy for query failures
    retry: RetryConfig,

    /// Metrics collector
    metrics: Arc<Metrics>,
}

impl ChunkExtractor {
    /// Create a new chunk extractor.
    pub fn new(
        source: Arc<dyn RangeSource>,
        format: RecordFormat,
        output: &OutputConfig,
        retry: RetryConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            format,
            directory: output.directory.clone(),
            name_template: output.name_template.clone(),
            if_exists: output.if_exists,
            retry,
            metrics,
        }
    }

    /// Final path of a chunk's artifact.
    pub fn artifact_path(&self, chunk: &Chunk) -> PathBuf {
        self.directory.join(artifact_name(&self.name_template, chunk))
    }

    /// Run a single extraction attempt for a chunk.
    pub async fn extract(&self, chunk: &Chunk) -> Result<ArtifactStats, ChunkError> {
        let name = artifact_name(&self.name_template, chunk);

        if self.if_exists == IfExists::Reject {
            let path = self.directory.join(&name);
            if path.exists() {
                return Err(ChunkError::artifact(&path, "already exists"));
            }
        }

        let query_start = Instant::now();
        let mut rows = self
            .source
            .fetch_range(chunk.start, chunk.end)
            .await
            .map_err(ChunkError::query)?;
        self.metrics.add_query_time(query_start.elapsed());

        let mut writer = ArtifactWriter::create(&self.directory, &name, &self.format, self.if_exists)?;

        let transfer_start = Instant::now();
        while let Some(item) = rows.next().await {
            let written = item
                .map_err(ChunkError::query)
                .and_then(|row| writer.write_row(&row));
            if let Err(e) = written {
                writer.discard();
                return Err(e);
            }
        }
        drop(rows);

        let stats = writer.finish()?;
        self.metrics.add_transfer_time(transfer_start.elapsed());

        Ok(stats)
    }

    /// Extract a chunk, retrying query failures with exponential backoff.
    pub async fn extract_with_retry(&self, chunk: &Chunk) -> ChunkOutcome {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut backoff = self.retry.initial_backoff_ms;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.extract(chunk).await {
                Ok(stats) => {
                    return ChunkOutcome::Succeeded {
                        rows: stats.rows,
                        bytes: stats.bytes,
                        artifact: stats.path,
                        attempts: attempt,
                    }
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        "Chunk {} attempt {} failed: {}, retrying in {}ms",
                        chunk,
                        attempt,
                        e,
                        backoff
                    );
                    self.metrics.add_retry();
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = next_backoff(backoff, self.retry.max_backoff_ms);
                }
                Err(e) => {
                    tracing::error!("Chunk {} failed after {} attempt(s): {}", chunk, attempt, e);
                    return ChunkOutcome::Failed { error: e, attempts: attempt };
                }
            }
        }
    }
}

fn next_backoff(current_ms: u64, max_ms: u64) -> u64 {
    current_ms.saturating_mul(2).min(max_ms)
}

/// Worker loop: drain the work queue until it is empty and closed.
///
/// Exactly one completion signal is sent per chunk received.
pub async fn run_worker(
    worker_id: usize,
    extractor: Arc<ChunkExtractor>,
    work_rx: async_channel::Receiver<Chunk>,
    done_tx: mpsc::Sender<CompletionSignal>,
) {
    tracing::debug!("Worker {} started", worker_id);
    let mut processed = 0usize;

    while let Ok(chunk) = work_rx.recv().await {
        tracing::debug!(
            "Worker {} starting chunk {} -> {}",
            worker_id,
            chunk,
            extractor.artifact_path(&chunk).display()
        );

        let outcome = extractor.extract_with_retry(&chunk).await;
        match &outcome {
            ChunkOutcome::Succeeded { rows, bytes, artifact, .. } => {
                extractor.metrics.add_chunk_succeeded(*rows, *bytes);
                tracing::debug!(
                    "Worker {} finished chunk {}: {} rows -> {}",
                    worker_id,
                    chunk,
                    rows,
                    artifact.display()
                );
            }
            ChunkOutcome::Failed { .. } => extractor.metrics.add_chunk_failed(),
        }
        processed += 1;

        let signal = CompletionSignal { chunk, worker: worker_id, outcome };
        if done_tx.send(signal).await.is_err() {
            tracing::debug!("Completion receiver dropped, stopping worker {}", worker_id);
            break;
        }
    }

    tracing::debug!("Worker {} exiting after {} chunks", worker_id, processed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::source::MemorySource;
    use std::fs;
    use tempfile::TempDir;

    fn extractor(source: MemorySource, dir: &TempDir, output: OutputConfig) -> (ChunkExtractor, Arc<Metrics>) {
        let output = OutputConfig {
            directory: dir.path().to_path_buf(),
            ..output
        };
        let format = RecordFormat::new(&output, 3);
        let retry = RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        };
        let metrics = Metrics::new();
        (
            ChunkExtractor::new(Arc::new(source), format, &output, retry, metrics.clone()),
            metrics,
        )
    }

    fn chunk(index: usize, start: u64, end: u64) -> Chunk {
        Chunk { index, start, end }
    }

    #[tokio::test]
    async fn test_extract_writes_one_line_per_row() {
        let dir = TempDir::new().unwrap();
        let (extractor, _) = extractor(MemorySource::generated(20, 2, 3), &dir, OutputConfig::default());

        let stats = extractor.extract(&chunk(1, 11, 20)).await.unwrap();
        assert_eq!(stats.rows, 20);
        assert_eq!(stats.path, dir.path().join("Ch1_ExportingRows_11_20.csv"));

        let content = fs::read_to_string(&stats.path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 20);
        assert!(lines.iter().all(|l| l.matches(';').count() == 2));
        assert!(lines[0].starts_with("11;"));
        assert!(lines[19].starts_with("20;"));
    }

    #[tokio::test]
    async fn test_empty_range_writes_empty_artifact() {
        let dir = TempDir::new().unwrap();
        let (extractor, _) = extractor(MemorySource::generated(5, 1, 3), &dir, OutputConfig::default());

        let stats = extractor.extract(&chunk(3, 100, 110)).await.unwrap();
        assert_eq!(stats.rows, 0);
        assert_eq!(fs::read_to_string(&stats.path).unwrap(), "");
    }

    #[tokio::test]
    async fn test_query_failure_leaves_no_artifact() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::generated(10, 1, 3).fail_on_key(5);
        let (extractor, metrics) = extractor(source, &dir, OutputConfig::default());
        let c = chunk(0, 1, 10);

        let outcome = extractor.extract_with_retry(&c).await;
        match outcome {
            ChunkOutcome::Failed { error, attempts } => {
                assert_eq!(error.kind(), FailureKind::Query);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(metrics.snapshot().retries, 2);
        assert!(!extractor.artifact_path(&c).exists());
    }

    #[tokio::test]
    async fn test_mid_stream_failure_discards_partial_rows() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::generated(10, 1, 3).fail_on_key_after_rows(1, 4);
        let (extractor, _) = extractor(source, &dir, OutputConfig::default());
        let c = chunk(0, 1, 10);

        let err = extractor.extract(&c).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Query);
        assert!(!extractor.artifact_path(&c).exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::generated(10, 1, 3).fail_on_key_times(2, 1);
        let (extractor, _) = extractor(source, &dir, OutputConfig::default());

        let outcome = extractor.extract_with_retry(&chunk(0, 1, 10)).await;
        match outcome {
            ChunkOutcome::Succeeded { rows, attempts, .. } => {
                assert_eq!(rows, 10);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_serialization_failure_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let mut source = MemorySource::generated(10, 1, 3);
        source.insert(4, vec![Some("4".to_string()), None, Some("x".to_string())]);
        let output = OutputConfig {
            reject_nulls: true,
            ..OutputConfig::default()
        };
        let (extractor, metrics) = extractor(source, &dir, output);
        let c = chunk(0, 1, 10);

        let outcome = extractor.extract_with_retry(&c).await;
        match outcome {
            ChunkOutcome::Failed { error, attempts } => {
                assert_eq!(error.kind(), FailureKind::Serialization);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(metrics.snapshot().retries, 0);
        assert!(!extractor.artifact_path(&c).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_doubles_up_to_cap() {
        let dir = TempDir::new().unwrap();
        let output = OutputConfig {
            directory: dir.path().to_path_buf(),
            ..OutputConfig::default()
        };
        let retry = RetryConfig {
            max_attempts: 4,
            initial_backoff_ms: 1000,
            max_backoff_ms: 1500,
        };
        let source = MemorySource::generated(10, 1, 3).fail_on_key(1);
        let extractor = ChunkExtractor::new(
            Arc::new(source),
            RecordFormat::new(&output, 3),
            &output,
            retry,
            Metrics::new(),
        );

        let started = tokio::time::Instant::now();
        let outcome = extractor.extract_with_retry(&chunk(0, 1, 10)).await;
        assert_eq!(outcome.attempts(), 4);
        // 1000 + 1500 + 1500
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(4000));
        assert!(waited < Duration::from_millis(4100));
    }

    #[test]
    fn test_next_backoff_saturates() {
        assert_eq!(next_backoff(100, 10_000), 200);
        assert_eq!(next_backoff(8_000, 10_000), 10_000);
        assert_eq!(next_backoff(u64::MAX, u64::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_reject_skips_query_when_artifact_exists() {
        let dir = TempDir::new().unwrap();
        let output = OutputConfig {
            directory: dir.path().to_path_buf(),
            if_exists: IfExists::Reject,
            ..OutputConfig::default()
        };
        let source = Arc::new(MemorySource::generated(10, 1, 3));
        let extractor = ChunkExtractor::new(
            source.clone(),
            RecordFormat::new(&output, 3),
            &output,
            RetryConfig::default(),
            Metrics::new(),
        );
        let c = chunk(0, 1, 10);
        fs::write(extractor.artifact_path(&c), "previous\n").unwrap();

        let err = extractor.extract(&c).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Artifact);
        assert_eq!(source.query_count(), 0);
        assert_eq!(fs::read_to_string(extractor.artifact_path(&c)).unwrap(), "previous\n");
    }

    #[tokio::test]
    async fn test_worker_acknowledges_every_chunk() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::generated(30, 1, 3).fail_on_key(15);
        let (extractor, _) = extractor(source, &dir, OutputConfig::default());

        let (work_tx, work_rx) = async_channel::bounded(3);
        let (done_tx, mut done_rx) = mpsc::channel(3);
        for c in [chunk(0, 1, 10), chunk(1, 11, 20), chunk(2, 21, 30)] {
            work_tx.send(c).await.unwrap();
        }
        work_tx.close();

        run_worker(7, Arc::new(extractor), work_rx, done_tx).await;

        let mut signals = Vec::new();
        while let Some(signal) = done_rx.recv().await {
            signals.push(signal);
        }
        assert_eq!(signals.len(), 3);
        assert!(signals.iter().all(|s| s.worker == 7));
        assert_eq!(signals.iter().filter(|s| s.outcome.is_success()).count(), 2);
        assert!(!signals[1].outcome.is_success());
    }
}
