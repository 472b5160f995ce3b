//! Per-chunk failure taxonomy.
//!
//! Startup and configuration problems surface as `anyhow::Error` and abort the
//! run. Anything that goes wrong while extracting a single chunk is captured as
//! a [`ChunkError`] and travels back to the controller inside the chunk's
//! completion signal, so one bad range never takes down the rest of the export.

use serde::Serialize;
use thiserror::Error;

/// Coarse classification of a chunk failure, used for summaries and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Query,
    Serialization,
    Artifact,
    WorkerLost,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::Query => "query",
            FailureKind::Serialization => "serialization",
            FailureKind::Artifact => "artifact",
            FailureKind::WorkerLost => "worker lost",
        };
        f.write_str(name)
    }
}

/// Error raised while extracting one chunk.
#[derive(Debug, Clone, Error)]
pub enum ChunkError {
    /// Building or executing the range query failed, including failures while
    /// streaming rows back.
    #[error("Query failed: {0}")]
    Query(String),

    /// A row could not be rendered into a record.
    #[error("Row {row} could not be serialized: {message}")]
    Serialization { row: u64, message: String },

    /// The output artifact could not be created, written or persisted.
    #[error("Artifact {path}: {message}")]
    Artifact { path: String, message: String },

    /// The worker handling the chunk stopped without reporting back.
    #[error("Worker stopped before reporting the chunk")]
    WorkerLost,
}

impl ChunkError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ChunkError::Query(_) => FailureKind::Query,
            ChunkError::Serialization { .. } => FailureKind::Serialization,
            ChunkError::Artifact { .. } => FailureKind::Artifact,
            ChunkError::WorkerLost => FailureKind::WorkerLost,
        }
    }

    /// Only query failures are worth another attempt; the others are
    /// deterministic for a given chunk.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChunkError::Query(_))
    }

    pub(crate) fn query(err: impl std::fmt::Display) -> Self {
        ChunkError::Query(format!("{:#}", err))
    }

    pub(crate) fn artifact(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        ChunkError::Artifact {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_kinds() {
        assert_eq!(ChunkError::Query("x".into()).kind(), FailureKind::Query);
        assert_eq!(
            ChunkError::Serialization { row: 1, message: "x".into() }.kind(),
            FailureKind::Serialization
        );
        assert_eq!(
            ChunkError::artifact(Path::new("a.csv"), "disk full").kind(),
            FailureKind::Artifact
        );
        assert_eq!(ChunkError::WorkerLost.kind(), FailureKind::WorkerLost);
    }

    #[test]
    fn test_only_query_errors_retry() {
        assert!(ChunkError::Query("timeout".into()).is_retryable());
        assert!(!ChunkError::Serialization { row: 3, message: "null".into() }.is_retryable());
        assert!(!ChunkError::artifact(Path::new("a.csv"), "exists").is_retryable());
        assert!(!ChunkError::WorkerLost.is_retryable());
    }

    #[test]
    fn test_messages_carry_cause() {
        let err = ChunkError::Serialization { row: 7, message: "expected 3 columns, got 2".into() };
        let msg = err.to_string();
        assert!(msg.contains("Row 7"));
        assert!(msg.contains("expected 3 columns"));

        let err = ChunkError::artifact(Path::new("out/Ch0.csv"), "permission denied");
        assert!(err.to_string().contains("out/Ch0.csv"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&FailureKind::WorkerLost).unwrap();
        assert_eq!(json, "\"worker_lost\"");
    }
}
