//! Divide the key span into contiguous, fixed-size chunks.

use anyhow::Result;
use serde::Serialize;

/// A contiguous, inclusive key range assigned to one output artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Chunk {
    /// Position in the partition plan (0-based)
    pub index: usize,

    /// First key in the range (inclusive)
    pub start: u64,

    /// Last key in the range (inclusive)
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl Chunk {
    /// Number of keys covered by this chunk.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Check whether a key falls inside this chunk.
    pub fn contains(&self, key: u64) -> bool {
        key >= self.start && key <= self.end
    }
}

impl std::fmt::Display for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} [{}, {}]", self.index, self.start, self.end)
    }
}

/// Ordered, gap-free sequence of chunks covering `[1, span]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    span: u64,
    chunk_size: u64,
    chunks: Vec<Chunk>,
}

impl PartitionPlan {
    /// Total key span covered by the plan.
    pub fn span(&self) -> u64 {
        self.span
    }

    /// Maximum number of keys per chunk.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> + '_ {
        self.chunks.iter()
    }

    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }
}

impl std::fmt::Display for PartitionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} chunks of up to {} keys covering [1, {}]",
            self.chunks.len(),
            self.chunk_size,
            self.span
        )
    }
}

/// Partition `[1, span]` into chunks of `chunk_size` keys.
///
/// Every chunk but the last holds exactly `chunk_size` keys; the last one ends
/// at `span` and may be shorter. A zero span yields an empty plan.
///
/// # Errors
/// Returns an error if `chunk_size` is zero.
pub fn partition(span: u64, chunk_size: u64) -> Result<PartitionPlan> {
    if chunk_size == 0 {
        anyhow::bail!("Chunk size must be > 0");
    }

    let full_chunks = span / chunk_size;
    let has_tail = span % chunk_size != 0;
    let count = full_chunks as usize + usize::from(has_tail);

    let mut chunks = Vec::with_capacity(count);
    for i in 0..full_chunks {
        chunks.push(Chunk {
            index: i as usize,
            start: i * chunk_size + 1,
            end: (i + 1) * chunk_size,
        });
    }

    if has_tail {
        chunks.push(Chunk {
            index: full_chunks as usize,
            start: full_chunks * chunk_size + 1,
            end: span,
        });
    }

    Ok(PartitionPlan {
        span,
        chunk_size,
        chunks,
    })
}

/// Derive the key span from a row count and the number of rows stored per key.
pub fn key_span(row_count: u64, rows_per_key: u64) -> Result<u64> {
    if rows_per_key == 0 {
        anyhow::bail!("rows_per_key must be > 0");
    }
    Ok(row_count.div_ceil(rows_per_key))
}
