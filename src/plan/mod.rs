//! Partition planning for the key span.

mod partition;

pub use partition::{key_span, partition, Chunk, PartitionPlan};
