//! Data sources the export reads key ranges from.
//!
//! A source answers three questions: how many rows the table holds, which
//! columns it has, and which rows fall inside an inclusive key range. Range
//! queries are issued concurrently by every worker, so implementations must be
//! safe to share behind an `Arc`.

mod memory;
mod postgres;

pub use memory::MemorySource;
pub use postgres::{quote_ident, range_query, PostgresSource};

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// One source row with every value rendered as text. `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// Stream of rows produced by a range query.
pub type RowStream = BoxStream<'static, Result<Row>>;

/// A queryable table keyed by a dense ordinal column.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Total number of rows in the table.
    async fn row_count(&self) -> Result<u64>;

    /// Column names in select order.
    async fn columns(&self) -> Result<Vec<String>>;

    /// Rows whose key lies in `[start, end]`, in the order the source returns them.
    async fn fetch_range(&self, start: u64, end: u64) -> Result<RowStream>;
}
