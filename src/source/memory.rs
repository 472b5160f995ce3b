//! In-memory source, used for tests and for embedding the exporter over data
//! that is already loaded.

use super::{RangeSource, Row, RowStream};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A table held in memory, keyed by its ordinal column.
///
/// Several rows may share a key. Failures can be injected for any range that
/// overlaps a given key, either when the query starts or after some rows have
/// already been streamed.
pub struct MemorySource {
    columns: Vec<String>,
    rows: BTreeMap<u64, Vec<Row>>,
    failures: Vec<InjectedFailure>,
    queries: Mutex<Vec<(u64, u64)>>,
    query_count: AtomicUsize,
}

struct InjectedFailure {
    key: u64,
    remaining: Option<AtomicUsize>,
    after_rows: Option<usize>,
}

impl MemorySource {
    /// Create an empty source with the given columns.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: BTreeMap::new(),
            failures: Vec::new(),
            queries: Mutex::new(Vec::new()),
            query_count: AtomicUsize::new(0),
        }
    }

    /// Build a source with `keys` keys and `rows_per_key` rows each. Row
    /// values are `<key>`, `<key>-<n>-c1`, `<key>-<n>-c2`, ...
    pub fn generated(keys: u64, rows_per_key: usize, num_columns: usize) -> Self {
        let columns = (0..num_columns).map(|i| format!("c{}", i)).collect();
        let mut source = Self::new(columns);
        for key in 1..=keys {
            for n in 0..rows_per_key {
                let row = (0..num_columns)
                    .map(|c| {
                        if c == 0 {
                            Some(key.to_string())
                        } else {
                            Some(format!("{}-{}-c{}", key, n, c))
                        }
                    })
                    .collect();
                source.insert(key, row);
            }
        }
        source
    }

    /// Add a row under `key`.
    pub fn insert(&mut self, key: u64, row: Row) {
        self.rows.entry(key).or_default().push(row);
    }

    /// Make every query whose range covers `key` fail before returning rows.
    pub fn fail_on_key(mut self, key: u64) -> Self {
        self.failures.push(InjectedFailure { key, remaining: None, after_rows: None });
        self
    }

    /// Make the first `times` queries covering `key` fail, then succeed.
    pub fn fail_on_key_times(mut self, key: u64, times: usize) -> Self {
        self.failures.push(InjectedFailure {
            key,
            remaining: Some(AtomicUsize::new(times)),
            after_rows: None,
        });
        self
    }

    /// Make queries covering `key` fail mid-stream after `rows` rows.
    pub fn fail_on_key_after_rows(mut self, key: u64, rows: usize) -> Self {
        self.failures.push(InjectedFailure { key, remaining: None, after_rows: Some(rows) });
        self
    }

    /// Total rows stored.
    pub fn len(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of range queries issued so far.
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::Relaxed)
    }

    /// Ranges queried so far, in call order.
    pub fn queried_ranges(&self) -> Vec<(u64, u64)> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }

    fn injected_failure(&self, start: u64, end: u64) -> Option<Option<usize>> {
        for failure in &self.failures {
            if failure.key < start || failure.key > end {
                continue;
            }
            match &failure.remaining {
                None => return Some(failure.after_rows),
                Some(remaining) => {
                    let claimed = remaining
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                        .is_ok();
                    if claimed {
                        return Some(failure.after_rows);
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl RangeSource for MemorySource {
    fn describe(&self) -> String {
        format!("memory table ({} columns, {} rows)", self.columns.len(), self.len())
    }

    async fn row_count(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    async fn columns(&self) -> Result<Vec<String>> {
        Ok(self.columns.clone())
    }

    async fn fetch_range(&self, start: u64, end: u64) -> Result<RowStream> {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut queries) = self.queries.lock() {
            queries.push((start, end));
        }

        let rows: Vec<Row> = self
            .rows
            .range(start..=end)
            .flat_map(|(_, rows)| rows.iter().cloned())
            .collect();

        match self.injected_failure(start, end) {
            None => Ok(stream::iter(rows.into_iter().map(Ok)).boxed()),
            Some(None) => anyhow::bail!("injected query failure for range [{}, {}]", start, end),
            Some(Some(after)) => {
                let head = rows.into_iter().take(after).map(Ok);
                let tail = std::iter::once(Err(anyhow::anyhow!(
                    "injected stream failure for range [{}, {}] after {} rows",
                    start,
                    end,
                    after
                )));
                Ok(stream::iter(head.chain(tail)).boxed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_generated_source() {
        let source = MemorySource::generated(10, 2, 3);
        assert_eq!(source.row_count().await.unwrap(), 20);
        assert_eq!(source.columns().await.unwrap(), vec!["c0", "c1", "c2"]);
    }

    #[tokio::test]
    async fn test_fetch_range_inclusive() {
        let source = MemorySource::generated(10, 1, 2);
        let rows: Vec<Row> = source.fetch_range(3, 5).await.unwrap().try_collect().await.unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r[0].clone().unwrap()).collect();
        assert_eq!(keys, vec!["3", "4", "5"]);
        assert_eq!(source.query_count(), 1);
        assert_eq!(source.queried_ranges(), vec![(3, 5)]);
    }

    #[tokio::test]
    async fn test_injected_failure_only_for_covering_ranges() {
        let source = MemorySource::generated(10, 1, 2).fail_on_key(7);
        assert!(source.fetch_range(1, 5).await.is_ok());
        assert!(source.fetch_range(6, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_transient_failure() {
        let source = MemorySource::generated(4, 1, 1).fail_on_key_times(2, 1);
        assert!(source.fetch_range(1, 4).await.is_err());
        assert!(source.fetch_range(1, 4).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_transient_failure_fires_exactly_n_times_under_contention() {
        let source = std::sync::Arc::new(MemorySource::generated(4, 1, 1).fail_on_key_times(2, 3));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let source = source.clone();
                tokio::spawn(async move { source.fetch_range(1, 4).await.is_err() })
            })
            .collect();

        let mut failures = 0;
        for handle in handles {
            if handle.await.unwrap() {
                failures += 1;
            }
        }
        assert_eq!(failures, 3);
        assert!(source.fetch_range(1, 4).await.is_ok());
    }

    #[tokio::test]
    async fn test_mid_stream_failure() {
        let source = MemorySource::generated(5, 1, 1).fail_on_key_after_rows(1, 2);
        let result: Result<Vec<Row>> = source.fetch_range(1, 5).await.unwrap().try_collect().await;
        assert!(result.is_err());
    }
}
