//! PostgreSQL-compatible source (PostgreSQL, Redshift) over `tokio-postgres`.
//!
//! Range queries use the simple-query protocol so every value comes back in
//! its text representation, which is exactly what the artifacts store.

use super::{RangeSource, Row, RowStream};
use crate::config::SourceConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};

/// A fixed set of connections shared round-robin by the workers.
pub struct PostgresSource {
    clients: Vec<Client>,
    next: AtomicUsize,
    table: String,
    key_column: String,
    order_by_key: bool,
}

impl PostgresSource {
    /// Open `pool_size` connections to the configured database.
    pub async fn connect(config: &SourceConfig, pool_size: usize) -> Result<Self> {
        let table = quote_ident(&config.table)?;
        let key_column = quote_ident(&config.key_column)?;

        let pool_size = pool_size.max(1);
        let mut clients = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let (client, connection) = tokio_postgres::connect(&config.connection, NoTls)
                .await
                .with_context(|| format!("Failed to open source connection {}/{}", i + 1, pool_size))?;

            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!("Source connection closed with error: {}", e);
                }
            });
            clients.push(client);
        }

        tracing::info!("Opened {} source connections", pool_size);

        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
            table,
            key_column,
            order_by_key: config.order_by_key,
        })
    }

    fn client(&self) -> &Client {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[i]
    }
}

#[async_trait]
impl RangeSource for PostgresSource {
    fn describe(&self) -> String {
        format!(
            "postgres table {} keyed by {} ({} connections)",
            self.table,
            self.key_column,
            self.clients.len()
        )
    }

    async fn row_count(&self) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let row = self
            .client()
            .query_one(sql.as_str(), &[])
            .await
            .with_context(|| format!("Failed to count rows of {}", self.table))?;
        let count: i64 = row.try_get(0)?;
        u64::try_from(count).context("Row count is negative")
    }

    async fn columns(&self) -> Result<Vec<String>> {
        let sql = format!("SELECT * FROM {} LIMIT 0", self.table);
        let statement = self
            .client()
            .prepare(&sql)
            .await
            .with_context(|| format!("Failed to describe {}", self.table))?;
        Ok(statement.columns().iter().map(|c| c.name().to_string()).collect())
    }

    async fn fetch_range(&self, start: u64, end: u64) -> Result<RowStream> {
        let sql = range_query(&self.table, &self.key_column, start, end, self.order_by_key);
        tracing::trace!("Range query: {}", sql);

        let messages = self.client().simple_query_raw(&sql).await?;
        let rows = messages
            .map_err(anyhow::Error::from)
            .try_filter_map(|message| async move {
                Ok::<_, anyhow::Error>(match message {
                    SimpleQueryMessage::Row(row) => {
                        let values: Row = (0..row.len()).map(|i| row.get(i).map(str::to_owned)).collect();
                        Some(values)
                    }
                    _ => None,
                })
            });
        Ok(rows.boxed())
    }
}

/// Build the inclusive range query for one chunk. Identifiers must already be quoted.
pub fn range_query(table: &str, key_column: &str, start: u64, end: u64, order_by_key: bool) -> String {
    let mut sql = format!(
        "SELECT * FROM {table} WHERE {key_column} >= {start} AND {key_column} <= {end}"
    );
    if order_by_key {
        sql.push_str(&format!(" ORDER BY {key_column}"));
    }
    sql
}

/// Render a possibly schema-qualified identifier safely.
///
/// Plain identifiers (`[A-Za-z_][A-Za-z0-9_$]*`) are left unquoted so the
/// server folds their case as usual. Parts already wrapped in double quotes are
/// kept as written. Anything else is quoted, with embedded quotes doubled.
pub fn quote_ident(name: &str) -> Result<String> {
    let parts = split_qualified(name)?;
    let rendered: Vec<String> = parts
        .into_iter()
        .map(|part| {
            if is_plain_ident(part) || is_quoted_ident(part) {
                part.to_string()
            } else {
                format!("\"{}\"", part.replace('"', "\"\""))
            }
        })
        .collect();
    Ok(rendered.join("."))
}

fn split_qualified(name: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut begin = 0;
    for (i, ch) in name.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => {
                parts.push(&name[begin..i]);
                begin = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&name[begin..]);

    if parts.iter().any(|p| p.trim().is_empty()) {
        anyhow::bail!("Invalid identifier: '{}'", name);
    }
    Ok(parts)
}

fn is_plain_ident(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

fn is_quoted_ident(part: &str) -> bool {
    if part.len() < 3 || !part.starts_with('"') || !part.ends_with('"') {
        return false;
    }
    // Inner quotes must come in escaped pairs.
    let inner = &part[1..part.len() - 1];
    inner.replace("\"\"", "").find('"').is_none()
}
