//! Range Export
//!
//! Export a large table keyed by a dense ordinal column into many delimited
//! files, one per fixed-size key range, using a pool of concurrent workers.
//!
//! # Architecture
//!
//! - **Plan**: divide the key span `[1, L]` into contiguous, gap-free chunks
//! - **Source**: run bounded range queries (PostgreSQL/Redshift or in-memory)
//! - **I/O**: render rows as `;`-delimited records into per-chunk artifacts
//! - **Pipeline**: work queue, extraction workers, completion tracking and metrics
//!
//! # Usage
//!
//! ```no_run
//! use range_export::{run_extraction, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let summary = run_extraction(config).await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod plan;
pub mod source;

pub use config::{Config, IfExists};
pub use error::{ChunkError, FailureKind};
pub use pipeline::{Controller, ControllerConfig, Metrics, RunSummary};
pub use plan::{partition, Chunk, PartitionPlan};
pub use source::{MemorySource, PostgresSource, RangeSource};

use anyhow::{Context, Result};
use std::sync::Arc;

/// Run a full export against the PostgreSQL source described by `config`.
pub async fn run_extraction(config: Config) -> Result<RunSummary> {
    config.validate()?;

    tracing::info!("Starting range export of {}", config.source.table);

    let source = PostgresSource::connect(&config.source, config.pool_size()).await?;
    run_with_source(Arc::new(config), Arc::new(source)).await
}

/// Run a full export against an already-open source.
pub async fn run_with_source(config: Arc<Config>, source: Arc<dyn RangeSource>) -> Result<RunSummary> {
    config.validate()?;

    tracing::info!("Source: {}", source.describe());

    // Discover the column layout
    let columns = source.columns().await.context("Failed to discover source columns")?;
    if columns.is_empty() {
        anyhow::bail!("Source has no columns");
    }
    tracing::info!("{} columns: {}", columns.len(), columns.join(", "));

    let span = resolve_span(&config, source.as_ref()).await?;
    let plan = partition(span, config.processing.chunk_size)?;
    tracing::info!("Partition plan: {}", plan);

    std::fs::create_dir_all(&config.output.directory).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.output.directory.display()
        )
    })?;

    let metrics = Metrics::new();
    let format = io::RecordFormat::new(&config.output, columns.len());
    let extractor = Arc::new(pipeline::ChunkExtractor::new(
        source,
        format,
        &config.output,
        config.processing.retry.clone(),
        metrics.clone(),
    ));

    let controller = Controller::new(
        extractor,
        metrics,
        ControllerConfig::from(&config.processing),
    );

    tracing::info!("Writing artifacts to {}", config.output.directory.display());
    let summary = controller.run(&plan).await?;

    tracing::info!("Export complete: {}", summary);

    Ok(summary)
}

/// Determine the key span, from configuration or by counting rows.
pub async fn resolve_span(config: &Config, source: &dyn RangeSource) -> Result<u64> {
    if let Some(span) = config.source.key_span {
        tracing::info!("Using configured key span {}", span);
        return Ok(span);
    }

    tracing::info!("Counting rows in {}", config.source.table);
    let row_count = source.row_count().await.context("Failed to count source rows")?;
    let span = plan::key_span(row_count, config.source.rows_per_key)?;
    tracing::info!(
        "Table has {} rows, {} per key: key span is {}",
        row_count,
        config.source.rows_per_key,
        span
    );
    Ok(span)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
