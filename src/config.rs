//! Configuration for the range export.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for an export run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where rows are read from
    pub source: SourceConfig,

    /// Where artifacts are written and how records are formatted
    #[serde(default)]
    pub output: OutputConfig,

    /// Partitioning and worker pool settings
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Source table configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// libpq-style connection string, e.g. `host=db port=5432 dbname=dbx user=reader`
    pub connection: String,

    /// Table to export, optionally schema-qualified (`schema.table`)
    pub table: String,

    /// Ordinal key column the ranges are applied to
    #[serde(default = "default_key_column")]
    pub key_column: String,

    /// Rows stored per key value. The key span is `ceil(row_count / rows_per_key)`.
    #[serde(default = "default_rows_per_key")]
    pub rows_per_key: u64,

    /// Explicit key span. When set, the row count query is skipped.
    #[serde(default)]
    pub key_span: Option<u64>,

    /// Append `ORDER BY <key_column>` to each range query
    #[serde(default)]
    pub order_by_key: bool,

    /// Number of database connections shared by the workers (default: worker count)
    #[serde(default)]
    pub pool_size: Option<usize>,
}

/// What to do when a chunk's artifact already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    /// Atomically replace the existing file
    #[default]
    Overwrite,
    /// Fail the chunk and leave the existing file untouched
    Reject,
    /// Append to the existing file
    Append,
}

/// Output artifact configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory the artifacts are written to
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// File name template. `{index}`, `{start}` and `{end}` are substituted per chunk.
    #[serde(default = "default_name_template")]
    pub name_template: String,

    /// Character placed between fields (must be ASCII)
    #[serde(default = "default_field_delimiter")]
    pub field_delimiter: char,

    /// Character terminating each record (must be ASCII)
    #[serde(default = "default_line_terminator")]
    pub line_terminator: char,

    /// Text written for NULL values
    #[serde(default)]
    pub null_text: String,

    /// Treat NULL values as a serialization error instead of writing `null_text`
    #[serde(default)]
    pub reject_nulls: bool,

    /// Policy for artifacts left over from a previous run
    #[serde(default)]
    pub if_exists: IfExists,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            name_template: default_name_template(),
            field_delimiter: default_field_delimiter(),
            line_terminator: default_line_terminator(),
            null_text: String::new(),
            reject_nulls: false,
            if_exists: IfExists::default(),
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Keys per chunk (one artifact per chunk)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Number of extraction workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable periodic progress reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Retry configuration for failed range queries
    #[serde(default)]
    pub retry: RetryConfig,

    /// Optional path to save the run summary as JSON
    #[serde(default)]
    pub summary_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            workers: default_workers(),
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            retry: RetryConfig::default(),
            summary_output_path: None,
        }
    }
}

/// Retry configuration for transient query failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per chunk, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Connections to open against the source.
    pub fn pool_size(&self) -> usize {
        self.source.pool_size.unwrap_or(self.processing.workers).max(1)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.source.table.trim().is_empty() {
            anyhow::bail!("source.table must not be empty");
        }
        if self.source.key_column.trim().is_empty() {
            anyhow::bail!("source.key_column must not be empty");
        }
        if self.source.rows_per_key == 0 {
            anyhow::bail!("source.rows_per_key must be > 0");
        }
        if self.source.pool_size == Some(0) {
            anyhow::bail!("source.pool_size must be > 0");
        }

        if self.processing.chunk_size == 0 {
            anyhow::bail!("Chunk size must be > 0");
        }
        if self.processing.workers == 0 {
            anyhow::bail!("Worker count must be > 0");
        }
        if self.processing.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be > 0");
        }
        if self.processing.retry.initial_backoff_ms > self.processing.retry.max_backoff_ms {
            anyhow::bail!("retry.initial_backoff_ms must not exceed retry.max_backoff_ms");
        }
        if self.processing.enable_metrics && self.processing.metrics_interval_secs == 0 {
            anyhow::bail!("metrics_interval_secs must be > 0 when metrics are enabled");
        }

        if !self.output.name_template.contains("{index}") {
            anyhow::bail!("output.name_template must contain {{index}} so chunk names are unique");
        }
        if self.output.name_template.contains('/') || self.output.name_template.contains('\\') {
            anyhow::bail!("output.name_template must be a file name, not a path");
        }
        if !self.output.field_delimiter.is_ascii() || !self.output.line_terminator.is_ascii() {
            anyhow::bail!("Field delimiter and line terminator must be ASCII");
        }
        if self.output.field_delimiter == self.output.line_terminator {
            anyhow::bail!("Field delimiter and line terminator must differ");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_key_column() -> String { "id".to_string() }
fn default_rows_per_key() -> u64 { 1 }
fn default_directory() -> PathBuf { PathBuf::from(".") }
fn default_name_template() -> String { "Ch{index}_ExportingRows_{start}_{end}.csv".to_string() }
fn default_field_delimiter() -> char { ';' }
fn default_line_terminator() -> char { '\n' }
fn default_chunk_size() -> u64 { 50_000 }
fn default_workers() -> usize { 6 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_max_attempts() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10000 }
