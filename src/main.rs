//! Range Export CLI
//!
//! Export a table in fixed-size key ranges to delimited files.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use range_export::{
    build_runtime, io::artifact_name, partition, resolve_span, run_extraction, Config,
    PartitionPlan, PostgresSource,
};

#[derive(Parser)]
#[command(name = "range-export")]
#[command(about = "Export a table in fixed-size key ranges to delimited files", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the number of extraction workers
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Override the number of keys per chunk
    #[arg(long, global = true)]
    chunk_size: Option<u64>,

    /// Append logs to this file instead of stdout
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the export (default if no command specified)
    Run,

    /// Print the partition plan without extracting
    Plan {
        /// Key span to plan for; skips connecting to the source
        #[arg(long)]
        span: Option<u64>,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_file.as_ref())?;

    match cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(&cli.config, cli.workers, cli.chunk_size)?;
            run_command(config)?;
        }

        Some(Commands::Plan { span }) => {
            let config = load_config(&cli.config, cli.workers, cli.chunk_size)?;
            plan_command(&config, span)?;
        }

        Some(Commands::Validate) => {
            load_config(&cli.config, cli.workers, cli.chunk_size)?;
            println!("Configuration is valid");
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn init_logging(log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    Ok(())
}

/// Load the configuration, apply CLI overrides and validate.
fn load_config(path: &PathBuf, workers: Option<usize>, chunk_size: Option<u64>) -> Result<Config> {
    let mut config = Config::from_file(path)?;

    // Apply overrides
    if let Some(w) = workers {
        config.processing.workers = w;
    }
    if let Some(s) = chunk_size {
        config.processing.chunk_size = s;
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config: Config) -> Result<()> {
    let runtime = build_runtime(config.processing.worker_threads)?;
    let summary = runtime.block_on(run_extraction(config))?;

    summary.print_report();

    if !summary.is_success() {
        anyhow::bail!(
            "{} of {} chunks failed",
            summary.chunks_failed,
            summary.chunks_attempted
        );
    }
    Ok(())
}

fn plan_command(config: &Config, span: Option<u64>) -> Result<()> {
    let span = match span.or(config.source.key_span) {
        Some(span) => span,
        None => {
            let runtime = build_runtime(None)?;
            runtime.block_on(async {
                let source = PostgresSource::connect(&config.source, 1).await?;
                resolve_span(config, &source).await
            })?
        }
    };

    let plan = partition(span, config.processing.chunk_size)?;
    print_plan(config, &plan);
    Ok(())
}

fn print_plan(config: &Config, plan: &PartitionPlan) {
    println!("\n=== Partition Plan ===");
    println!("{}", plan);
    println!("Workers: {}", config.processing.workers);
    println!("Output directory: {}", config.output.directory.display());

    for chunk in plan.iter() {
        println!(
            "{:>8} {:>12} {:>12}  {}",
            chunk.index,
            chunk.start,
            chunk.end,
            artifact_name(&config.output.name_template, chunk)
        );
    }
    println!("======================\n");
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Range Export Configuration

# === SOURCE: Table to export ===
source:
  # libpq-style connection string (PostgreSQL or Redshift)
  connection: "host=localhost port=5439 dbname=dbx user=reader password=secret"

  # Table to export, optionally schema-qualified
  table: "public.table_name"

  # Dense ordinal column the key ranges apply to (values 1..=L)
  key_column: "serialNumber"

  # Rows stored per key value; the key span is ceil(row_count / rows_per_key)
  rows_per_key: 1

  # Explicit key span (skips the COUNT(*) query)
  # key_span: 100000

  # Sort rows by key within each artifact
  order_by_key: false

  # Database connections shared by the workers (default: worker count)
  # pool_size: 6

# === OUTPUT: Artifact files ===
output:
  directory: "./export"

  # {index}, {start} and {end} are replaced per chunk
  name_template: "Ch{index}_ExportingRows_{start}_{end}.csv"

  field_delimiter: ";"
  line_terminator: "\n"

  # Text written for NULL values, or fail the chunk on NULL
  null_text: ""
  reject_nulls: false

  # Existing artifacts: overwrite | reject | append
  if_exists: overwrite

# === PROCESSING: Partitioning and concurrency ===
processing:
  # Keys per chunk (one artifact per chunk)
  chunk_size: 50000

  # Concurrent extraction workers
  workers: 6

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Log progress during the run
  enable_metrics: true
  metrics_interval_secs: 10

  # Retry configuration for failed range queries
  retry:
    max_attempts: 3
    initial_backoff_ms: 100
    max_backoff_ms: 10000

  # Write the run summary as JSON
  # summary_output_path: "export-summary.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
