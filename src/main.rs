//! Report Pipeline CLI
//!
//! Streams records from a configured source through transforms into a
//! formatted report.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use report_pipeline::{build_runtime, init_rayon, run_pipeline, Config};

#[derive(Parser)]
#[command(name = "report-pipeline")]
#[command(about = "Stream records from a source into a formatted report", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override records per chunk
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Override worker pool size
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Run transforms on the worker pool
    #[arg(long, global = true)]
    worker_pool: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

/// Command-line overrides applied on top of the configuration file.
struct Overrides {
    chunk_size: Option<usize>,
    workers: Option<usize>,
    worker_pool: bool,
}

impl Overrides {
    fn apply(&self, config: &mut Config) {
        if let Some(n) = self.chunk_size {
            config.processing.chunk_size = n;
        }
        if let Some(n) = self.workers {
            config.processing.worker_count = n;
        }
        if self.worker_pool {
            config.processing.use_worker_pool = true;
        }
    }
}

fn main() -> Result<()> {
    // Initialize logging. Reports may go to stdout, so logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let overrides = Overrides {
        chunk_size: cli.chunk_size,
        workers: cli.workers,
        worker_pool: cli.worker_pool,
    };

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(cli.config, &overrides)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config, &overrides)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(config_path: &PathBuf, overrides: &Overrides) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, overrides: &Overrides) -> Result<()> {
    let config = load_config(&config_path, overrides)?;

    // Initialize Rayon
    init_rayon(config.processing.rayon_threads)?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(async {
        let cancel = CancellationToken::new();
        let signal_token = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, cancelling");
                signal_token.cancel();
            }
        });
        run_pipeline(config, cancel).await
    })?;

    Ok(())
}

fn validate_command(config_path: PathBuf, overrides: &Overrides) -> Result<()> {
    load_config(&config_path, overrides)?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Report Pipeline Configuration

# === SOURCE: Where records come from ===
# type: mock | csv | json_lines
source:
  type: csv
  path: "data/users.csv"
  # Single ASCII character
  delimiter: ","
  # Parse numbers and booleans; false keeps every cell as a string
  infer_types: true

# === TRANSFORMS: Applied in order to every chunk ===
# type: filter | rename | drop | set | uppercase
transforms:
  - type: filter
    field: active
    equals: true
  - type: rename
    from: email
    to: contact
  - type: uppercase
    fields: [name]

# === FORMAT: How records are serialized ===
# type: json | json_lines | csv | yaml
format:
  type: json_lines

# === OUTPUT: Where serialized bytes go ===
# type: console | file
output:
  type: file
  path: "reports/users.jsonl"
  append: false

# === PROCESSING: Performance tuning ===
processing:
  # Records per chunk; memory is bounded by this, not by the data set
  chunk_size: 1000

  # Split each chunk across a worker pool for transform work
  use_worker_pool: false
  # worker_count: 8

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Rayon thread pool size for CPU work (null = num CPUs)
  # rayon_threads: 8

  # Print throughput metrics during processing
  enable_metrics: true

  # Metrics reporting interval in seconds
  metrics_interval_secs: 10

  # Save a metrics snapshot as JSON after the run
  # metrics_output_path: "reports/metrics.json"

  # Seconds to wait for in-flight pool work on shutdown
  close_timeout_secs: 30

  # Retry failing transform stages with exponential backoff
  retry:
    enabled: false
    max_retries: 3
    initial_backoff_ms: 100
    max_backoff_ms: 10000
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
