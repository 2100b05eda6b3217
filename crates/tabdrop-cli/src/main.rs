use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tabdrop_sync::{inspect_file, IngestConfig, Pipeline};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tabdrop")]
#[command(about = "Load CSV files dropped into a folder into Postgres tables")]
struct Cli {
    #[command(flatten)]
    settings: Settings,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct Settings {
    /// YAML file with directory, connection_target, concurrency and settle_delay_ms
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory to watch
    #[arg(short, long, global = true)]
    directory: Option<PathBuf>,
    /// Backend connection target (postgres://... or memory://)
    #[arg(long, global = true)]
    connection: Option<String>,
    /// Files processed at once; tables shared between files are still written one at a time
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    /// Wait this long after a file appears before reading it
    #[arg(long, global = true)]
    settle_ms: Option<u64>,
}

impl Settings {
    /// Defaults, then the YAML file, then the environment, then flags.
    fn resolve(&self) -> Result<IngestConfig> {
        let base = match &self.config {
            Some(path) => IngestConfig::from_yaml_file(path)?,
            None => IngestConfig::default(),
        };
        let mut config = base.with_env_overrides();
        if let Some(directory) = &self.directory {
            config.directory = directory.clone();
        }
        if let Some(connection) = &self.connection {
            config.connection_target = connection.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(settle_ms) = self.settle_ms {
            config.settle_delay_ms = settle_ms;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest existing files, then watch for new ones until interrupted
    Watch,
    /// Ingest existing files once and exit
    Reconcile {
        #[arg(long)]
        json: bool,
    },
    /// Load and validate one file without writing anywhere
    Check {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool, format: LogFormat) -> Result<()> {
    let default_directives = if verbose {
        "debug,sqlx=warn"
    } else {
        "info,sqlx=warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|err| anyhow::anyhow!("initializing logging: {err}"))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "cannot listen for interrupt; stopping");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format)?;

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => {
            let pipeline = Pipeline::from_config(cli.settings.resolve()?)?;
            let summary = pipeline.run_until(shutdown_signal()).await?;
            println!(
                "stopped: reconciled={} live_synced={} live_rejected={} live_failed={} aborted={}",
                summary.reconciled.files(),
                summary.live.synced,
                summary.live.rejected,
                summary.live.failed,
                summary.aborted
            );
        }
        Commands::Reconcile { json } => {
            let pipeline = Pipeline::from_config(cli.settings.resolve()?)?;
            let summary = pipeline.reconcile().await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing summary")?
                );
            } else {
                println!(
                    "reconcile complete: run_id={} files={} synced={} rejected={} failed={}",
                    summary.run_id,
                    summary.files(),
                    summary.tally.synced,
                    summary.tally.rejected,
                    summary.tally.failed
                );
            }
        }
        Commands::Check { file, json } => {
            let inspection = inspect_file(&file).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&inspection).context("serializing inspection")?
                );
            } else {
                match (&inspection.destination, &inspection.rejection) {
                    (Some(table), _) => println!(
                        "ok: {} -> table {table} ({} rows)",
                        file.display(),
                        inspection.rows
                    ),
                    (None, Some(reason)) => println!("rejected: {}: {reason}", file.display()),
                    (None, None) => println!("rejected: {}", file.display()),
                }
            }
        }
    }

    Ok(())
}
