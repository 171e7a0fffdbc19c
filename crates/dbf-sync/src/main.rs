//! dbf-sync - keeps MySQL / MariaDB tables in step with DBF files
//!
//! # Usage
//!
//! ```bash
//! # Poll the configured files every scan interval
//! dbf-sync -c dbf-sync.yaml
//!
//! # One pass over every file, or over one file
//! dbf-sync -c dbf-sync.yaml sync
//! dbf-sync -c dbf-sync.yaml sync recibos.dbf
//!
//! # Snapshot a table
//! dbf-sync -c dbf-sync.yaml backup recibos
//!
//! # Back up, drop and rebuild the table of one file
//! dbf-sync -c dbf-sync.yaml recreate recibos.dbf
//!
//! # Validate configuration
//! dbf-sync -c dbf-sync.yaml validate
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dbf_sync::prelude::*;

#[derive(Parser)]
#[command(name = "dbf-sync")]
#[command(version, about = "Synchronize DBF tables into MySQL / MariaDB")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dbf-sync.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the configured files and sync them when they change (default)
    Run,
    /// Run one synchronization pass
    Sync {
        /// Only this file (default: every configured file)
        file: Option<String>,
    },
    /// Copy a table into a timestamped backup table
    Backup {
        /// Table name
        table: String,
    },
    /// Back up, drop and recreate the table of a file, then sync it
    Recreate {
        /// Source file name
        file: String,
    },
    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SyncConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    init_logging(cli.verbose, &config.logging.level);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Validate => {
            info!(
                "Configuration valid: {} files in {}",
                config.source.files.len(),
                config.source.folder.display()
            );
            Ok(())
        }
        Commands::Run => {
            let mut runner = build_runner(config).await?;
            runner
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                    }
                })
                .await;
            runner.connection().close().await?;
            Ok(())
        }
        Commands::Sync { file } => {
            let runner = build_runner(config).await?;
            let files = match file {
                Some(file) => vec![file],
                None => runner.files().to_vec(),
            };

            let mut failed = 0;
            for file in &files {
                match runner.sync_file(file).await {
                    Ok(report) => print_report(&report),
                    Err(e) => {
                        failed += 1;
                        error!("Synchronization of {} failed: {}", file, e);
                    }
                }
            }
            runner.connection().close().await?;

            if failed > 0 {
                anyhow::bail!("{} of {} files failed to sync", failed, files.len());
            }
            Ok(())
        }
        Commands::Backup { table } => {
            let dialect = config.database.sql_dialect();
            let conn = connect(&config).await?;
            let backup = try_backup_table(conn.as_ref(), dialect.as_ref(), &table).await;
            conn.close().await?;

            let backup = backup.with_context(|| format!("Backup of {} failed", table))?;
            info!("Backup of {} written to {}", table, backup);
            Ok(())
        }
        Commands::Recreate { file } => {
            let runner = build_runner(config).await?;
            let result = runner.recreate(&file).await;
            runner.connection().close().await?;

            let (backup, report) = result.with_context(|| format!("Recreate of {} failed", file))?;
            match backup {
                Some(name) => info!("Previous contents of {} kept in {}", report.table, name),
                None => warn!("{} did not exist, nothing to back up", report.table),
            }
            print_report(&report);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, default_level: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn connect(config: &SyncConfig) -> Result<Box<dyn Connection>> {
    let conn_config = config.database.to_connection_config()?;
    info!(
        "Connecting to {} at {}:{}",
        config.database.database, config.database.host, config.database.port
    );

    let conn = connect_with_retry(
        &MySqlConnectionFactory,
        &conn_config,
        config.sync.retry_policy(),
    )
    .await?;
    Ok(conn)
}

async fn build_runner(config: SyncConfig) -> Result<SyncRunner> {
    let conn = connect(&config).await?;
    let dialect: Arc<dyn SqlDialect> = Arc::from(config.database.sql_dialect());
    let source: Arc<dyn RecordSource> = Arc::new(DbfSource::new(&config.source.folder));

    Ok(SyncRunner::new(
        conn,
        dialect,
        source,
        config.source.files,
        config.sync,
    ))
}

fn print_report(report: &FileReport) {
    info!(
        "{} -> {} ({:?}): {} inserted, {} updated, {} errors",
        report.file,
        report.table,
        report.table_outcome,
        report.outcome.inserted,
        report.outcome.updated,
        report.outcome.errors.len()
    );
}
