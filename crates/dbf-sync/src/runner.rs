//! Synchronization passes and the polling loop
//!
//! A pass for one file ensures its table, reads its records and reconciles
//! them. The loop re-runs a pass for every monitored file whose modification
//! time changed since the last successful pass.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

use crate::backup::try_backup_table;
use crate::config::SyncSettings;
use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::reconcile::{reconcile, ReconcileOutcome};
use crate::schema::{table_exists, table_name_for, SchemaSynchronizer, TableOutcome};
use crate::source::RecordSource;

/// Result of one synchronization pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    /// Source file name
    pub file: String,
    /// Destination table
    pub table: String,
    /// What happened to the table
    pub table_outcome: TableOutcome,
    /// Reconcile counts and errors
    pub outcome: ReconcileOutcome,
}

/// Drives synchronization passes over one connection
pub struct SyncRunner {
    conn: Box<dyn Connection>,
    dialect: Arc<dyn SqlDialect>,
    source: Arc<dyn RecordSource>,
    schema: SchemaSynchronizer,
    settings: SyncSettings,
    files: Vec<String>,
    last_synced: HashMap<String, SystemTime>,
}

impl SyncRunner {
    /// Create a runner for `files`
    pub fn new(
        conn: Box<dyn Connection>,
        dialect: Arc<dyn SqlDialect>,
        source: Arc<dyn RecordSource>,
        files: Vec<String>,
        settings: SyncSettings,
    ) -> Self {
        let schema =
            SchemaSynchronizer::new(source.clone(), dialect.clone(), settings.schema_options());
        Self {
            conn,
            dialect,
            source,
            schema,
            settings,
            files,
            last_synced: HashMap::new(),
        }
    }

    /// Monitored files
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// The connection every pass runs on
    pub fn connection(&self) -> &dyn Connection {
        self.conn.as_ref()
    }

    /// Run one pass for `file_name`
    pub async fn sync_file(&self, file_name: &str) -> Result<FileReport> {
        self.sync_file_with(file_name, false).await
    }

    async fn sync_file_with(&self, file_name: &str, force_recreate: bool) -> Result<FileReport> {
        let table = table_name_for(file_name);
        let records = self.source.read_records(file_name).await?;
        let table_outcome = self
            .schema
            .try_ensure_table_with(self.conn.as_ref(), file_name, &records, force_recreate)
            .await?;

        let outcome = reconcile(
            self.conn.as_ref(),
            self.dialect.as_ref(),
            &table,
            &records,
            &self.settings.reconcile_options(file_name),
        )
        .await;

        for message in &outcome.errors {
            warn!("{} -> {}: {}", file_name, table, message);
        }

        Ok(FileReport {
            file: file_name.to_string(),
            table,
            table_outcome,
            outcome,
        })
    }

    /// Back up the table of `file_name` when it exists, then drop, recreate
    /// and fill it again.
    ///
    /// Returns the backup table name, if one was made, with the pass report.
    pub async fn recreate(&self, file_name: &str) -> Result<(Option<String>, FileReport)> {
        let table = table_name_for(file_name);
        let backup = if table_exists(self.conn.as_ref(), self.dialect.as_ref(), &table).await? {
            Some(try_backup_table(self.conn.as_ref(), self.dialect.as_ref(), &table).await?)
        } else {
            None
        };

        let report = self.sync_file_with(file_name, true).await?;
        Ok((backup, report))
    }

    /// Run a pass for every monitored file whose modification time changed.
    ///
    /// A file is marked as synced only when its pass finished without a
    /// general reconcile failure, so failed files are retried next scan.
    pub async fn scan_once(&mut self) -> Vec<FileReport> {
        let mut reports = Vec::new();

        for file in self.files.clone() {
            let modified = match self.source.last_modified(&file).await {
                Ok(modified) => modified,
                Err(e) => {
                    warn!("Skipping {}: {}", file, e);
                    continue;
                }
            };

            if let (Some(current), Some(previous)) = (modified, self.last_synced.get(&file)) {
                if current == *previous {
                    debug!("{} unchanged since last pass", file);
                    continue;
                }
            }

            info!("Synchronizing {}", file);
            match self.sync_file(&file).await {
                Ok(report) => {
                    if let (Some(current), false) = (modified, report.outcome.is_aborted()) {
                        self.last_synced.insert(file.clone(), current);
                    }
                    reports.push(report);
                }
                Err(e) => error!("Synchronization of {} failed: {}", file, e),
            }
        }

        reports
    }

    /// Scan every `scan_interval` until `shutdown` resolves
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let interval = self.settings.scan_interval();
        tokio::pin!(shutdown);
        info!(
            "Monitoring {} files every {:?}",
            self.files.len(),
            interval
        );

        loop {
            let reports = self.scan_once().await;
            for report in &reports {
                info!(
                    "{}: {} inserted, {} updated, {} errors",
                    report.table,
                    report.outcome.inserted,
                    report.outcome.updated,
                    report.outcome.errors.len()
                );
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping scans");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
