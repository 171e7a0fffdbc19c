//! Insert-or-update reconciliation keyed by record fingerprint
//!
//! Provides:
//! - reconcile: upsert a batch of records into an existing table
//! - ReconcileOptions: chunk size and source file tagging
//! - ReconcileOutcome: committed insert/update counts and error messages
//!
//! Each chunk of `batch_size` records runs in one transaction. Every record
//! gets its own savepoint, so a failing record is rolled back alone and the
//! rest of the chunk still commits. Rows are never deleted.

use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, Transaction};
use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::hash::fingerprint;
use crate::schema::{
    table_columns, HASH_COLUMN, IDENTITY_PREFIX, SOURCE_COLUMN, SYNC_DATE_COLUMN,
};
use crate::security::validate_sql_identifier;
use crate::types::{Record, Value};

const RECORD_SAVEPOINT: &str = "dbf_sync_record";

/// Prefix of the message recorded when a call stops early
pub const GENERAL_ERROR_PREFIX: &str = "General error";

/// Options for one reconcile call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Records committed per transaction
    pub batch_size: usize,
    /// Written to `dbf_source` when the table has that column
    pub source_file: Option<String>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            source_file: None,
        }
    }
}

impl ReconcileOptions {
    /// Set the chunk size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Tag written rows with the source file name
    pub fn with_source_file(mut self, file_name: impl Into<String>) -> Self {
        self.source_file = Some(file_name.into());
        self
    }
}

/// Result of a reconcile call. Counts only include committed work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Rows inserted
    pub inserted: usize,
    /// Rows updated
    pub updated: usize,
    /// One message per failed record, plus at most one general failure
    pub errors: Vec<String>,
}

impl ReconcileOutcome {
    /// Whether nothing failed
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Whether the call stopped before every chunk was attempted
    pub fn is_aborted(&self) -> bool {
        self.errors
            .iter()
            .any(|e| e.starts_with(GENERAL_ERROR_PREFIX))
    }

    /// Rows written
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

enum RecordWrite {
    Inserted,
    Updated,
}

/// Statements and bindings prepared once per call
struct WritePlan {
    /// Source field names, aligned with `columns`
    fields: Vec<String>,
    /// Destination columns written from the record
    columns: Vec<String>,
    source_value: Option<Value>,
    exists_sql: String,
    insert_sql: String,
    update_sql: String,
}

impl WritePlan {
    fn build(
        dialect: &dyn SqlDialect,
        table: &str,
        table_cols: &[String],
        first: &Record,
        options: &ReconcileOptions,
    ) -> Self {
        let identity = format!("{}{}", IDENTITY_PREFIX, table);
        let available: HashSet<&str> = table_cols.iter().map(String::as_str).collect();
        let reserved = [HASH_COLUMN, SYNC_DATE_COLUMN, SOURCE_COLUMN, identity.as_str()];

        let mut fields = Vec::new();
        let mut columns: Vec<String> = Vec::new();
        let mut dropped = Vec::new();
        for field in first.field_names() {
            let column = field.to_lowercase();
            if available.contains(column.as_str())
                && !reserved.contains(&column.as_str())
                && !columns.contains(&column)
            {
                fields.push(field.clone());
                columns.push(column);
            } else {
                dropped.push(field.as_str());
            }
        }
        if !dropped.is_empty() {
            warn!(
                "Fields without a matching column in {} are not written: {}",
                table,
                dropped.join(", ")
            );
        }

        let source_value = options
            .source_file
            .as_ref()
            .filter(|_| available.contains(SOURCE_COLUMN))
            .map(|f| Value::from(f.as_str()));

        let mut set_columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        if source_value.is_some() {
            set_columns.push(SOURCE_COLUMN);
        }
        let update_sql = dialect.update_sql(table, &set_columns);

        let mut insert_columns = set_columns;
        insert_columns.push(HASH_COLUMN);
        let insert_sql = dialect.insert_sql(table, &insert_columns);

        Self {
            fields,
            columns,
            source_value,
            exists_sql: dialect.exists_by_hash_sql(table),
            insert_sql,
            update_sql,
        }
    }

    /// Bound values: mapped fields, then source file, then hash. Insert and
    /// update share this order.
    fn params(&self, record: &Record, hash: &str) -> Vec<Value> {
        let mut params: Vec<Value> = self
            .fields
            .iter()
            .map(|f| record.get(f).cloned().unwrap_or(Value::Null))
            .collect();
        if let Some(source) = &self.source_value {
            params.push(source.clone());
        }
        params.push(Value::from(hash));
        params
    }

    async fn write(&self, tx: &dyn Transaction, record: &Record) -> Result<RecordWrite> {
        let hash = fingerprint(record);
        let exists = tx
            .query_one(&self.exists_sql, &[Value::from(hash.as_str())])
            .await?
            .is_some();

        let params = self.params(record, &hash);
        if exists {
            tx.execute(&self.update_sql, &params).await?;
            Ok(RecordWrite::Updated)
        } else {
            tx.execute(&self.insert_sql, &params).await?;
            Ok(RecordWrite::Inserted)
        }
    }
}

/// Upsert `records` into `table`.
///
/// Never fails: per-record failures and general failures are reported in
/// `ReconcileOutcome::errors`. An empty batch touches nothing.
pub async fn reconcile(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    table: &str,
    records: &[Record],
    options: &ReconcileOptions,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();
    if records.is_empty() {
        return outcome;
    }

    match reconcile_chunks(conn, dialect, table, records, options, &mut outcome).await {
        Ok(()) => info!(
            "Synced {}: {} inserted, {} updated, {} errors",
            table,
            outcome.inserted,
            outcome.updated,
            outcome.errors.len()
        ),
        Err(e) => {
            error!(
                "Reconcile of {} aborted after {} inserted, {} updated: {}",
                table, outcome.inserted, outcome.updated, e
            );
            outcome.errors.push(format!("{}: {}", GENERAL_ERROR_PREFIX, e));
        }
    }
    outcome
}

async fn reconcile_chunks(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    table: &str,
    records: &[Record],
    options: &ReconcileOptions,
    outcome: &mut ReconcileOutcome,
) -> Result<()> {
    validate_sql_identifier(table)?;
    let table_cols = table_columns(conn, dialect, table).await?;

    // records is non-empty here
    let Some(first) = records.first() else {
        return Ok(());
    };
    let plan = WritePlan::build(dialect, table, &table_cols, first, options);
    debug!("Writing {} columns into {}", plan.columns.len(), table);

    let batch_size = options.batch_size.max(1);
    for (chunk_idx, chunk) in records.chunks(batch_size).enumerate() {
        let offset = chunk_idx * batch_size;
        let tx = conn.begin().await?;

        match apply_chunk(tx.as_ref(), &plan, chunk, offset, &mut outcome.errors).await {
            Ok((inserted, updated)) => {
                tx.commit().await?;
                outcome.inserted += inserted;
                outcome.updated += updated;
                debug!(
                    "Committed records {}..{} of {}",
                    offset,
                    offset + chunk.len(),
                    table
                );
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!("Rollback of {} failed: {}", table, rb);
                }
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Write one chunk, returning (inserted, updated) for that chunk
async fn apply_chunk(
    tx: &dyn Transaction,
    plan: &WritePlan,
    chunk: &[Record],
    offset: usize,
    errors: &mut Vec<String>,
) -> Result<(usize, usize)> {
    let mut inserted = 0;
    let mut updated = 0;

    for (i, record) in chunk.iter().enumerate() {
        tx.savepoint(RECORD_SAVEPOINT).await?;
        match plan.write(tx, record).await {
            Ok(write) => {
                tx.release_savepoint(RECORD_SAVEPOINT).await?;
                match write {
                    RecordWrite::Inserted => inserted += 1,
                    RecordWrite::Updated => updated += 1,
                }
            }
            Err(e) => {
                tx.rollback_to_savepoint(RECORD_SAVEPOINT).await?;
                warn!("Record {} failed: {}", offset + i, e);
                errors.push(format!("Error processing record {}: {}", offset + i, e));
            }
        }
    }

    Ok((inserted, updated))
}
