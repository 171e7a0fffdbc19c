//! Destination table schemas and the schema synchronizer
//!
//! Provides:
//! - TableSchema: inferred columns for one source file
//! - SchemaSynchronizer: ensures the destination table exists, optionally
//!   dropping and recreating it
//! - table_exists / table_columns: introspection helpers shared with the
//!   reconciler and backup manager

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::inference::{infer_column_type, sample_value, ColumnType};
use crate::security::validate_sql_identifier;
use crate::source::RecordSource;
use crate::types::{Record, Value};

/// Unique fingerprint column, the only de-duplication key
pub const HASH_COLUMN: &str = "control_hash";

/// Last synchronization timestamp column
pub const SYNC_DATE_COLUMN: &str = "sync_date";

/// Source file name column
pub const SOURCE_COLUMN: &str = "dbf_source";

/// Prefix of the synthetic auto-increment column (`id_<table>`)
pub const IDENTITY_PREFIX: &str = "id_";

/// Destination table name for a source file: stem, lowercased.
///
/// `"RECIBOS.DBF"` and `"dbf/recibos.dbf"` both map to `"recibos"`.
pub fn table_name_for(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| file_name.to_lowercase())
}

/// Longest table name whose identity column (`id_<table>`) still fits the
/// 64 character identifier limit
pub const MAX_TABLE_NAME_LEN: usize = 64 - IDENTITY_PREFIX.len();

/// Validate a destination table name, including room for its identity column
pub fn validate_table_name(table: &str) -> Result<()> {
    validate_sql_identifier(table)?;
    if table.len() > MAX_TABLE_NAME_LEN {
        return Err(Error::config(format!(
            "table name {} is longer than {} characters",
            table, MAX_TABLE_NAME_LEN
        )));
    }
    Ok(())
}

/// An inferred column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name (lowercased field name)
    pub name: String,
    /// Inferred storage type
    pub column_type: ColumnType,
}

impl ColumnDef {
    /// Create a column definition
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Structure of a destination table, excluding the synthetic columns the
/// dialect always appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// Inferred columns, in source field order
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Name of the synthetic identity column
    pub fn identity_column(&self) -> String {
        format!("{}{}", IDENTITY_PREFIX, self.name)
    }

    /// Whether a column name is reserved for a synthetic column of this table
    pub fn is_synthetic(&self, column: &str) -> bool {
        column == HASH_COLUMN
            || column == SYNC_DATE_COLUMN
            || column == SOURCE_COLUMN
            || column == self.identity_column()
    }

    /// Infer a schema from the records of one source file.
    ///
    /// One column per field of the first record. Fields that collide with a
    /// synthetic column or repeat after lowercasing are skipped.
    pub fn infer(table_name: &str, population: &[Record]) -> Option<Self> {
        let first = population.first()?;
        let mut schema = Self {
            name: table_name.to_string(),
            columns: Vec::with_capacity(first.len()),
        };
        let mut seen = HashSet::new();

        for field in first.field_names() {
            let name = field.to_lowercase();
            if schema.is_synthetic(&name) {
                warn!(
                    "Field {} in {} collides with a synthetic column, skipping",
                    field, table_name
                );
                continue;
            }
            if !seen.insert(name.clone()) {
                warn!("Duplicate field {} in {}, skipping", field, table_name);
                continue;
            }

            let sample = sample_value(field, population).unwrap_or(&Value::Null);
            let column_type = infer_column_type(field, sample, population);
            debug!("Column {}.{} inferred as {:?}", table_name, name, column_type);
            schema.columns.push(ColumnDef::new(name, column_type));
        }

        Some(schema)
    }
}

/// Check whether a table exists in the connection's current database
pub async fn table_exists(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    table: &str,
) -> Result<bool> {
    let row = conn
        .query_one(&dialect.table_exists_sql(), &[Value::from(table)])
        .await?;
    Ok(row
        .and_then(|r| r.get(0).and_then(Value::as_i64))
        .map(|count| count > 0)
        .unwrap_or(false))
}

/// Lowercased column names of a table, in ordinal order.
///
/// A table without columns does not exist; that is reported as
/// `Error::TableNotFound`.
pub async fn table_columns(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    table: &str,
) -> Result<Vec<String>> {
    let rows = conn
        .query(&dialect.list_columns_sql(), &[Value::from(table)])
        .await?;
    let columns: Vec<String> = rows
        .iter()
        .filter_map(|r| r.get(0).and_then(Value::as_string))
        .map(|c| c.to_lowercase())
        .collect();

    if columns.is_empty() {
        return Err(Error::TableNotFound {
            table: table.to_string(),
        });
    }
    Ok(columns)
}

/// What `ensure_table` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOutcome {
    /// The table was already there and was left untouched
    Existing,
    /// The table was created
    Created,
    /// The table was dropped and created again
    Recreated,
}

/// Settings for the schema synchronizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaOptions {
    /// Total attempts at issuing CREATE TABLE
    pub create_retries: u32,
    /// Fixed wait between attempts
    pub create_retry_delay: Duration,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            create_retries: 3,
            create_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Ensures destination tables exist, inferring their structure from the
/// source file on first encounter.
pub struct SchemaSynchronizer {
    source: Arc<dyn RecordSource>,
    dialect: Arc<dyn SqlDialect>,
    options: SchemaOptions,
}

impl SchemaSynchronizer {
    /// Create a synchronizer
    pub fn new(
        source: Arc<dyn RecordSource>,
        dialect: Arc<dyn SqlDialect>,
        options: SchemaOptions,
    ) -> Self {
        Self {
            source,
            dialect,
            options,
        }
    }

    /// Ensure the table for `file_name` exists.
    ///
    /// Never fails past this boundary: every error is logged with the file
    /// and table name and reported as `false`.
    pub async fn ensure_table(
        &self,
        conn: &dyn Connection,
        file_name: &str,
        force_recreate: bool,
    ) -> bool {
        match self.try_ensure_table(conn, file_name, force_recreate).await {
            Ok(_) => true,
            Err(e) => {
                error!(
                    "Failed to ensure table {} for {}: {} ({})",
                    table_name_for(file_name),
                    file_name,
                    e,
                    e.category()
                );
                false
            }
        }
    }

    /// Ensure the table for `file_name` exists, returning what was done.
    ///
    /// The source file is read only when a table has to be created.
    pub async fn try_ensure_table(
        &self,
        conn: &dyn Connection,
        file_name: &str,
        force_recreate: bool,
    ) -> Result<TableOutcome> {
        self.ensure(conn, file_name, None, force_recreate).await
    }

    /// Like `try_ensure_table`, inferring from records the caller already read
    pub async fn try_ensure_table_with(
        &self,
        conn: &dyn Connection,
        file_name: &str,
        records: &[Record],
        force_recreate: bool,
    ) -> Result<TableOutcome> {
        self.ensure(conn, file_name, Some(records), force_recreate)
            .await
    }

    async fn ensure(
        &self,
        conn: &dyn Connection,
        file_name: &str,
        supplied: Option<&[Record]>,
        force_recreate: bool,
    ) -> Result<TableOutcome> {
        let table = table_name_for(file_name);
        validate_table_name(&table)?;

        let exists = table_exists(conn, self.dialect.as_ref(), &table).await?;
        if exists && !force_recreate {
            info!("Table {} already exists, continuing", table);
            return Ok(TableOutcome::Existing);
        }

        let read;
        let records = match supplied {
            Some(records) => records,
            None => {
                read = self.source.read_records(file_name).await?;
                read.as_slice()
            }
        };
        let schema = TableSchema::infer(&table, records).ok_or_else(|| {
            Error::source(file_name, "no records available to infer a table structure")
        })?;

        if exists {
            info!("Dropping existing table {} for recreation", table);
            conn.execute(&self.dialect.drop_table_sql(&table), &[])
                .await
                .map_err(|e| Error::schema(format!("failed to drop {}: {}", table, e)))?;
        }

        self.create_with_retry(conn, &schema).await?;
        info!(
            "Table {} created with {} inferred columns",
            table,
            schema.columns.len()
        );

        Ok(if exists {
            TableOutcome::Recreated
        } else {
            TableOutcome::Created
        })
    }

    async fn create_with_retry(&self, conn: &dyn Connection, schema: &TableSchema) -> Result<()> {
        let sql = self.dialect.create_table_sql(schema);
        let attempts = self.options.create_retries.max(1);
        debug!("Create statement for {}:\n{}", schema.name, sql);

        let mut attempt = 1;
        loop {
            let tx = conn.begin().await?;
            let err = match tx.execute(&sql, &[]).await {
                Ok(_) => match tx.commit().await {
                    Ok(()) => return Ok(()),
                    Err(e) => e,
                },
                Err(e) => {
                    if let Err(rb) = tx.rollback().await {
                        warn!("Rollback after failed create of {} failed: {}", schema.name, rb);
                    }
                    e
                }
            };

            if attempt >= attempts {
                return Err(Error::schema(format!(
                    "creating table {} failed after {} attempts: {}",
                    schema.name, attempts, err
                )));
            }
            warn!(
                "Create table {} attempt {}/{} failed: {}",
                schema.name, attempt, attempts, err
            );
            attempt += 1;
            tokio::time::sleep(self.options.create_retry_delay).await;
        }
    }
}
