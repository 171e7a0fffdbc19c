//! Timestamped table snapshots

use chrono::NaiveDateTime;
use tracing::{error, info, warn};

use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::security::validate_sql_identifier;

/// Format of the timestamp suffix
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// `<table>_backup_<YYYYMMDD_HHMMSS>`
pub fn backup_table_name(table: &str, at: NaiveDateTime) -> String {
    format!("{}_backup_{}", table, at.format(BACKUP_TIMESTAMP_FORMAT))
}

/// Copy `table` into a new timestamped table, returning its name.
///
/// Structure is cloned with `CREATE TABLE ... LIKE`, then every row is copied
/// with one `INSERT ... SELECT`. The source table is only read. A failed copy
/// leaves no backup table behind.
pub async fn try_backup_table(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    table: &str,
) -> Result<String> {
    validate_sql_identifier(table)?;
    let backup = backup_table_name(table, chrono::Local::now().naive_local());
    validate_sql_identifier(&backup)?;

    // CREATE TABLE commits implicitly on MySQL, so the copy cannot share its
    // transaction. Dropping the new table undoes it instead.
    conn.execute(&dialect.create_table_like_sql(&backup, table), &[])
        .await
        .map_err(|e| {
            Error::backup(format!(
                "creating {} like {} failed: {}",
                backup, table, e
            ))
        })?;

    match copy_rows(conn, dialect, &backup, table).await {
        Ok(rows) => {
            info!("Backed up {} rows of {} into {}", rows, table, backup);
            Ok(backup)
        }
        Err(e) => {
            if let Err(drop_err) = conn.execute(&dialect.drop_table_sql(&backup), &[]).await {
                warn!("Dropping incomplete backup {} failed: {}", backup, drop_err);
            }
            Err(Error::backup(format!(
                "backup of {} into {} failed: {}",
                table, backup, e
            )))
        }
    }
}

async fn copy_rows(
    conn: &dyn Connection,
    dialect: &dyn SqlDialect,
    backup: &str,
    table: &str,
) -> Result<u64> {
    let tx = conn.begin().await?;
    match tx.execute(&dialect.copy_rows_sql(backup, table), &[]).await {
        Ok(rows) => {
            tx.commit().await?;
            Ok(rows)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                warn!("Rollback of backup {} failed: {}", backup, rb);
            }
            Err(e)
        }
    }
}

/// Snapshot `table`; failures are logged and reported as `false`
pub async fn backup_table(conn: &dyn Connection, dialect: &dyn SqlDialect, table: &str) -> bool {
    match try_backup_table(conn, dialect, table).await {
        Ok(_) => true,
        Err(e) => {
            error!("Error creating backup of {}: {}", table, e);
            false
        }
    }
}
