//! # dbf-sync
//!
//! Synchronizes legacy DBF tables into MySQL / MariaDB.
//!
//! On first encounter of a source file the destination table is created from
//! types inferred over the file's records. Every pass after that upserts the
//! records keyed by a content fingerprint: unseen content is inserted, known
//! content is touched, and nothing is ever deleted.
//!
//! ## Features
//!
//! - **Type Inference**: column types and text widths sized from the data
//! - **Fingerprints**: MD5 of a canonical record rendering, independent of field order
//! - **Reconciliation**: per-record savepoints, commits per chunk
//! - **Backups**: timestamped `CREATE TABLE ... LIKE` snapshots
//! - **Retrying Connections**: bounded attempts with a fixed delay
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dbf_sync::prelude::*;
//! use std::sync::Arc;
//!
//! let config = SyncConfig::from_file("dbf-sync.yaml".as_ref())?;
//! let conn = connect_with_retry(
//!     &MySqlConnectionFactory,
//!     &config.database.to_connection_config()?,
//!     config.sync.retry_policy(),
//! )
//! .await?;
//!
//! let dialect: Arc<dyn SqlDialect> = Arc::from(config.database.sql_dialect());
//! let source = Arc::new(DbfSource::new(&config.source.folder));
//! let runner = SyncRunner::new(conn, dialect, source, config.source.files, config.sync);
//! let report = runner.sync_file("recibos.dbf").await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `mysql` - MySQL/MariaDB backend via mysql_async
//! - `dbf` - DBF file reader via dbase

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod backup;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod hash;
pub mod inference;
pub mod reconcile;
pub mod runner;
pub mod schema;
pub mod security;
pub mod source;
pub mod types;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, Result};

    pub use crate::types::{Record, Row, Value};

    pub use crate::connection::{
        connect_with_retry, Connection, ConnectionConfig, ConnectionFactory, RetryPolicy,
        Transaction,
    };

    pub use crate::dialect::{dialect_for, MariaDbDialect, MySqlDialect, SqlDialect};

    pub use crate::hash::fingerprint;
    pub use crate::inference::{infer_column_type, ColumnType};
    pub use crate::schema::{
        table_name_for, ColumnDef, SchemaOptions, SchemaSynchronizer, TableOutcome, TableSchema,
    };

    pub use crate::backup::{backup_table, try_backup_table};
    pub use crate::reconcile::{reconcile, ReconcileOptions, ReconcileOutcome};

    pub use crate::config::{SensitiveString, SyncConfig, SyncSettings};
    pub use crate::runner::{FileReport, SyncRunner};
    pub use crate::source::RecordSource;

    #[cfg(feature = "dbf")]
    pub use crate::source::DbfSource;

    #[cfg(feature = "mysql")]
    pub use crate::mysql::{MySqlConnection, MySqlConnectionFactory};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::{Record, Value};
