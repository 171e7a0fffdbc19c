//! Record sources
//!
//! Provides:
//! - RecordSource: yields the records of one named source file
//! - DbfSource: reads DBF tables from a folder (feature `dbf`)

use async_trait::async_trait;
use std::time::SystemTime;

use crate::error::Result;
use crate::types::Record;

/// Supplier of decoded records, one source file at a time
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Read every record of `file_name`, fields in file order
    async fn read_records(&self, file_name: &str) -> Result<Vec<Record>>;

    /// Last modification time of `file_name`, when the source can tell.
    ///
    /// `None` means the file is synced on every scan.
    async fn last_modified(&self, _file_name: &str) -> Result<Option<SystemTime>> {
        Ok(None)
    }
}

#[cfg(feature = "dbf")]
pub use self::dbf::DbfSource;

#[cfg(feature = "dbf")]
mod dbf {
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use dbase::FieldValue;
    use std::path::{Path, PathBuf};
    use std::time::SystemTime;
    use tracing::debug;

    use super::RecordSource;
    use crate::error::{Error, Result};
    use crate::types::{Record, Value};

    /// DBF tables stored in one folder
    #[derive(Debug, Clone)]
    pub struct DbfSource {
        folder: PathBuf,
    }

    impl DbfSource {
        /// Read files relative to `folder`
        pub fn new(folder: impl Into<PathBuf>) -> Self {
            Self {
                folder: folder.into(),
            }
        }

        /// Full path of a source file
        pub fn path_for(&self, file_name: &str) -> PathBuf {
            self.folder.join(file_name)
        }
    }

    fn date_value(date: &dbase::Date) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(date.year() as i32, date.month(), date.day())
    }

    /// Map a decoded DBF field onto a Value.
    ///
    /// Numeric fields without a fractional part become integers.
    pub(crate) fn field_to_value(field: FieldValue) -> Value {
        match field {
            FieldValue::Character(s) => s
                .map(|s| Value::String(s.trim_end().to_string()))
                .unwrap_or(Value::Null),
            FieldValue::Memo(s) => Value::String(s.trim_end().to_string()),
            FieldValue::Numeric(n) => n.map(number_value).unwrap_or(Value::Null),
            FieldValue::Float(f) => f.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null),
            FieldValue::Integer(i) => Value::Int(i as i64),
            FieldValue::Double(d) => Value::Float(d),
            FieldValue::Currency(c) => Value::Float(c),
            FieldValue::Logical(b) => b.map(Value::Bool).unwrap_or(Value::Null),
            FieldValue::Date(d) => d
                .as_ref()
                .and_then(date_value)
                .map(Value::Date)
                .unwrap_or(Value::Null),
            FieldValue::DateTime(dt) => {
                let time = dt.time();
                date_value(&dt.date())
                    .zip(NaiveTime::from_hms_opt(
                        time.hours(),
                        time.minutes(),
                        time.seconds(),
                    ))
                    .map(|(d, t)| Value::DateTime(NaiveDateTime::new(d, t)))
                    .unwrap_or(Value::Null)
            }
            #[allow(unreachable_patterns)]
            _ => Value::Null,
        }
    }

    fn number_value(n: f64) -> Value {
        if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
            Value::Int(n as i64)
        } else {
            Value::Float(n)
        }
    }

    fn read_file(path: &Path, file_name: &str) -> Result<Vec<Record>> {
        let mut reader = dbase::Reader::from_path(path)
            .map_err(|e| Error::source(file_name, format!("cannot open: {}", e)))?;
        let field_names: Vec<String> = reader
            .fields()
            .iter()
            .map(|f| f.name().to_string())
            .collect();

        let rows = reader
            .read()
            .map_err(|e| Error::source(file_name, format!("cannot read records: {}", e)))?;

        let records = rows
            .into_iter()
            .map(|mut row| {
                let mut record = Record::new();
                for name in &field_names {
                    let value = row
                        .remove(name)
                        .map(field_to_value)
                        .unwrap_or(Value::Null);
                    record.push(name.clone(), value);
                }
                record
            })
            .collect();
        Ok(records)
    }

    #[async_trait]
    impl RecordSource for DbfSource {
        async fn read_records(&self, file_name: &str) -> Result<Vec<Record>> {
            let path = self.path_for(file_name);
            let name = file_name.to_string();

            let records = tokio::task::spawn_blocking(move || read_file(&path, &name))
                .await
                .map_err(|e| Error::internal(format!("reader task failed: {}", e)))??;

            debug!("Read {} records from {}", records.len(), file_name);
            Ok(records)
        }

        async fn last_modified(&self, file_name: &str) -> Result<Option<SystemTime>> {
            let metadata = tokio::fs::metadata(self.path_for(file_name))
                .await
                .map_err(|e| Error::source(file_name, format!("cannot stat: {}", e)))?;
            Ok(metadata.modified().ok())
        }
    }

}
