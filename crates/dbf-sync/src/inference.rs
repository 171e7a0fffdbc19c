//! Column type inference from sampled DBF records
//!
//! One `ColumnType` is decided per field and per synchronization pass, from a
//! sample value and the full population read from the source file. Nothing is
//! cached between passes.

use tracing::warn;

use crate::types::{Record, Value};

/// Field names always stored as opaque identifiers (tax id, national id, code).
pub const IDENTIFIER_FIELDS: &[&str] = &["cuit", "cuil", "dni", "codigo"];

/// Width of identifier columns
pub const IDENTIFIER_WIDTH: u32 = 20;

/// Margin added to the longest observed text value
pub const TEXT_PADDING: usize = 10;

/// Largest bounded text column; anything longer becomes unbounded text
pub const MAX_VARCHAR: usize = 255;

/// Decimal precision used for floating-point fields
pub const DECIMAL_PRECISION: u8 = 15;

/// Decimal scale used for floating-point fields
pub const DECIMAL_SCALE: u8 = 2;

/// Inferred storage type of a destination column.
///
/// Text variants always carry the wide character set and collation; the
/// dialect renders them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Bounded text, sized in characters
    Varchar(u32),
    /// Unbounded text
    Text,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    BigInt,
    /// Fixed-precision decimal
    Decimal {
        /// Total digits
        precision: u8,
        /// Digits after the decimal point
        scale: u8,
    },
    /// Combined date and time
    DateTime,
    /// Boolean
    Boolean,
}

/// Whether a field name is treated as an opaque identifier
pub fn is_identifier_field(field_name: &str) -> bool {
    let lower = field_name.to_lowercase();
    IDENTIFIER_FIELDS.contains(&lower.as_str())
}

/// Decide the column type for `field_name`.
///
/// Rules, in priority order: identifier names, text sized from the
/// population, integer width, decimal, date-time, boolean, text fallback.
pub fn infer_column_type(field_name: &str, sample: &Value, population: &[Record]) -> ColumnType {
    if is_identifier_field(field_name) {
        return ColumnType::Varchar(IDENTIFIER_WIDTH);
    }

    match sample {
        Value::String(s) => match max_text_len(field_name, population) {
            Ok(observed) => {
                let len = observed.max(s.chars().count()) + TEXT_PADDING;
                if len <= MAX_VARCHAR {
                    ColumnType::Varchar(len as u32)
                } else {
                    ColumnType::Text
                }
            }
            Err(missing_at) => {
                warn!(
                    "Could not compute length for field {} (missing in record {}), using TEXT",
                    field_name, missing_at
                );
                ColumnType::Text
            }
        },
        Value::Int(n) => {
            if n.unsigned_abs() > i32::MAX as u64 {
                ColumnType::BigInt
            } else {
                ColumnType::Int
            }
        }
        Value::Float(_) => ColumnType::Decimal {
            precision: DECIMAL_PRECISION,
            scale: DECIMAL_SCALE,
        },
        Value::Date(_) | Value::DateTime(_) => ColumnType::DateTime,
        Value::Bool(_) => ColumnType::Boolean,
        Value::Null => ColumnType::Text,
    }
}

/// Longest textual rendering of `field_name` across the population.
///
/// Returns the index of the first record lacking the field as the error.
fn max_text_len(field_name: &str, population: &[Record]) -> std::result::Result<usize, usize> {
    let mut max = 0;
    for (idx, record) in population.iter().enumerate() {
        let value = record.get(field_name).ok_or(idx)?;
        max = max.max(value.text_len());
    }
    Ok(max)
}

/// Pick the value used to type a field: the first non-null value in the
/// population, else whatever the first record holds.
pub fn sample_value<'a>(field_name: &str, population: &'a [Record]) -> Option<&'a Value> {
    population
        .iter()
        .filter_map(|r| r.get(field_name))
        .find(|v| !v.is_null())
        .or_else(|| population.first().and_then(|r| r.get(field_name)))
}
