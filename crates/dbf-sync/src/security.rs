//! Identifier validation for names that end up in SQL text.
//!
//! Table and column names cannot be bound as parameters, so names derived
//! from file names or DBF headers are checked before they are quoted into
//! DDL/DML. Values never pass through here; they are always bound.

use crate::error::Error;

/// Validate a SQL identifier derived from a source file or field name.
///
/// - Must not be empty
/// - Maximum 64 characters (MySQL identifier limit)
/// - Must start with an ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters and underscores
///
/// # Examples
///
/// ```
/// use dbf_sync::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("recibos").is_ok());
/// assert!(validate_sql_identifier("con_gast").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE recibos--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("1abc").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > 64 {
        return Err(Error::config(format!(
            "SQL identifier too long: {} chars (max 64)",
            name.len()
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': contains invalid character '{}'",
                name, c
            )));
        }
    }

    Ok(())
}
