//! SQL dialect abstraction for dbf-sync
//!
//! Generates the statements the synchronizer, reconciler and backup manager
//! issue. DML goes through sea-query; DDL is assembled by hand because the
//! column types carry MySQL character-set clauses.
//!
//! - Identifier quoting
//! - Column type rendering
//! - Exists-by-hash / insert / update statements with `?` placeholders
//! - Table creation, drop, and snapshot copy

use crate::inference::ColumnType;
use crate::schema::{TableSchema, HASH_COLUMN, SOURCE_COLUMN, SYNC_DATE_COLUMN};
use sea_query::{Alias, Expr, IntoIden, MysqlQueryBuilder, Query, TableRef};

/// Character set used for every text column
pub const TEXT_CHARSET: &str = "utf8mb4";

/// Collation used for every text column
pub const TEXT_COLLATION: &str = "utf8mb4_unicode_ci";

fn sea_table_ref(table: &str) -> TableRef {
    TableRef::Table(Alias::new(table).into_iden())
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Render an inferred column type
    fn native_type(&self, column_type: &ColumnType) -> String;

    /// Query returning one row with a count > 0 when `table` exists.
    /// Binds the table name as its only parameter.
    fn table_exists_sql(&self) -> String;

    /// Query listing the column names of a table in ordinal order.
    /// Binds the table name as its only parameter.
    fn list_columns_sql(&self) -> String;

    /// `CREATE TABLE IF NOT EXISTS` for a table schema, synthetic columns included
    fn create_table_sql(&self, schema: &TableSchema) -> String;

    /// Drop a table
    fn drop_table_sql(&self, table: &str) -> String;

    /// Select a constant row when a row with the given hash exists
    fn exists_by_hash_sql(&self, table: &str) -> String;

    /// Insert into `columns`, one placeholder per column in the same order
    fn insert_sql(&self, table: &str, columns: &[&str]) -> String;

    /// Update `set_columns` (one placeholder each, in order), refresh the sync
    /// timestamp, keyed by a trailing hash placeholder
    fn update_sql(&self, table: &str, set_columns: &[&str]) -> String;

    /// Create `target` with the structure of `source`
    fn create_table_like_sql(&self, target: &str, source: &str) -> String;

    /// Copy every row of `source` into `target`
    fn copy_rows_sql(&self, target: &str, source: &str) -> String;

    /// Get current timestamp expression
    fn current_timestamp(&self) -> &'static str;
}

// ===========================================================================
// MySQL
// ===========================================================================

/// MySQL dialect
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

/// `CREATE TABLE IF NOT EXISTS` shared by the MySQL family: inferred columns
/// first, then identity, hash, sync timestamp and source file columns.
fn mysql_family_create_table(dialect: &dyn SqlDialect, schema: &TableSchema) -> String {
    let mut columns: Vec<String> = schema
        .columns
        .iter()
        .map(|col| {
            format!(
                "{} {}",
                dialect.quote_identifier(&col.name),
                dialect.native_type(&col.column_type)
            )
        })
        .collect();

    columns.push(format!(
        "{} INT AUTO_INCREMENT PRIMARY KEY",
        dialect.quote_identifier(&schema.identity_column())
    ));
    columns.push(format!(
        "{} VARCHAR(32) NOT NULL UNIQUE",
        dialect.quote_identifier(HASH_COLUMN)
    ));
    columns.push(format!(
        "{} DATETIME DEFAULT {}",
        dialect.quote_identifier(SYNC_DATE_COLUMN),
        dialect.current_timestamp()
    ));
    columns.push(format!(
        "{} VARCHAR(255) DEFAULT NULL",
        dialect.quote_identifier(SOURCE_COLUMN)
    ));

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n) ENGINE=InnoDB DEFAULT CHARSET={}",
        dialect.quote_identifier(&schema.name),
        columns.join(",\n  "),
        TEXT_CHARSET
    )
}

fn text_type(base: &str) -> String {
    format!(
        "{} CHARACTER SET {} COLLATE {}",
        base, TEXT_CHARSET, TEXT_COLLATION
    )
}

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn native_type(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::Varchar(len) => text_type(&format!("VARCHAR({})", len)),
            ColumnType::Text => text_type("TEXT"),
            ColumnType::Int => "INT".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Decimal { precision, scale } => {
                format!("DECIMAL({},{})", precision, scale)
            }
            ColumnType::DateTime => "DATETIME".to_string(),
            ColumnType::Boolean => "TINYINT(1)".to_string(),
        }
    }

    fn table_exists_sql(&self) -> String {
        "SELECT COUNT(*) AS table_count FROM information_schema.tables \
         WHERE table_schema = DATABASE() AND table_name = ?"
            .to_string()
    }

    fn list_columns_sql(&self) -> String {
        "SELECT column_name FROM information_schema.columns \
         WHERE table_schema = DATABASE() AND table_name = ? \
         ORDER BY ordinal_position"
            .to_string()
    }

    fn create_table_sql(&self, schema: &TableSchema) -> String {
        mysql_family_create_table(self, schema)
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote_identifier(table))
    }

    fn exists_by_hash_sql(&self, table: &str) -> String {
        let mut stmt = Query::select();
        stmt.expr(Expr::cust("1"))
            .from(sea_table_ref(table))
            .and_where(Expr::col(Alias::new(HASH_COLUMN)).eq(Expr::cust("?")))
            .limit(1);

        stmt.to_string(MysqlQueryBuilder)
    }

    fn insert_sql(&self, table: &str, columns: &[&str]) -> String {
        let col_idens: Vec<_> = columns.iter().map(|c| Alias::new(*c).into_iden()).collect();
        let values: Vec<_> = columns.iter().map(|_| Expr::cust("?")).collect();

        let mut stmt = Query::insert();
        stmt.into_table(sea_table_ref(table))
            .columns(col_idens)
            .values_panic(values);

        stmt.to_string(MysqlQueryBuilder)
    }

    fn update_sql(&self, table: &str, set_columns: &[&str]) -> String {
        let mut stmt = Query::update();
        stmt.table(sea_table_ref(table));
        for col in set_columns {
            stmt.value(Alias::new(*col), Expr::cust("?"));
        }
        stmt.value(
            Alias::new(SYNC_DATE_COLUMN),
            Expr::cust(self.current_timestamp()),
        );
        stmt.and_where(Expr::col(Alias::new(HASH_COLUMN)).eq(Expr::cust("?")));

        stmt.to_string(MysqlQueryBuilder)
    }

    fn create_table_like_sql(&self, target: &str, source: &str) -> String {
        format!(
            "CREATE TABLE {} LIKE {}",
            self.quote_identifier(target),
            self.quote_identifier(source)
        )
    }

    fn copy_rows_sql(&self, target: &str, source: &str) -> String {
        format!(
            "INSERT INTO {} SELECT * FROM {}",
            self.quote_identifier(target),
            self.quote_identifier(source)
        )
    }

    fn current_timestamp(&self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }
}

// ===========================================================================
// MariaDB: MySQL syntax with a native BOOLEAN alias
// ===========================================================================

/// MariaDB dialect
#[derive(Debug, Clone, Default)]
pub struct MariaDbDialect;

impl SqlDialect for MariaDbDialect {
    fn name(&self) -> &'static str {
        "MariaDB"
    }

    fn quote_identifier(&self, name: &str) -> String {
        MySqlDialect.quote_identifier(name)
    }

    fn native_type(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::Boolean => "BOOLEAN".to_string(),
            other => MySqlDialect.native_type(other),
        }
    }

    fn table_exists_sql(&self) -> String {
        MySqlDialect.table_exists_sql()
    }

    fn list_columns_sql(&self) -> String {
        MySqlDialect.list_columns_sql()
    }

    fn create_table_sql(&self, schema: &TableSchema) -> String {
        mysql_family_create_table(self, schema)
    }

    fn drop_table_sql(&self, table: &str) -> String {
        MySqlDialect.drop_table_sql(table)
    }

    fn exists_by_hash_sql(&self, table: &str) -> String {
        MySqlDialect.exists_by_hash_sql(table)
    }

    fn insert_sql(&self, table: &str, columns: &[&str]) -> String {
        MySqlDialect.insert_sql(table, columns)
    }

    fn update_sql(&self, table: &str, set_columns: &[&str]) -> String {
        MySqlDialect.update_sql(table, set_columns)
    }

    fn create_table_like_sql(&self, target: &str, source: &str) -> String {
        MySqlDialect.create_table_like_sql(target, source)
    }

    fn copy_rows_sql(&self, target: &str, source: &str) -> String {
        MySqlDialect.copy_rows_sql(target, source)
    }

    fn current_timestamp(&self) -> &'static str {
        MySqlDialect.current_timestamp()
    }
}

/// Get a dialect by name (`mysql` or `mariadb`)
pub fn dialect_for(name: &str) -> Box<dyn SqlDialect> {
    match name.to_lowercase().as_str() {
        "mariadb" => Box::new(MariaDbDialect),
        _ => Box::new(MySqlDialect),
    }
}
