//! In-memory database, record source and connection factory for integration tests
//!
//! The database understands exactly the statements the MySQL dialect
//! generates. Transactions work on a copy of the tables; savepoints snapshot
//! that copy and commit publishes it. CREATE and DROP inside a transaction
//! commit implicitly, as they do on MySQL.

#![allow(dead_code)]

use async_trait::async_trait;
use dbf_sync::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};
use dbf_sync::error::{Error, Result};
use dbf_sync::source::RecordSource;
use dbf_sync::types::{Record, Row, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

#[derive(Debug, Clone, Default)]
pub struct MemTable {
    pub columns: Vec<String>,
    pub rows: Vec<HashMap<String, Value>>,
}

type Tables = BTreeMap<String, MemTable>;

/// Injected statement failures
#[derive(Default)]
struct Faults {
    creates: u32,
    copies: u32,
}

#[derive(Default)]
struct DbState {
    tables: Tables,
    statements: usize,
    commits: usize,
    begins: usize,
    fail_value: Option<Value>,
    fail_begin: Option<usize>,
    faults: Faults,
}

/// Shared in-memory database
#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<DbState>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> MemoryConnection {
        MemoryConnection { db: self.clone() }
    }

    /// Inserts and updates binding this value fail
    pub fn fail_on_value(&self, value: impl Into<Value>) {
        self.state.lock().unwrap().fail_value = Some(value.into());
    }

    /// The next `n` CREATE TABLE statements fail
    pub fn fail_next_creates(&self, n: u32) {
        self.state.lock().unwrap().faults.creates = n;
    }

    /// The next `n` INSERT ... SELECT copies fail
    pub fn fail_next_copies(&self, n: u32) {
        self.state.lock().unwrap().faults.copies = n;
    }

    /// The `nth` BEGIN (1-based, counted from now) fails
    pub fn fail_begin(&self, nth: usize) {
        let mut state = self.state.lock().unwrap();
        state.fail_begin = Some(state.begins + nth);
    }

    pub fn statements(&self) -> usize {
        self.state.lock().unwrap().statements
    }

    pub fn commits(&self) -> usize {
        self.state.lock().unwrap().commits
    }

    pub fn table(&self, name: &str) -> Option<MemTable> {
        self.state.lock().unwrap().tables.get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.state.lock().unwrap().tables.keys().cloned().collect()
    }

    pub fn row_count(&self, name: &str) -> usize {
        self.table(name).map(|t| t.rows.len()).unwrap_or(0)
    }

    fn run(&self, sql: &str, params: &[Value]) -> Result<Outcome> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.statements += 1;
        apply(
            &mut state.tables,
            &mut state.faults,
            state.fail_value.as_ref(),
            sql,
            params,
        )
    }
}

enum Outcome {
    Rows(Vec<Row>),
    Affected(u64),
}

impl Outcome {
    fn rows(self) -> Vec<Row> {
        match self {
            Outcome::Rows(rows) => rows,
            Outcome::Affected(_) => Vec::new(),
        }
    }

    fn affected(self) -> u64 {
        match self {
            Outcome::Rows(rows) => rows.len() as u64,
            Outcome::Affected(n) => n,
        }
    }
}

/// Backtick-quoted identifiers in order of appearance
fn identifiers(sql: &str) -> Vec<String> {
    sql.split('`')
        .skip(1)
        .step_by(2)
        .map(|s| s.to_string())
        .collect()
}

fn param_str(params: &[Value], idx: usize) -> Result<String> {
    params
        .get(idx)
        .and_then(Value::as_string)
        .ok_or_else(|| Error::query(format!("missing parameter {}", idx)))
}

fn table_mut<'a>(tables: &'a mut Tables, name: &str) -> Result<&'a mut MemTable> {
    tables
        .get_mut(name)
        .ok_or_else(|| Error::query(format!("Table '{}' doesn't exist", name)))
}

fn check_injected_failure(fail_value: Option<&Value>, params: &[Value]) -> Result<()> {
    if let Some(bad) = fail_value {
        if params.contains(bad) {
            return Err(Error::query(format!("Incorrect value: {}", bad)));
        }
    }
    Ok(())
}

fn is_ddl(sql: &str) -> bool {
    sql.starts_with("CREATE TABLE") || sql.starts_with("DROP TABLE")
}

fn apply(
    tables: &mut Tables,
    faults: &mut Faults,
    fail_value: Option<&Value>,
    sql: &str,
    params: &[Value],
) -> Result<Outcome> {
    let idents = identifiers(sql);

    if sql.starts_with("SELECT COUNT(*) AS table_count FROM information_schema.tables") {
        let exists = tables.contains_key(&param_str(params, 0)?);
        return Ok(Outcome::Rows(vec![Row::new(
            vec!["table_count".into()],
            vec![Value::Int(exists as i64)],
        )]));
    }

    if sql.starts_with("SELECT column_name FROM information_schema.columns") {
        let rows = tables
            .get(&param_str(params, 0)?)
            .map(|t| {
                t.columns
                    .iter()
                    .map(|c| Row::new(vec!["column_name".into()], vec![Value::from(c.as_str())]))
                    .collect()
            })
            .unwrap_or_default();
        return Ok(Outcome::Rows(rows));
    }

    if sql.starts_with("SELECT 1 FROM") {
        let hash = params
            .first()
            .cloned()
            .ok_or_else(|| Error::query("missing hash"))?;
        let table = table_mut(tables, &idents[0])?;
        let found = table
            .rows
            .iter()
            .any(|r| r.get("control_hash") == Some(&hash));
        let rows = if found {
            vec![Row::new(vec!["1".into()], vec![Value::Int(1)])]
        } else {
            Vec::new()
        };
        return Ok(Outcome::Rows(rows));
    }

    if sql.starts_with("CREATE TABLE") && sql.contains(" LIKE ") {
        let columns = table_mut(tables, &idents[1])?.columns.clone();
        if tables.contains_key(&idents[0]) {
            return Err(Error::query(format!("Table '{}' already exists", idents[0])));
        }
        tables.insert(
            idents[0].clone(),
            MemTable {
                columns,
                rows: Vec::new(),
            },
        );
        return Ok(Outcome::Affected(0));
    }

    if sql.starts_with("CREATE TABLE IF NOT EXISTS") {
        if faults.creates > 0 {
            faults.creates -= 1;
            return Err(Error::query("Lock wait timeout exceeded"));
        }
        tables.entry(idents[0].clone()).or_insert(MemTable {
            columns: idents[1..].to_vec(),
            rows: Vec::new(),
        });
        return Ok(Outcome::Affected(0));
    }

    if sql.starts_with("DROP TABLE IF EXISTS") {
        tables.remove(&idents[0]);
        return Ok(Outcome::Affected(0));
    }

    if sql.starts_with("DROP TABLE") {
        tables
            .remove(&idents[0])
            .ok_or_else(|| Error::query(format!("Unknown table '{}'", idents[0])))?;
        return Ok(Outcome::Affected(0));
    }

    if sql.starts_with("INSERT INTO") && sql.contains("SELECT * FROM") {
        if faults.copies > 0 {
            faults.copies -= 1;
            return Err(Error::query("Lost connection to MySQL server during query"));
        }
        let rows = table_mut(tables, &idents[1])?.rows.clone();
        let target = table_mut(tables, &idents[0])?;
        let copied = rows.len() as u64;
        target.rows.extend(rows);
        return Ok(Outcome::Affected(copied));
    }

    if sql.starts_with("INSERT INTO") {
        check_injected_failure(fail_value, params)?;
        let columns = &idents[1..];
        if columns.len() != params.len() {
            return Err(Error::query("Column count doesn't match value count"));
        }
        let table = table_mut(tables, &idents[0])?;
        if let Some(missing) = columns.iter().find(|c| !table.columns.contains(*c)) {
            return Err(Error::query(format!("Unknown column '{}'", missing)));
        }

        let row: HashMap<String, Value> = columns
            .iter()
            .cloned()
            .zip(params.iter().cloned())
            .collect();
        if table
            .rows
            .iter()
            .any(|r| r.get("control_hash") == row.get("control_hash"))
        {
            return Err(Error::query("Duplicate entry for key 'control_hash'"));
        }
        table.rows.push(row);
        return Ok(Outcome::Affected(1));
    }

    if sql.starts_with("UPDATE") {
        check_injected_failure(fail_value, params)?;
        // table, SET columns..., sync_date, control_hash
        let set_columns = &idents[1..idents.len() - 2];
        if set_columns.len() + 1 != params.len() {
            return Err(Error::query("Placeholder count doesn't match"));
        }
        let hash = &params[params.len() - 1];
        let table = table_mut(tables, &idents[0])?;

        let mut affected = 0;
        for row in table
            .rows
            .iter_mut()
            .filter(|r| r.get("control_hash") == Some(hash))
        {
            for (col, value) in set_columns.iter().zip(params) {
                row.insert(col.clone(), value.clone());
            }
            row.insert("sync_date".into(), Value::from("now"));
            affected += 1;
        }
        return Ok(Outcome::Affected(affected));
    }

    Err(Error::query_with_sql("unsupported statement", sql))
}

/// Connection over a MemoryDb, autocommitting outside transactions
pub struct MemoryConnection {
    db: MemoryDb,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        Ok(self.db.run(sql, params)?.rows())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        Ok(self.db.run(sql, params)?.affected())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let mut state = self.db.state.lock().unwrap();
        state.statements += 1;
        state.begins += 1;
        if state.fail_begin == Some(state.begins) {
            return Err(Error::transaction("BEGIN failed: server has gone away"));
        }
        Ok(Box::new(MemoryTransaction {
            db: self.db.clone(),
            working: Mutex::new(state.tables.clone()),
            savepoints: Mutex::new(HashMap::new()),
        }))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryTransaction {
    db: MemoryDb,
    working: Mutex<Tables>,
    savepoints: Mutex<HashMap<String, Tables>>,
}

impl MemoryTransaction {
    fn run(&self, sql: &str, params: &[Value]) -> Result<Outcome> {
        let mut guard = self.db.state.lock().unwrap();
        let state = &mut *guard;
        state.statements += 1;
        let mut working = self.working.lock().unwrap();

        if !is_ddl(sql) {
            return apply(
                &mut working,
                &mut state.faults,
                state.fail_value.as_ref(),
                sql,
                params,
            );
        }

        // Implicit commit: pending work is published before the DDL runs.
        state.tables = working.clone();
        let outcome = apply(
            &mut state.tables,
            &mut state.faults,
            state.fail_value.as_ref(),
            sql,
            params,
        );
        *working = state.tables.clone();
        self.savepoints.lock().unwrap().clear();
        outcome
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        Ok(self.run(sql, params)?.rows())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        Ok(self.run(sql, params)?.affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let working = self.working.lock().unwrap().clone();
        let mut state = self.db.state.lock().unwrap();
        state.statements += 1;
        state.commits += 1;
        state.tables = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.db.state.lock().unwrap().statements += 1;
        Ok(())
    }

    async fn savepoint(&self, name: &str) -> Result<()> {
        self.db.state.lock().unwrap().statements += 1;
        let snapshot = self.working.lock().unwrap().clone();
        self.savepoints
            .lock()
            .unwrap()
            .insert(name.to_string(), snapshot);
        Ok(())
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.db.state.lock().unwrap().statements += 1;
        let snapshot = self
            .savepoints
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::transaction(format!("SAVEPOINT {} does not exist", name)))?;
        *self.working.lock().unwrap() = snapshot;
        Ok(())
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.db.state.lock().unwrap().statements += 1;
        self.savepoints.lock().unwrap().remove(name);
        Ok(())
    }
}

/// Record source backed by a map of file name to records
#[derive(Default)]
pub struct MemorySource {
    files: Mutex<HashMap<String, (Vec<Record>, SystemTime)>>,
    reads: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, file_name: &str, records: Vec<Record>) -> Self {
        self.set_file(file_name, records);
        self
    }

    /// Replace the contents of a file and bump its modification time
    pub fn set_file(&self, file_name: &str, records: Vec<Record>) {
        self.files
            .lock()
            .unwrap()
            .insert(file_name.to_string(), (records, SystemTime::now()));
    }

    /// Number of read_records calls so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn read_records(&self, file_name: &str) -> Result<Vec<Record>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .get(file_name)
            .map(|(records, _)| records.clone())
            .ok_or_else(|| Error::source(file_name, "file not found"))
    }

    async fn last_modified(&self, file_name: &str) -> Result<Option<SystemTime>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(file_name)
            .map(|(_, modified)| *modified))
    }
}

/// Factory that refuses the first `failures` connection attempts
pub struct FlakyFactory {
    db: MemoryDb,
    failures: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyFactory {
    pub fn new(db: MemoryDb, failures: u32) -> Self {
        Self {
            db,
            failures: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for FlakyFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let refuse = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(Error::connection(format!(
                "Can't connect to MySQL server (attempt {})",
                attempt
            )));
        }
        Ok(Box::new(self.db.connection()))
    }
}

/// Receipts as a DBF reader would decode them
pub fn receipts(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            Record::from_pairs([
                ("NUMERO", Value::Int(1000 + i as i64)),
                ("CLIENTE", Value::from(format!("Cliente {}", i))),
                ("IMPORTE", Value::Float(100.5 + i as f64)),
                ("DNI", Value::from(format!("{}", 30_000_000 + i))),
            ])
        })
        .collect()
}
