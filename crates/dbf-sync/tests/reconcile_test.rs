//! Tests for dbf-sync reconcile module

mod common;

use common::{receipts, MemoryDb};
use dbf_sync::prelude::*;

// ==================== Helpers ====================

async fn table_for(db: &MemoryDb, file: &str, records: &[Record]) {
    let schema = TableSchema::infer(&table_name_for(file), records).unwrap();
    let conn = db.connection();
    conn.execute(&MySqlDialect.create_table_sql(&schema), &[])
        .await
        .unwrap();
}

// ==================== Insert / Update ====================

#[tokio::test]
async fn test_first_pass_inserts_second_pass_updates() {
    let db = MemoryDb::new();
    let records = receipts(5);
    table_for(&db, "recibos.dbf", &records).await;
    let conn = db.connection();
    let options = ReconcileOptions::default();

    let first = reconcile(&conn, &MySqlDialect, "recibos", &records, &options).await;
    assert_eq!(first.inserted, 5);
    assert_eq!(first.updated, 0);
    assert!(first.errors.is_empty());

    let second = reconcile(&conn, &MySqlDialect, "recibos", &records, &options).await;
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 5);
    assert!(second.errors.is_empty());

    assert_eq!(db.row_count("recibos"), 5);
}

#[tokio::test]
async fn test_changed_record_is_inserted_not_updated() {
    let db = MemoryDb::new();
    let mut records = receipts(3);
    table_for(&db, "recibos.dbf", &records).await;
    let conn = db.connection();
    let options = ReconcileOptions::default();

    reconcile(&conn, &MySqlDialect, "recibos", &records, &options).await;

    records[1].push("IMPORTE", 999.99);
    let outcome = reconcile(&conn, &MySqlDialect, "recibos", &records, &options).await;
    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.updated, 2);

    // the previous version of the record is kept
    assert_eq!(db.row_count("recibos"), 4);
}

#[tokio::test]
async fn test_duplicate_records_in_one_batch() {
    let db = MemoryDb::new();
    let mut records = receipts(2);
    records.push(records[0].clone());
    table_for(&db, "recibos.dbf", &records).await;
    let conn = db.connection();

    let outcome = reconcile(
        &conn,
        &MySqlDialect,
        "recibos",
        &records,
        &ReconcileOptions::default(),
    )
    .await;
    assert_eq!(outcome.inserted, 2);
    assert_eq!(outcome.updated, 1);
    assert_eq!(db.row_count("recibos"), 2);
}

#[tokio::test]
async fn test_rows_carry_fingerprint_and_source_file() {
    let db = MemoryDb::new();
    let records = receipts(1);
    table_for(&db, "recibos.dbf", &records).await;
    let conn = db.connection();
    let options = ReconcileOptions::default().with_source_file("recibos.dbf");

    reconcile(&conn, &MySqlDialect, "recibos", &records, &options).await;

    let table = db.table("recibos").unwrap();
    let row = &table.rows[0];
    assert_eq!(
        row.get("control_hash"),
        Some(&Value::from(fingerprint(&records[0])))
    );
    assert_eq!(row.get("dbf_source"), Some(&Value::from("recibos.dbf")));
    assert_eq!(row.get("numero"), Some(&Value::Int(1000)));
    assert_eq!(row.get("cliente"), Some(&Value::from("Cliente 0")));
}

// ==================== Failure Isolation ====================

#[tokio::test]
async fn test_one_malformed_record_does_not_stop_the_batch() {
    let db = MemoryDb::new();
    let mut records = receipts(4);
    records[2].push("CLIENTE", "BOOM");
    table_for(&db, "recibos.dbf", &records).await;
    db.fail_on_value("BOOM");
    let conn = db.connection();

    let outcome = reconcile(
        &conn,
        &MySqlDialect,
        "recibos",
        &records,
        &ReconcileOptions::default(),
    )
    .await;
    assert_eq!(outcome.inserted, 3);
    assert_eq!(outcome.updated, 0);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].contains("record 2"));
    assert!(!outcome.is_aborted());

    let table = db.table("recibos").unwrap();
    assert_eq!(table.rows.len(), 3);
    assert!(table
        .rows
        .iter()
        .all(|r| r.get("cliente") != Some(&Value::from("BOOM"))));
}

#[tokio::test]
async fn test_every_record_accounted_for() {
    let db = MemoryDb::new();
    let mut records = receipts(10);
    records[3].push("CLIENTE", "BOOM");
    records[7].push("CLIENTE", "BOOM");
    table_for(&db, "recibos.dbf", &records).await;
    db.fail_on_value("BOOM");
    let conn = db.connection();

    let outcome = reconcile(
        &conn,
        &MySqlDialect,
        "recibos",
        &records,
        &ReconcileOptions::default().with_batch_size(3),
    )
    .await;
    assert_eq!(
        outcome.inserted + outcome.updated + outcome.errors.len(),
        records.len()
    );
    assert_eq!(outcome.errors.len(), 2);
}

#[tokio::test]
async fn test_missing_table_is_a_general_error() {
    let db = MemoryDb::new();
    let conn = db.connection();

    let outcome = reconcile(
        &conn,
        &MySqlDialect,
        "nope",
        &receipts(2),
        &ReconcileOptions::default(),
    )
    .await;
    assert_eq!(outcome.total(), 0);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.is_aborted());
    assert!(outcome.errors[0].contains("nope"));
}

#[tokio::test]
async fn test_invalid_table_name_is_rejected_before_any_statement() {
    let db = MemoryDb::new();
    let conn = db.connection();

    let outcome = reconcile(
        &conn,
        &MySqlDialect,
        "x`; DROP TABLE y",
        &receipts(1),
        &ReconcileOptions::default(),
    )
    .await;
    assert!(outcome.is_aborted());
    assert_eq!(db.statements(), 0);
}

// ==================== Batching ====================

#[tokio::test]
async fn test_commits_once_per_chunk() {
    let db = MemoryDb::new();
    let records = receipts(250);
    table_for(&db, "recibos.dbf", &records).await;
    let conn = db.connection();

    let outcome = reconcile(
        &conn,
        &MySqlDialect,
        "recibos",
        &records,
        &ReconcileOptions::default(),
    )
    .await;
    assert_eq!(outcome.inserted, 250);
    assert_eq!(db.commits(), 3);
}

#[tokio::test]
async fn test_failure_after_committed_chunk_keeps_committed_counts() {
    let db = MemoryDb::new();
    let records = receipts(4);
    table_for(&db, "recibos.dbf", &records).await;
    db.fail_begin(2);
    let conn = db.connection();

    let outcome = reconcile(
        &conn,
        &MySqlDialect,
        "recibos",
        &records,
        &ReconcileOptions::default().with_batch_size(2),
    )
    .await;

    assert_eq!(outcome.inserted, 2);
    assert_eq!(outcome.updated, 0);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].starts_with("General error"));
    assert!(outcome.is_aborted());
    assert!(!outcome.is_success());
    assert_eq!(db.commits(), 1);
    assert_eq!(db.row_count("recibos"), 2);
}

#[tokio::test]
async fn test_empty_batch_touches_nothing() {
    let db = MemoryDb::new();
    let conn = db.connection();

    let outcome = reconcile(
        &conn,
        &MySqlDialect,
        "recibos",
        &[],
        &ReconcileOptions::default(),
    )
    .await;
    assert_eq!(outcome, ReconcileOutcome::default());
    assert_eq!(db.statements(), 0);
}

// ==================== Column Mapping ====================

#[tokio::test]
async fn test_fields_without_columns_are_dropped() {
    let db = MemoryDb::new();
    let records = receipts(2);
    table_for(&db, "recibos.dbf", &records).await;
    let conn = db.connection();

    let widened: Vec<Record> = records
        .iter()
        .cloned()
        .map(|mut r| {
            r.push("NUEVO", "campo agregado");
            r
        })
        .collect();

    let outcome = reconcile(
        &conn,
        &MySqlDialect,
        "recibos",
        &widened,
        &ReconcileOptions::default(),
    )
    .await;
    assert_eq!(outcome.inserted, 2);
    assert!(outcome.errors.is_empty());

    let table = db.table("recibos").unwrap();
    assert!(!table.columns.contains(&"nuevo".to_string()));
    assert!(table.rows.iter().all(|r| !r.contains_key("nuevo")));
}
