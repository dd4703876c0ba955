//! Schema introspection and execution against a real database file

use askdb_duck::{DuckQueryExecutor, DuckSchemaService};
use askdb_pipeline::{QueryExecutor, SchemaService};
use askdb_state::RiskTier;
use duckdb::Connection;
use std::path::PathBuf;
use tempfile::TempDir;

fn shop() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shop.duckdb");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name VARCHAR NOT NULL);
         CREATE TABLE orders (
             id INTEGER,
             customer_id INTEGER REFERENCES customers(id),
             total DOUBLE,
             placed DATE
         );
         INSERT INTO customers VALUES (1, 'Ada'), (2, 'Grace');
         INSERT INTO orders VALUES
             (10, 1, 25.5, DATE '2024-01-01'),
             (11, 1, NULL, DATE '2024-01-02'),
             (12, 2, 7.0, DATE '2024-01-03');",
    )
    .unwrap();
    drop(conn);

    (dir, path)
}

#[tokio::test]
async fn test_schema_lists_tables_columns_and_samples() {
    let (_dir, path) = shop();
    let schema = DuckSchemaService::new(&path)
        .with_sample_rows(2)
        .load_schema()
        .await
        .unwrap();

    assert_eq!(schema.table_names().collect::<Vec<_>>(), vec!["customers", "orders"]);

    let orders = schema.table("orders").unwrap();
    assert_eq!(orders.row_count, 3);
    assert_eq!(
        orders.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        vec!["id", "customer_id", "total", "placed"]
    );
    assert_eq!(orders.find_column("total").unwrap().data_type, "DOUBLE");
    assert!(orders.find_column("total").unwrap().nullable);
    assert!(orders.find_column("id").unwrap().sample_values.len() <= 2);

    let customers = schema.table("customers").unwrap();
    assert!(!customers.find_column("name").unwrap().nullable);

    let link = orders
        .relationships
        .iter()
        .find(|r| r.references_table == "customers")
        .expect("foreign key to customers");
    assert_eq!(link.columns, vec!["customer_id"]);
    assert_eq!(link.references_columns, vec!["id"]);
}

#[tokio::test]
async fn test_schema_of_missing_database_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let service = DuckSchemaService::new(dir.path().join("nowhere.duckdb"));
    assert!(service.load_schema().await.is_err());
}

#[tokio::test]
async fn test_count_orders() {
    let (_dir, path) = shop();
    let executor = DuckQueryExecutor::new(&path);

    let result = executor
        .execute("SELECT COUNT(*) AS n FROM orders", true, RiskTier::Low)
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.row_count, 1);
    assert_eq!(result.rows[0]["n"], 3);
    assert_eq!(result.columns.len(), 1);
    assert_eq!(result.columns[0].name, "n");
    assert!(!result.truncated);
}

#[tokio::test]
async fn test_values_are_converted() {
    let (_dir, path) = shop();
    let executor = DuckQueryExecutor::new(&path);

    let result = executor
        .execute(
            "SELECT o.id, c.name, o.total, o.placed \
             FROM orders o JOIN customers c ON c.id = o.customer_id \
             ORDER BY o.id",
            true,
            RiskTier::Medium,
        )
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.row_count, 3);
    assert_eq!(result.rows[0]["name"], "Ada");
    assert_eq!(result.rows[0]["total"], 25.5);
    assert!(result.rows[1]["total"].is_null());
    assert_eq!(result.rows[2]["placed"], "2024-01-03");
}

#[tokio::test]
async fn test_rows_are_capped() {
    let (_dir, path) = shop();
    let executor = DuckQueryExecutor::new(&path).with_max_rows(2);

    let result = executor
        .execute("SELECT * FROM orders", true, RiskTier::Low)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.row_count, 2);
    assert!(result.truncated);
}

#[tokio::test]
async fn test_refusals_do_not_touch_the_database() {
    let (_dir, path) = shop();
    let executor = DuckQueryExecutor::new(&path);

    for (sql, validated, tier, reason) in [
        ("SELECT 1", false, RiskTier::Low, "query was not validated"),
        ("SELECT 1", true, RiskTier::High, "risk tier HIGH queries are not executed"),
        (
            "DELETE FROM orders",
            true,
            RiskTier::Low,
            "only read-only SELECT/WITH statements may be executed",
        ),
        (
            r"SELECT E'\'' ; DROP TABLE orders; --'",
            true,
            RiskTier::Low,
            "only read-only SELECT/WITH statements may be executed",
        ),
    ] {
        let result = executor.execute(sql, validated, tier).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(reason));
    }

    let count = executor
        .execute("SELECT COUNT(*) AS n FROM orders", true, RiskTier::Low)
        .await
        .unwrap();
    assert_eq!(count.rows[0]["n"], 3);
}

#[tokio::test]
async fn test_sql_error_is_reported_not_raised() {
    let (_dir, path) = shop();
    let executor = DuckQueryExecutor::new(&path);

    let result = executor
        .execute("SELECT * FROM invoices", true, RiskTier::Low)
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("invoices"));
    assert!(result.rows.is_empty());
}
