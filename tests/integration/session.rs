//! Session state integration tests: broadcast commands, transactions and
//! prepared statements

use crate::{get_proxy_config, skip_if_not_enabled, HR_DB, SALES_DB};
use mysql::prelude::*;

#[test]
fn test_user_variable_set_on_every_shard() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    conn.query_drop("SET @it_marker = 42").expect("SET should succeed");

    let on_sales: Option<i64> = conn
        .query_first(format!("SELECT @it_marker FROM {SALES_DB}.orders LIMIT 1"))
        .unwrap();
    let on_hr: Option<i64> = conn
        .query_first(format!("SELECT @it_marker FROM {HR_DB}.people LIMIT 1"))
        .unwrap();
    assert_eq!(on_sales, Some(42));
    assert_eq!(on_hr, Some(42));
}

#[test]
fn test_rollback_discards_writes() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    conn.query_drop("BEGIN").unwrap();
    conn.query_drop(format!("INSERT INTO {SALES_DB}.orders VALUES (900, 1)"))
        .unwrap();
    let inside: Option<i64> = conn
        .query_first(format!("SELECT COUNT(*) FROM {SALES_DB}.orders WHERE id = 900"))
        .unwrap();
    assert_eq!(inside, Some(1));
    conn.query_drop("ROLLBACK").unwrap();

    let after: Option<i64> = conn
        .query_first(format!("SELECT COUNT(*) FROM {SALES_DB}.orders WHERE id = 900"))
        .unwrap();
    assert_eq!(after, Some(0));
}

#[test]
fn test_named_prepared_statement() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    conn.query_drop(format!(
        "PREPARE it_stmt FROM 'SELECT name FROM {HR_DB}.people WHERE id = 2'"
    ))
    .unwrap();
    let name: Option<String> = conn.query_first("EXECUTE it_stmt").unwrap();
    assert_eq!(name.as_deref(), Some("linus"));
    conn.query_drop("DEALLOCATE PREPARE it_stmt").unwrap();
}

#[test]
fn test_binary_prepared_statements_on_two_shards() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    let amount: Option<i64> = conn
        .exec_first(format!("SELECT amount FROM {SALES_DB}.orders WHERE id = ?"), (1,))
        .unwrap();
    let name: Option<String> = conn
        .exec_first(format!("SELECT name FROM {HR_DB}.people WHERE id = ?"), (1,))
        .unwrap();
    assert_eq!(amount, Some(100));
    assert_eq!(name.as_deref(), Some("ada"));

    // Executing again reuses the client's cached statements
    let amount: Option<i64> = conn
        .exec_first(format!("SELECT amount FROM {SALES_DB}.orders WHERE id = ?"), (2,))
        .unwrap();
    assert_eq!(amount, Some(250));
}

#[test]
fn test_statement_without_tables() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    let one: Option<i64> = conn.query_first("SELECT 1").unwrap();
    assert_eq!(one, Some(1));
}
