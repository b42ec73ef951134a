//! Routing integration tests: schema-based placement, USE, synthetic SHOW
//! results and unroutable statements

use crate::{
    assert_mysql_error, get_backends, get_proxy_config, skip_if_not_enabled, HR_DB, SALES_DB,
};
use mysql::prelude::*;

#[test]
fn test_qualified_queries_reach_their_shard() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    let total: Option<i64> = conn
        .query_first(format!("SELECT SUM(amount) FROM {SALES_DB}.orders"))
        .expect("Query on the first shard should succeed");
    assert_eq!(total, Some(350));

    let name: Option<String> = conn
        .query_first(format!("SELECT name FROM {HR_DB}.people WHERE id = 1"))
        .expect("Query on the second shard should succeed");
    assert_eq!(name.as_deref(), Some("ada"));
}

#[test]
fn test_use_switches_default_database() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    conn.query_drop(format!("USE {HR_DB}")).expect("USE should succeed");
    let names: Vec<String> = conn
        .query("SELECT name FROM people ORDER BY id")
        .expect("Unqualified table should resolve against the current database");
    assert_eq!(names, ["ada", "linus"]);

    conn.query_drop(format!("USE {SALES_DB}")).expect("USE should succeed");
    let count: Option<i64> = conn.query_first("SELECT COUNT(*) FROM orders").unwrap();
    assert_eq!(count, Some(2));
}

#[test]
fn test_connect_time_database() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config()
        .conn_with_db(SALES_DB)
        .expect("Connecting with a known database should succeed");
    let amount: Option<i64> = conn
        .query_first("SELECT amount FROM orders WHERE id = 2")
        .unwrap();
    assert_eq!(amount, Some(250));
}

#[test]
fn test_connect_time_unknown_database() {
    skip_if_not_enabled!();

    let result = get_proxy_config().conn_with_db("it_does_not_exist");
    assert_mysql_error(result, 1049, "Unknown database 'it_does_not_exist'");
}

#[test]
fn test_use_unknown_database_fails() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    let result = conn.query_drop("USE it_does_not_exist");
    assert_mysql_error(result, 1049, "Unknown database");
}

#[test]
fn test_show_databases_lists_all_shards() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    let databases: Vec<String> = conn.query("SHOW DATABASES").unwrap();
    assert!(databases.iter().any(|d| d == SALES_DB), "{databases:?}");
    assert!(databases.iter().any(|d| d == HR_DB), "{databases:?}");
}

#[test]
fn test_show_shards_maps_tables_to_servers() {
    skip_if_not_enabled!();

    let backends = get_backends();
    let mut conn = get_proxy_config().conn();
    let rows: Vec<(String, String)> = conn.query("SHOW SHARDS").unwrap();

    let server_of = |key: &str| {
        rows.iter()
            .find(|(k, _)| k == key)
            .map(|(_, server)| server.clone())
            .unwrap_or_else(|| panic!("{key} missing from SHOW SHARDS: {rows:?}"))
    };
    assert_eq!(server_of(&format!("{SALES_DB}.orders")), backends[0].1);
    assert_eq!(server_of(&format!("{HR_DB}.people")), backends[1].1);
    assert_eq!(server_of(SALES_DB), backends[0].1);
}

#[test]
fn test_cross_shard_join_has_no_target() {
    skip_if_not_enabled!();

    let mut conn = get_proxy_config().conn();
    let result: Result<Vec<(i64, String)>, _> = conn.query(format!(
        "SELECT o.amount, p.name FROM {SALES_DB}.orders o JOIN {HR_DB}.people p ON o.id = p.id"
    ));
    assert_mysql_error(result, 1146, "Could not find a target for query");
}
