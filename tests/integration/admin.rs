//! Admin endpoint integration tests

use crate::{admin_request, get_proxy_config, skip_if_not_enabled, SALES_DB};
use mysql::prelude::*;

#[test]
fn test_health_endpoint() {
    skip_if_not_enabled!();

    let (status, body) = admin_request(&get_proxy_config(), "GET", "/health");
    assert_eq!(status, 200);
    assert!(body.contains("OK"));
}

#[test]
fn test_shard_cache_diagnostics() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    // Make sure the cache holds an entry
    let mut conn = config.conn();
    let _: Option<i64> = conn
        .query_first(format!("SELECT COUNT(*) FROM {SALES_DB}.orders"))
        .unwrap();

    let (status, body) = admin_request(
        &config,
        "GET",
        &format!("/admin/shard-cache/{}", config.service),
    );
    assert_eq!(status, 200);
    assert!(body.contains(&format!("service: {}", config.service)), "{body}");
}

#[test]
fn test_invalidate_then_reconnect() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let (status, _) = admin_request(
        &config,
        "POST",
        &format!("/admin/invalidate-shard-cache/{}", config.service),
    );
    assert_eq!(status, 200);

    // The next session rediscovers the shard map
    let mut conn = config.conn();
    let count: Option<i64> = conn
        .query_first(format!("SELECT COUNT(*) FROM {SALES_DB}.orders WHERE id < 3"))
        .unwrap();
    assert_eq!(count, Some(2));
}

#[test]
fn test_admin_errors() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let (status, _) = admin_request(&config, "POST", "/admin/clear-shard-cache/no_such_service");
    assert_eq!(status, 404);

    let (status, _) = admin_request(
        &config,
        "GET",
        &format!("/admin/clear-shard-cache/{}", config.service),
    );
    assert_eq!(status, 405);

    let (status, _) = admin_request(&config, "POST", "/admin/clear-shard-cache/");
    assert_eq!(status, 400);
}
