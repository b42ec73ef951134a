//! Integration test entry point
//!
//! Run with: SCHEMAPROXY_RUN_INTEGRATION_TESTS=1 cargo test --test integration
//!
//! The proxy must be running with two backends. The tests create their own
//! schemas directly on the backends, one schema per backend, and clear the
//! proxy's shard cache through the admin endpoint before connecting.
//!
//! Environment variables:
//! - SCHEMAPROXY_RUN_INTEGRATION_TESTS: Set to "1" to enable integration tests
//! - SCHEMAPROXY_TEST_PROXY_HOST: Proxy host (default: 127.0.0.1)
//! - SCHEMAPROXY_TEST_PROXY_PORT: Proxy port (default: 3307)
//! - SCHEMAPROXY_TEST_PROXY_USER: Proxy user (default: app_user)
//! - SCHEMAPROXY_TEST_PROXY_PASS: Proxy password (default: test123)
//! - SCHEMAPROXY_TEST_ADMIN_ADDR: Metrics/admin address (default: 127.0.0.1:9090)
//! - SCHEMAPROXY_TEST_SERVICE: Router service name (default: schemaproxy)
//! - SCHEMAPROXY_TEST_BACKENDS: Comma separated host:port of the two
//!   backends, in configuration order (default: 127.0.0.1:3306,127.0.0.1:3316)
//! - SCHEMAPROXY_TEST_BACKEND_NAMES: Their configured names (default: shard1,shard2)

mod admin;
mod routing;
mod session;

use std::env;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Once;

use mysql::prelude::*;
use mysql::{Conn, Error as MySqlError, OptsBuilder};

/// Schema created on the first backend
pub const SALES_DB: &str = "it_sales";
/// Schema created on the second backend
pub const HR_DB: &str = "it_hr";

/// Check if integration tests should run
pub fn should_run_integration_tests() -> bool {
    env::var("SCHEMAPROXY_RUN_INTEGRATION_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if integration tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_integration_tests() {
            eprintln!(
                "Skipping integration test (set SCHEMAPROXY_RUN_INTEGRATION_TESTS=1 to run)"
            );
            return;
        }
        crate::prepare_fixtures();
    };
}

/// Proxy test configuration
#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub admin_addr: String,
    pub service: String,
}

/// Get proxy connection config from environment
pub fn get_proxy_config() -> ProxyTestConfig {
    ProxyTestConfig {
        host: env::var("SCHEMAPROXY_TEST_PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("SCHEMAPROXY_TEST_PROXY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3307),
        user: env::var("SCHEMAPROXY_TEST_PROXY_USER").unwrap_or_else(|_| "app_user".to_string()),
        password: env::var("SCHEMAPROXY_TEST_PROXY_PASS").unwrap_or_else(|_| "test123".to_string()),
        admin_addr: env::var("SCHEMAPROXY_TEST_ADMIN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:9090".to_string()),
        service: env::var("SCHEMAPROXY_TEST_SERVICE").unwrap_or_else(|_| "schemaproxy".to_string()),
    }
}

impl ProxyTestConfig {
    fn opts(&self, database: Option<&str>) -> OptsBuilder {
        OptsBuilder::new()
            .ip_or_hostname(Some(&self.host))
            .tcp_port(self.port)
            .user(Some(&self.user))
            .pass(Some(&self.password))
            .db_name(database)
            .prefer_socket(false)
    }

    /// Open a connection to the proxy without a default database
    pub fn conn(&self) -> Conn {
        Conn::new(self.opts(None)).expect("Failed to connect to proxy")
    }

    /// Open a connection to the proxy with a default database
    pub fn conn_with_db(&self, database: &str) -> Result<Conn, MySqlError> {
        Conn::new(self.opts(Some(database)))
    }
}

/// Backends in configuration order: (address, configured name)
pub fn get_backends() -> Vec<(String, String)> {
    let addrs = env::var("SCHEMAPROXY_TEST_BACKENDS")
        .unwrap_or_else(|_| "127.0.0.1:3306,127.0.0.1:3316".to_string());
    let names = env::var("SCHEMAPROXY_TEST_BACKEND_NAMES")
        .unwrap_or_else(|_| "shard1,shard2".to_string());
    addrs
        .split(',')
        .map(str::trim)
        .map(String::from)
        .zip(names.split(',').map(str::trim).map(String::from))
        .collect()
}

/// Direct connection to a backend, bypassing the proxy
pub fn backend_conn(addr: &str) -> Conn {
    let config = get_proxy_config();
    let (host, port) = addr.rsplit_once(':').expect("backend address must be host:port");
    let opts = OptsBuilder::new()
        .ip_or_hostname(Some(host))
        .tcp_port(port.parse().expect("invalid backend port"))
        .user(Some(&config.user))
        .pass(Some(&config.password))
        .prefer_socket(false);
    Conn::new(opts).expect("Failed to connect to backend")
}

static FIXTURES: Once = Once::new();

/// Create `it_sales` on the first backend and `it_hr` on the second, then
/// make the proxy forget its shard map
pub fn prepare_fixtures() {
    FIXTURES.call_once(|| {
        let backends = get_backends();
        assert!(backends.len() >= 2, "Two backends are required");

        let mut first = backend_conn(&backends[0].0);
        first
            .query_drop(format!("CREATE DATABASE IF NOT EXISTS {SALES_DB}"))
            .unwrap();
        first
            .query_drop(format!(
                "CREATE TABLE IF NOT EXISTS {SALES_DB}.orders (id INT PRIMARY KEY, amount INT)"
            ))
            .unwrap();
        first
            .query_drop(format!("REPLACE INTO {SALES_DB}.orders VALUES (1, 100), (2, 250)"))
            .unwrap();

        let mut second = backend_conn(&backends[1].0);
        second
            .query_drop(format!("CREATE DATABASE IF NOT EXISTS {HR_DB}"))
            .unwrap();
        second
            .query_drop(format!(
                "CREATE TABLE IF NOT EXISTS {HR_DB}.people (id INT PRIMARY KEY, name VARCHAR(32))"
            ))
            .unwrap();
        second
            .query_drop(format!("REPLACE INTO {HR_DB}.people VALUES (1, 'ada'), (2, 'linus')"))
            .unwrap();

        let config = get_proxy_config();
        let (status, _) = admin_request(
            &config,
            "POST",
            &format!("/admin/clear-shard-cache/{}", config.service),
        );
        assert_eq!(status, 200, "Failed to clear the shard cache");
    });
}

/// Minimal HTTP/1.1 request against the admin endpoint; returns status and body
pub fn admin_request(config: &ProxyTestConfig, method: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(&config.admin_addr).expect("Failed to reach admin endpoint");
    write!(
        stream,
        "{method} {path} HTTP/1.1\r\nHost: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        config.admin_addr
    )
    .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("Malformed HTTP response");
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

/// Assert that a MySQL error matches expected code and message substring
pub fn assert_mysql_error<T: std::fmt::Debug>(
    result: Result<T, MySqlError>,
    expected_code: u16,
    expected_msg: &str,
) {
    match result {
        Ok(v) => panic!(
            "Expected MySQL error {} with message containing '{}', but got: {:?}",
            expected_code, expected_msg, v
        ),
        Err(MySqlError::MySqlError(ref e)) => {
            assert_eq!(
                e.code, expected_code,
                "Expected error code {}, got {}. Message: {}",
                expected_code, e.code, e.message
            );
            assert!(
                e.message.contains(expected_msg),
                "Expected message containing '{}', got: {}",
                expected_msg,
                e.message
            );
        }
        Err(e) => panic!(
            "Expected MySQL error {} with message containing '{}', got different error: {:?}",
            expected_code, expected_msg, e
        ),
    }
}
