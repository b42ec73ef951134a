use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Shard nodes; each one is a routing target
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendConfig>,
    /// Accounts accepted from clients and reused for backend logins
    #[serde(default = "default_users")]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub health: HealthCheckConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            backends: default_backends(),
            users: default_users(),
            router: RouterConfig::default(),
            health: HealthCheckConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

// ============================================================================
// Listener / Backends / Users
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Version string announced in the client handshake
    #[serde(default = "default_server_version")]
    pub server_version: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    3307
}

fn default_server_version() -> String {
    "8.0.0-schemaproxy".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            server_version: default_server_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Unique server name, shown in SHOW SHARDS and in logs
    pub name: String,
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
}

impl BackendConfig {
    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_backend_port() -> u16 {
    3306
}

fn default_backends() -> Vec<BackendConfig> {
    vec![BackendConfig {
        name: "server1".to_string(),
        host: "127.0.0.1".to_string(),
        port: default_backend_port(),
    }]
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    #[serde(default)]
    pub password: String,
}

fn default_users() -> Vec<UserConfig> {
    vec![UserConfig {
        name: "root".to_string(),
        password: String::new(),
    }]
}

// ============================================================================
// Router Configuration
// ============================================================================

/// Shard map caching and routing behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Name the admin endpoints use to address this router's cache
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Maximum age of a cached shard map before it is rediscovered (seconds)
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Extra age tolerated while another session refreshes the map (seconds)
    #[serde(default = "default_max_staleness_secs")]
    pub max_staleness_secs: u64,
    /// How often a waiting session polls the cache again (milliseconds)
    #[serde(default = "default_refresh_retry_ms")]
    pub refresh_retry_ms: u64,
    /// Concurrent discoveries allowed per cache key
    #[serde(default = "default_max_concurrent_updates")]
    pub max_concurrent_updates: usize,
    /// Tables or schemas allowed to exist on several backends
    #[serde(default)]
    pub ignore_tables: Vec<String>,
    #[serde(default)]
    pub ignore_tables_regex: Option<String>,
    /// Rediscover once instead of failing when a database cannot be found
    #[serde(default)]
    pub refresh_databases: bool,
    /// Session command history limit, 0 for unlimited
    #[serde(default)]
    pub max_sescmd_history: usize,
    #[serde(default)]
    pub disable_sescmd_history: bool,
    /// Append the session id to error messages sent to clients
    #[serde(default)]
    pub debug: bool,
}

fn default_service_name() -> String {
    "schemaproxy".to_string()
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_max_staleness_secs() -> u64 {
    150
}

fn default_refresh_retry_ms() -> u64 {
    1000
}

fn default_max_concurrent_updates() -> usize {
    1
}

impl RouterConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn max_staleness(&self) -> Duration {
        Duration::from_secs(self.max_staleness_secs)
    }

    pub fn refresh_retry(&self) -> Duration {
        Duration::from_millis(self.refresh_retry_ms)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            refresh_interval_secs: default_refresh_interval_secs(),
            max_staleness_secs: default_max_staleness_secs(),
            refresh_retry_ms: default_refresh_retry_ms(),
            max_concurrent_updates: default_max_concurrent_updates(),
            ignore_tables: Vec::new(),
            ignore_tables_regex: None,
            refresh_databases: false,
            max_sescmd_history: 0,
            disable_sescmd_history: false,
            debug: false,
        }
    }
}

// ============================================================================
// Health Check Configuration
// ============================================================================

/// Health check configuration for backend servers
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    /// Whether health checks are enabled
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    /// Interval between checks (milliseconds)
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Number of consecutive failures before marking a server unusable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Timeout for each health check (milliseconds)
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
    /// Monitor account
    #[serde(default = "default_monitor_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_health_enabled() -> bool {
    true
}

fn default_check_interval_ms() -> u64 {
    5000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_check_timeout_ms() -> u64 {
    3000
}

fn default_monitor_user() -> String {
    "root".to_string()
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            check_interval_ms: default_check_interval_ms(),
            failure_threshold: default_failure_threshold(),
            check_timeout_ms: default_check_timeout_ms(),
            user: default_monitor_user(),
            password: String::new(),
        }
    }
}

// ============================================================================
// Metrics / Admin Endpoint
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen_addr: default_metrics_addr(),
        }
    }
}
