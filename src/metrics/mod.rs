//! Prometheus metrics for the schema router
//!
//! Exposes metrics (and the shard cache admin routes) over HTTP.

mod server;

pub use server::start_metrics_server;

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::OnceLock;
use std::time::Duration;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    pub registry: Registry,

    // Shard cache
    pub cache_hits_total: IntCounter,
    pub cache_misses_total: IntCounter,
    pub cache_updates_total: IntCounter,
    pub cache_stale_total: IntCounter,
    pub discovery_duration_seconds: Histogram,

    // Routing
    /// Statements routed, by kind of route
    pub queries_total: IntCounterVec,
    pub session_commands_total: IntCounter,
    pub sescmd_history_exceeded_total: IntCounter,
    /// Longest session command history seen in any session
    pub sescmd_history_longest: IntGauge,

    // Sessions
    pub sessions_total: IntCounter,
    pub sessions_active: IntGauge,
    pub session_failures_total: IntCounterVec,
    pub session_duration_seconds: Histogram,

    // Health checks
    pub health_check_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let cache_hits_total = IntCounter::new(
            "schemaproxy_shard_cache_hits_total",
            "Shard map lookups answered from the cache",
        )
        .unwrap();
        let cache_misses_total = IntCounter::new(
            "schemaproxy_shard_cache_misses_total",
            "Shard map lookups that found no entry",
        )
        .unwrap();
        let cache_updates_total = IntCounter::new(
            "schemaproxy_shard_cache_updates_total",
            "Shard maps installed into the cache",
        )
        .unwrap();
        let cache_stale_total = IntCounter::new(
            "schemaproxy_shard_cache_stale_total",
            "Shard map lookups that found an entry older than the refresh interval",
        )
        .unwrap();
        let discovery_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "schemaproxy_discovery_duration_seconds",
                "Time to map all backends of a session",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .unwrap();

        let queries_total = IntCounterVec::new(
            Opts::new("schemaproxy_queries_total", "Statements routed"),
            &["route"], // single, broadcast, synthetic, affinity
        )
        .unwrap();
        let session_commands_total = IntCounter::new(
            "schemaproxy_session_commands_total",
            "Commands broadcast to every backend of a session",
        )
        .unwrap();
        let sescmd_history_exceeded_total = IntCounter::new(
            "schemaproxy_sescmd_history_exceeded_total",
            "Sessions closed for exceeding the session command history limit",
        )
        .unwrap();
        let sescmd_history_longest = IntGauge::new(
            "schemaproxy_sescmd_history_longest",
            "Longest session command history recorded by a session",
        )
        .unwrap();

        let sessions_total = IntCounter::new(
            "schemaproxy_sessions_total",
            "Client sessions accepted",
        )
        .unwrap();
        let sessions_active = IntGauge::new(
            "schemaproxy_sessions_active",
            "Client sessions currently open",
        )
        .unwrap();
        let session_failures_total = IntCounterVec::new(
            Opts::new(
                "schemaproxy_session_failures_total",
                "Sessions terminated by a routing error",
            ),
            &["reason"],
        )
        .unwrap();
        let session_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "schemaproxy_session_duration_seconds",
                "Client session lifetime",
            )
            .buckets(vec![0.01, 0.1, 1.0, 10.0, 60.0, 300.0, 1800.0, 3600.0, 86400.0]),
        )
        .unwrap();

        let health_check_total = IntCounterVec::new(
            Opts::new(
                "schemaproxy_health_check_total",
                "Backend health checks by result",
            ),
            &["result"], // success, failure, timeout
        )
        .unwrap();

        registry.register(Box::new(cache_hits_total.clone())).unwrap();
        registry.register(Box::new(cache_misses_total.clone())).unwrap();
        registry.register(Box::new(cache_updates_total.clone())).unwrap();
        registry.register(Box::new(cache_stale_total.clone())).unwrap();
        registry
            .register(Box::new(discovery_duration_seconds.clone()))
            .unwrap();
        registry.register(Box::new(queries_total.clone())).unwrap();
        registry
            .register(Box::new(session_commands_total.clone()))
            .unwrap();
        registry
            .register(Box::new(sescmd_history_exceeded_total.clone()))
            .unwrap();
        registry
            .register(Box::new(sescmd_history_longest.clone()))
            .unwrap();
        registry.register(Box::new(sessions_total.clone())).unwrap();
        registry.register(Box::new(sessions_active.clone())).unwrap();
        registry
            .register(Box::new(session_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(session_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(health_check_total.clone()))
            .unwrap();

        Self {
            registry,
            cache_hits_total,
            cache_misses_total,
            cache_updates_total,
            cache_stale_total,
            discovery_duration_seconds,
            queries_total,
            session_commands_total,
            sescmd_history_exceeded_total,
            sescmd_history_longest,
            sessions_total,
            sessions_active,
            session_failures_total,
            session_duration_seconds,
            health_check_total,
        }
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses_total.inc();
    }

    pub fn record_cache_update(&self) {
        self.cache_updates_total.inc();
    }

    pub fn record_cache_stale(&self) {
        self.cache_stale_total.inc();
    }

    pub fn record_discovery(&self, elapsed: Duration) {
        self.discovery_duration_seconds.observe(elapsed.as_secs_f64());
    }

    /// Record a routed statement
    pub fn record_route(&self, route: &str) {
        self.queries_total.with_label_values(&[route]).inc();
    }

    pub fn record_session_command(&self, history_len: usize) {
        self.session_commands_total.inc();
        let len = history_len as i64;
        if len > self.sescmd_history_longest.get() {
            self.sescmd_history_longest.set(len);
        }
    }

    pub fn record_history_exceeded(&self) {
        self.sescmd_history_exceeded_total.inc();
    }

    pub fn record_session_started(&self) {
        self.sessions_total.inc();
        self.sessions_active.inc();
    }

    pub fn record_session_ended(&self, lifetime: Duration) {
        self.sessions_active.dec();
        self.session_duration_seconds.observe(lifetime.as_secs_f64());
    }

    pub fn record_session_failure(&self, reason: &str) {
        self.session_failures_total.with_label_values(&[reason]).inc();
    }

    pub fn record_health_check(&self, result: &str) {
        self.health_check_total.with_label_values(&[result]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
