mod admin;
mod backend;
mod config;
mod health;
mod metrics;
mod parser;
mod protocol;
mod router;
mod session;
mod shard;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use admin::ServiceRegistry;
use backend::TargetSet;
use config::Config;
use health::HealthMonitor;
use metrics::start_metrics_server;
use router::RouterService;
use session::{Session, SessionContext};

/// Global connection counter for generating unique session IDs
static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_or_default_config();

    let targets = Arc::new(TargetSet::from_config(&config.backends));
    let service = Arc::new(RouterService::from_config(&config.router)?);
    info!(
        service = %service.name,
        backends = targets.len(),
        refresh_interval_secs = service.refresh_interval.as_secs(),
        max_staleness_secs = service.max_staleness.as_secs(),
        refresh_retry_ms = service.refresh_retry.as_millis() as u64,
        "Router service configured"
    );

    let registry = Arc::new(ServiceRegistry::new());
    registry.register(service.name.clone(), Arc::clone(&service.cache));

    if config.metrics.enabled {
        let addr = config.metrics.listen_addr.clone();
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&addr, registry).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let monitor = HealthMonitor::new(config.health.clone());
    monitor.watch_all(&targets);
    info!(
        enabled = config.health.enabled,
        check_interval_ms = config.health.check_interval_ms,
        failure_threshold = config.health.failure_threshold,
        "Health monitor configured"
    );

    let ctx = Arc::new(SessionContext {
        service,
        targets: Arc::clone(&targets),
        users: config.users.clone(),
        server_version: config.server.server_version.clone(),
    });

    let addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = TcpListener::bind(&addr).await?;

    info!(addr = %addr, "Schema routing proxy listening");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = tokio::signal::ctrl_c() => break,
        };
        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                continue;
            }
        };
        stream.set_nodelay(true).ok();

        let session_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
        let ctx = Arc::clone(&ctx);

        info!(session_id = session_id, peer = %peer_addr, "New connection");

        tokio::spawn(async move {
            let session = Session::new(session_id, ctx);
            if let Err(e) = session.run(stream).await {
                warn!(session_id = session_id, error = %e, "Session ended with error");
            } else {
                info!(session_id = session_id, "Session ended");
            }
        });
    }

    for target in targets.iter() {
        info!(
            backend = %target,
            status = monitor.status(target.name()).as_str(),
            "Final backend status"
        );
    }
    monitor.shutdown();
    info!("Shutting down");
    Ok(())
}

fn load_or_default_config() -> Config {
    let mut config_paths = Vec::new();
    if let Ok(path) = std::env::var("SCHEMAPROXY_CONFIG") {
        config_paths.push(path);
    }
    config_paths.push("config/schemaproxy.toml".to_string());
    config_paths.push("schemaproxy.toml".to_string());

    for path in &config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = %path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
