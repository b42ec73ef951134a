//! Periodic health checks of backend servers.
//!
//! Each target gets its own long-running task. A target that fails
//! `failure_threshold` checks in a row is marked unusable, so new sessions
//! skip it and running sessions drop their link; one good check makes it
//! usable again.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendConnection, TargetRef, TargetSet};
use crate::config::HealthCheckConfig;
use crate::metrics::metrics;

use super::state::{CheckResult, HealthStatus, TargetHealth};

pub struct HealthMonitor {
    /// Health state per target name
    targets: DashMap<String, Arc<RwLock<TargetHealth>>>,
    cancel: CancellationToken,
    config: HealthCheckConfig,
}

impl HealthMonitor {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            targets: DashMap::new(),
            cancel: CancellationToken::new(),
            config,
        }
    }

    /// Start watching every target of the set
    pub fn watch_all(&self, targets: &TargetSet) {
        for target in targets.iter() {
            self.watch(target.clone());
        }
    }

    /// Start watching one target; a target already watched is left alone
    pub fn watch(&self, target: TargetRef) -> Arc<RwLock<TargetHealth>> {
        let mut is_new = false;
        let health = self
            .targets
            .entry(target.name().to_string())
            .or_insert_with(|| {
                is_new = true;
                Arc::new(RwLock::new(TargetHealth::new(self.config.failure_threshold)))
            })
            .clone();

        if is_new && self.config.enabled {
            self.spawn_check_task(target, health.clone());
        }
        health
    }

    fn spawn_check_task(&self, target: TargetRef, health: Arc<RwLock<TargetHealth>>) {
        let cancel = self.cancel.child_token();
        let config = self.config.clone();
        let check_interval = Duration::from_millis(config.check_interval_ms.max(1));
        let check_timeout = Duration::from_millis(config.check_timeout_ms);

        debug!(backend = %target, "Spawned health check task");
        tokio::spawn(async move {
            // Stagger the first check over one interval
            let initial_delay = rand::thread_rng().gen_range(0..check_interval.as_millis() as u64);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(initial_delay)) => {}
            }

            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(backend = %target, "Health check task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let result = check(&target, &config, check_timeout).await;
                        apply(&target, &health, result);
                    }
                }
            }
        });
    }

    pub fn status(&self, name: &str) -> HealthStatus {
        self.targets
            .get(name)
            .map(|h| h.read().status)
            .unwrap_or_default()
    }

    /// Stop every check task
    pub fn shutdown(&self) {
        self.cancel.cancel();
        info!(targets = self.targets.len(), "Health monitor stopped");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Log in with the monitor account and round-trip a COM_PING
async fn check(target: &TargetRef, config: &HealthCheckConfig, timeout: Duration) -> CheckResult {
    let probe = async {
        let mut conn =
            BackendConnection::connect(target, &config.user, &config.password, None).await?;
        Ok::<bool, crate::backend::ConnectionError>(conn.ping().await)
    };

    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(true)) => CheckResult::Ok,
        Ok(Ok(false)) => {
            debug!(backend = %target, "Health check ping failed");
            CheckResult::Failed
        }
        Ok(Err(e)) => {
            debug!(backend = %target, error = %e, "Health check failed");
            CheckResult::Failed
        }
        Err(_) => {
            debug!(backend = %target, "Health check timed out");
            CheckResult::TimedOut
        }
    }
}

/// Fold a check result into the target's state and usability flag
fn apply(target: &TargetRef, health: &RwLock<TargetHealth>, result: CheckResult) {
    metrics().record_health_check(result.as_str());

    let mut h = health.write();
    let Some(status) = h.record(result) else {
        return;
    };

    let usable = status == HealthStatus::Up;
    let flipped = target.set_usable(usable);
    if usable {
        info!(backend = %target, status = status.as_str(), "Backend status changed");
    } else {
        warn!(
            backend = %target,
            status = status.as_str(),
            failures = h.consecutive_failures(),
            result = result.as_str(),
            since_last_success = ?h.last_success.map(|t| t.elapsed()),
            "Backend status changed, no longer used for new links"
        );
    }
    if !flipped {
        debug!(backend = %target, usable, "Usability flag already set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Target;

    fn disabled() -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: false,
            failure_threshold: 2,
            ..HealthCheckConfig::default()
        }
    }

    #[test]
    fn test_watch_is_idempotent() {
        let monitor = HealthMonitor::new(disabled());
        let target = Arc::new(Target::new("shard1", "127.0.0.1:1"));
        let a = monitor.watch(target.clone());
        let b = monitor.watch(target);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(monitor.status("shard1"), HealthStatus::Unknown);
        assert_eq!(monitor.status("missing"), HealthStatus::Unknown);
    }

    #[test]
    fn test_apply_toggles_usable() {
        let monitor = HealthMonitor::new(disabled());
        let target = Arc::new(Target::new("shard1", "127.0.0.1:1"));
        let health = monitor.watch(target.clone());

        apply(&target, &health, CheckResult::Failed);
        assert!(target.is_usable());
        apply(&target, &health, CheckResult::TimedOut);
        assert!(!target.is_usable());
        assert_eq!(monitor.status("shard1"), HealthStatus::Down);

        apply(&target, &health, CheckResult::Ok);
        assert!(target.is_usable());
        assert_eq!(monitor.status("shard1"), HealthStatus::Up);
    }

    #[tokio::test]
    async fn test_check_unreachable_backend() {
        // Port 1 on localhost refuses connections
        let target = Arc::new(Target::new("shard1", "127.0.0.1:1"));
        let result = check(&target, &disabled(), Duration::from_secs(2)).await;
        assert_ne!(result, CheckResult::Ok);
    }

    #[tokio::test]
    async fn test_watch_all_spawns_cancellable_tasks() {
        let config = HealthCheckConfig {
            check_interval_ms: 50,
            check_timeout_ms: 20,
            ..HealthCheckConfig::default()
        };
        let targets = TargetSet::from_config(&[crate::config::BackendConfig {
            name: "shard1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
        }]);
        let monitor = HealthMonitor::new(config);
        monitor.watch_all(&targets);
        monitor.shutdown();
        assert!(monitor.cancel.is_cancelled());
    }
}
