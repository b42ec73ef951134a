use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConfigError, RouterConfig};
use crate::shard::{IgnoreList, ShardCache};

/// One named router instance: its shard cache and the settings every
/// session of the service routes with
pub struct RouterService {
    pub name: String,
    pub cache: Arc<ShardCache>,
    pub ignore: IgnoreList,
    pub refresh_interval: Duration,
    pub max_staleness: Duration,
    pub refresh_retry: Duration,
    pub refresh_databases: bool,
    /// Zero means unlimited
    pub max_sescmd_history: usize,
    pub disable_sescmd_history: bool,
    /// Suffix client-visible errors with the session id
    pub debug: bool,
}

impl RouterService {
    pub fn from_config(config: &RouterConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            name: config.service_name.clone(),
            cache: Arc::new(ShardCache::new(config.max_concurrent_updates)),
            ignore: IgnoreList::from_config(config)?,
            refresh_interval: config.refresh_interval(),
            max_staleness: config.max_staleness(),
            refresh_retry: config.refresh_retry(),
            refresh_databases: config.refresh_databases,
            max_sescmd_history: config.max_sescmd_history,
            disable_sescmd_history: config.disable_sescmd_history,
            debug: config.debug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let config = RouterConfig {
            service_name: "orders".into(),
            refresh_retry_ms: 250,
            ignore_tables: vec!["shared".into()],
            ..RouterConfig::default()
        };
        let service = RouterService::from_config(&config).unwrap();
        assert_eq!(service.name, "orders");
        assert_eq!(service.refresh_retry, Duration::from_millis(250));
        assert_eq!(service.refresh_interval, Duration::from_secs(300));
        assert!(service
            .ignore
            .is_ignored(&crate::shard::TableKey::new("shared", "t")));
    }
}
