//! Operator commands addressed to a router service by name

use std::fmt::Write as _;
use std::sync::Arc;

use dashmap::DashMap;
use hyper::{Method, StatusCode};
use thiserror::Error;
use tracing::info;

use crate::shard::ShardCache;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Unknown service: {0}")]
    UnknownService(String),
}

/// Router services reachable from the admin endpoint
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ShardCache>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, cache: Arc<ShardCache>) {
        let name = name.into();
        info!(service = %name, "Registered router service");
        self.services.insert(name, cache);
    }

    pub fn get(&self, name: &str) -> Result<Arc<ShardCache>, ServiceError> {
        self.services
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ServiceError::UnknownService(name.to_string()))
    }

    /// `clear-shard-cache <service>`
    pub fn clear_shard_cache(&self, name: &str) -> Result<(), ServiceError> {
        self.get(name)?.clear();
        info!(service = name, "Shard cache cleared by operator");
        Ok(())
    }

    /// `invalidate-shard-cache <service>`
    pub fn invalidate_shard_cache(&self, name: &str) -> Result<(), ServiceError> {
        self.get(name)?.invalidate_all();
        info!(service = name, "Shard cache invalidated by operator");
        Ok(())
    }

    pub fn describe(&self, name: &str) -> Result<String, ServiceError> {
        let stats = self.get(name)?.stats();
        let mut out = String::new();
        let _ = writeln!(out, "service: {name}");
        let _ = writeln!(out, "entries: {}", stats.entries);
        let _ = writeln!(out, "hits: {}", stats.hits);
        let _ = writeln!(out, "misses: {}", stats.misses);
        let _ = writeln!(out, "stale: {}", stats.stale);
        let _ = writeln!(out, "updates: {}", stats.updates);
        Ok(out)
    }
}

/// Resolve an `/admin/...` request into a status and plain-text body
pub fn handle_admin(registry: &ServiceRegistry, method: &Method, path: &str) -> (StatusCode, String) {
    let mut parts = path.trim_start_matches("/admin/").splitn(2, '/');
    let command = parts.next().unwrap_or_default();
    let service = parts.next().unwrap_or_default().trim_end_matches('/');

    let expected = match command {
        "clear-shard-cache" | "invalidate-shard-cache" => Method::POST,
        "shard-cache" => Method::GET,
        _ => return (StatusCode::NOT_FOUND, "Not Found\n".to_string()),
    };
    if *method != expected {
        return (StatusCode::METHOD_NOT_ALLOWED, format!("Use {expected}\n"));
    }
    if service.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing service name\n".to_string());
    }

    let result = match command {
        "clear-shard-cache" => registry.clear_shard_cache(service).map(|_| "OK\n".to_string()),
        "invalidate-shard-cache" => registry
            .invalidate_shard_cache(service)
            .map(|_| "OK\n".to_string()),
        _ => registry.describe(service),
    };

    match result {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::NOT_FOUND, format!("{e}\n")),
    }
}
