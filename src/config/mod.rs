/// Configuration management for the economyflow engine
///
/// Handles server, database, worker, lane and maintenance settings. Every
/// field has an ENV_VAR override so the same binary runs under k8s/containers.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Operator HTTP surface
    pub server: ServerConfig,
    /// Workflow + lane database
    pub database: DatabaseConfig,
    /// Worker loop settings
    pub worker: WorkerConfig,
    /// Heartbeats, reconciliation sweep and stale lock audit
    pub maintenance: MaintenanceConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection url, e.g. "sqlite://data/economyflow.db"
    pub url: String,
    /// Upper bound on pooled connections
    pub max_connections: u32,
}

/// Worker loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Lane keys this process tries to hold, e.g. ["workflowRouter:0", "workflowRouter:1409"]
    pub lanes: Vec<String>,
    /// Seconds between `try_acquire` attempts while a lane is held elsewhere
    pub poll_interval_secs: u64,
    /// Delay before a deferred or out-of-turn message is published again
    pub retry_delay_ms: u64,
    /// Messages pulled per batch when the lane params carry no `prefetch`
    pub default_prefetch: usize,
    /// Workflow kinds whose handlers must be registered at startup
    pub enabled_kinds: Vec<String>,
}

/// Scheduled maintenance configuration (tokio-cron-scheduler expressions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Lease heartbeat schedule
    pub heartbeat_schedule: String,
    /// Reconciliation sweep schedule
    pub reconcile_schedule: String,
    /// Steps pending longer than this are reclassified `timeout`
    pub pending_timeout_secs: u64,
    /// Steps queued longer than this are published again
    pub queued_timeout_secs: u64,
    /// Running locks without a heartbeat for this long are reported as stale
    pub stale_lock_secs: u64,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("ECONOMYFLOW_HOST", "0.0.0.0".to_string()),
                port: env_or("ECONOMYFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                url: env_or(
                    "ECONOMYFLOW_DATABASE_URL",
                    "sqlite://data/economyflow.db".to_string(),
                ),
                max_connections: env_or("ECONOMYFLOW_DATABASE_MAX_CONNECTIONS", 5),
            },
            worker: WorkerConfig {
                lanes: env_list("ECONOMYFLOW_WORKER_LANES", &["workflowRouter:0"]),
                poll_interval_secs: env_or("ECONOMYFLOW_POLL_INTERVAL_SECS", 30),
                retry_delay_ms: env_or("ECONOMYFLOW_RETRY_DELAY_MS", 2000),
                default_prefetch: env_or("ECONOMYFLOW_DEFAULT_PREFETCH", 1),
                enabled_kinds: env_list("ECONOMYFLOW_ENABLED_KINDS", &["test"]),
            },
            maintenance: MaintenanceConfig {
                heartbeat_schedule: env_or(
                    "ECONOMYFLOW_HEARTBEAT_SCHEDULE",
                    "*/10 * * * * *".to_string(),
                ),
                reconcile_schedule: env_or(
                    "ECONOMYFLOW_RECONCILE_SCHEDULE",
                    "0 * * * * *".to_string(),
                ),
                pending_timeout_secs: env_or("ECONOMYFLOW_PENDING_TIMEOUT_SECS", 900),
                queued_timeout_secs: env_or("ECONOMYFLOW_QUEUED_TIMEOUT_SECS", 300),
                stale_lock_secs: env_or("ECONOMYFLOW_STALE_LOCK_SECS", 120),
            },
        }
    }
}

/// Read and parse an env var, falling back to `default` when unset or unparsable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

/// Comma separated env var; empty entries are dropped
fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => default.iter().map(|entry| entry.to_string()).collect(),
    }
}
