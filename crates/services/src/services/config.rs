//! Tunables for the resilience services. Every field has a default matching
//! the production behaviour, so an empty `{}` file is a valid config.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;
use tracing::info;
use ts_rs::TS;

pub const CONFIG_PATH_ENV: &str = "RESILIENCE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, TS, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct ResilienceConfig {
    pub environment: Environment,
    pub logger: LoggerConfig,
    pub database: DatabaseConfig,
    pub boundary: BoundaryConfig,
    pub reload: ReloadConfig,
}

impl ResilienceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        info!(path = %path.display(), "Loaded resilience config");
        Ok(config)
    }

    /// Load from the file named by `RESILIENCE_CONFIG`, or fall back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct LoggerConfig {
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_events: u32,
    pub dedup_window_secs: u64,
    pub max_dedup_entries: usize,
    pub cleanup_interval_secs: u64,
    pub retention_days: i64,
    pub notification_secs: f32,
    pub ignored_patterns: Vec<String>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            rate_limit_window_secs: 60,
            rate_limit_max_events: 5,
            dedup_window_secs: 5 * 60,
            max_dedup_entries: 1024,
            cleanup_interval_secs: 24 * 60 * 60,
            retention_days: 7,
            notification_secs: 4.5,
            ignored_patterns: vec![
                "ResizeObserver loop limit exceeded".to_string(),
                "Loading chunk".to_string(),
                "Failed to load resource".to_string(),
                "Network request failed".to_string(),
            ],
        }
    }
}

impl LoggerConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub query_timeout_ms: u64,
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub slow_query_ms: u64,
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            query_timeout_ms: 30_000,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            slow_query_ms: 2_000,
            log_queries: true,
        }
    }
}

impl DatabaseConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_query_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct BoundaryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub notification_secs: f32,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1_000,
            notification_secs: 5.0,
        }
    }
}

impl BoundaryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct ReloadConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Automatic reload fires once more than this many errors arrive within one window.
    pub error_threshold: u32,
    pub error_window_secs: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            error_threshold: 5,
            error_window_secs: 60,
        }
    }
}

impl ReloadConfig {
    /// Delay before retry number `retry_count + 1`: base * 2^retry_count.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << retry_count.min(32)))
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_secs(self.error_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config: ResilienceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.logger.rate_limit_max_events, 5);
        assert_eq!(config.logger.dedup_window(), Duration::from_secs(300));
        assert_eq!(config.database.query_timeout(), Duration::from_secs(30));
        assert_eq!(config.boundary.max_retries, 3);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: ResilienceConfig = serde_json::from_str(
            r#"{"environment": "development", "reload": {"error_threshold": 10}}"#,
        )
        .unwrap();
        assert!(config.is_development());
        assert_eq!(config.reload.error_threshold, 10);
        assert_eq!(config.reload.max_retries, 3);
    }

    #[test]
    fn reload_delay_doubles() {
        let reload = ReloadConfig::default();
        let delays: Vec<_> = (0..3).map(|n| reload.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000]);
    }
}
