//! YAML configuration loading for all five service binaries.
//!
//! Secrets never live in the YAML file (§6 of the specification); they are
//! read from the environment separately via [`Secrets::from_env`].

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
}

/// Database connection configuration (§4.1). Password is never part of this
/// struct; it is supplied at pool construction time from [`Secrets`].
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    pub dbname: String,
    pub user: String,
    #[serde(default = "default_min_size")]
    pub min_size: u32,
    #[serde(default = "default_max_size")]
    pub max_size: u32,
    #[serde(default = "default_max_queries")]
    pub max_queries: u32,
    #[serde(default = "default_acquisition_timeout_secs")]
    pub acquisition_timeout_secs: u64,
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
    #[serde(default = "default_cleanup_timeout_secs")]
    pub cleanup_timeout_secs: u64,
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
}

fn default_db_port() -> u16 {
    5432
}
fn default_min_size() -> u32 {
    1
}
fn default_max_size() -> u32 {
    10
}
fn default_max_queries() -> u32 {
    50_000
}
fn default_acquisition_timeout_secs() -> u64 {
    10
}
fn default_health_check_timeout_secs() -> u64 {
    5
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
fn default_query_timeout_secs() -> u64 {
    30
}
fn default_batch_timeout_secs() -> u64 {
    60
}
fn default_cleanup_timeout_secs() -> u64 {
    120
}
fn default_refresh_timeout_secs() -> u64 {
    300
}
fn default_batch_max_size() -> usize {
    1000
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_size == 0 || self.min_size > 100 {
            return Err(ConfigError::InvalidField {
                field: "database.min_size".into(),
                reason: "must be in 1..=100".into(),
            });
        }
        if self.max_size < self.min_size || self.max_size > 100 {
            return Err(ConfigError::InvalidField {
                field: "database.max_size".into(),
                reason: "must be >= min_size and <= 100".into(),
            });
        }
        Ok(())
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_secs(self.acquisition_timeout_secs)
    }
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Per-network concurrency limits (§5).
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConcurrency {
    #[serde(default = "default_clearnet_concurrency")]
    pub clearnet: usize,
    #[serde(default = "default_tor_concurrency")]
    pub tor: usize,
    #[serde(default = "default_i2p_concurrency")]
    pub i2p: usize,
    #[serde(default = "default_loki_concurrency")]
    pub loki: usize,
}

fn default_clearnet_concurrency() -> usize {
    50
}
fn default_tor_concurrency() -> usize {
    10
}
fn default_i2p_concurrency() -> usize {
    5
}
fn default_loki_concurrency() -> usize {
    5
}

impl Default for NetworkConcurrency {
    fn default() -> Self {
        Self {
            clearnet: default_clearnet_concurrency(),
            tor: default_tor_concurrency(),
            i2p: default_i2p_concurrency(),
            loki: default_loki_concurrency(),
        }
    }
}

/// Metrics exporter configuration, common to every service (§4.3).
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            host: default_metrics_host(),
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

/// Fields common to all service configs (§4.3).
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_interval_seconds() -> u64 {
    300
}
fn default_max_consecutive_failures() -> u32 {
    5
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_seconds < 60 {
            return Err(ConfigError::InvalidField {
                field: "interval_seconds".into(),
                reason: "must be >= 60".into(),
            });
        }
        if self.max_consecutive_failures < 1 {
            return Err(ConfigError::InvalidField {
                field: "max_consecutive_failures".into(),
                reason: "must be >= 1".into(),
            });
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// A single API discovery source (§4.4).
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSource {
    pub url: String,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
    pub jmespath_expr: String,
}

fn default_api_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct FinderConfig {
    #[serde(flatten)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api_sources: Vec<ApiSource>,
    #[serde(default = "default_delay_between_requests_ms")]
    pub delay_between_requests_ms: u64,
    #[serde(default = "default_event_batch_size")]
    pub batch_size: i64,
}

fn default_delay_between_requests_ms() -> u64 {
    1000
}
fn default_event_batch_size() -> i64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    #[serde(flatten)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i64,
    #[serde(default = "default_max_candidates_per_cycle")]
    pub max_candidates_per_cycle: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default)]
    pub enabled_networks: Option<Vec<String>>,
    #[serde(default)]
    pub network_concurrency: NetworkConcurrency,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_chunk_size() -> i64 {
    200
}
fn default_max_candidates_per_cycle() -> u64 {
    5000
}
fn default_max_failures() -> u32 {
    10
}
fn default_probe_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(flatten)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i64,
    #[serde(default)]
    pub network_concurrency: NetworkConcurrency,
    #[serde(default)]
    pub check_intervals: HashMap<String, u64>,
    #[serde(default = "default_monitor_announce_interval_secs")]
    pub announce_interval_secs: u64,
    #[serde(default)]
    pub publish_profile: bool,
    #[serde(default = "default_profile_interval_secs")]
    pub profile_interval_secs: u64,
    #[serde(default)]
    pub publication_relays: Vec<String>,
    #[serde(default = "default_geoip_dir")]
    pub geoip_dir: String,
    #[serde(default = "default_geoip_max_age_days")]
    pub geoip_max_age_days: u32,
    #[serde(default)]
    pub geoip_city_url: Option<String>,
    #[serde(default)]
    pub geoip_asn_url: Option<String>,
    #[serde(default)]
    pub allow_insecure_tls_fallback: bool,
}

fn default_monitor_announce_interval_secs() -> u64 {
    3600
}
fn default_profile_interval_secs() -> u64 {
    86400
}
fn default_geoip_dir() -> String {
    "./geoip".to_string()
}
fn default_geoip_max_age_days() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SynchronizerConfig {
    #[serde(flatten)]
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub network_concurrency: NetworkConcurrency,
    #[serde(default)]
    pub enabled_networks: Option<Vec<String>>,
    #[serde(default = "default_lookback_seconds")]
    pub lookback_seconds: i64,
    #[serde(default = "default_start")]
    pub default_start: i64,
    #[serde(default = "default_relay_timeout_secs")]
    pub relay_timeout_secs: u64,
    #[serde(default = "default_cursor_flush_interval_secs")]
    pub cursor_flush_interval_secs: u64,
    #[serde(default)]
    pub filter_kinds: Option<Vec<u16>>,
    #[serde(default)]
    pub filter_authors: Option<Vec<String>>,
    #[serde(default = "default_subscription_limit")]
    pub subscription_limit: usize,
    #[serde(default)]
    pub allow_insecure_tls_fallback: bool,
    /// Reserved: declared by the source config schema but unused there too.
    /// Not implemented per the specification's open-question guidance.
    #[serde(default)]
    pub stagger_delay_ms: Option<u64>,
}

fn default_lookback_seconds() -> i64 {
    300
}
fn default_start() -> i64 {
    0
}
fn default_relay_timeout_secs() -> u64 {
    60
}
fn default_cursor_flush_interval_secs() -> u64 {
    30
}
fn default_subscription_limit() -> usize {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeederConfig {
    pub database: DatabaseConfig,
    pub file_path: String,
}

/// Secrets loaded from the environment, never from YAML (§6).
#[derive(Debug, Clone)]
pub struct Secrets {
    pub db_admin_password: Option<String>,
    pub db_writer_password: Option<String>,
    pub db_reader_password: Option<String>,
    pub nostr_private_key: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            db_admin_password: std::env::var("DB_ADMIN_PASSWORD").ok(),
            db_writer_password: std::env::var("DB_WRITER_PASSWORD").ok(),
            db_reader_password: std::env::var("DB_READER_PASSWORD").ok(),
            nostr_private_key: std::env::var("NOSTR_PRIVATE_KEY").ok(),
        }
    }

    pub fn writer_password(&self) -> Result<&str, ConfigError> {
        self.db_writer_password
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("DB_WRITER_PASSWORD".into()))
    }

    pub fn nostr_keys(&self) -> Result<Option<nostr::Keys>, ConfigError> {
        match &self.nostr_private_key {
            None => Ok(None),
            Some(raw) => {
                let keys = if let Some(stripped) = raw.strip_prefix("nsec1") {
                    let _ = stripped;
                    nostr::Keys::parse(raw)
                } else {
                    nostr::Keys::parse(raw)
                }
                .map_err(|e| ConfigError::InvalidField {
                    field: "NOSTR_PRIVATE_KEY".into(),
                    reason: e.to_string(),
                })?;
                Ok(Some(keys))
            }
        }
    }
}

/// Loads and parses a YAML config file at `path` into `T`.
pub fn load<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_config_rejects_short_interval() {
        let cfg = ServiceConfig {
            interval_seconds: 10,
            max_consecutive_failures: 3,
            metrics: MetricsConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn database_config_rejects_inverted_pool_bounds() {
        let cfg = DatabaseConfig {
            host: "localhost".into(),
            port: 5432,
            dbname: "bigbrotr".into(),
            user: "writer".into(),
            min_size: 10,
            max_size: 2,
            max_queries: 1000,
            acquisition_timeout_secs: 5,
            health_check_timeout_secs: 5,
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            exponential_backoff: true,
            query_timeout_secs: 10,
            batch_timeout_secs: 10,
            cleanup_timeout_secs: 10,
            refresh_timeout_secs: 10,
            batch_max_size: 1000,
        };
        assert!(cfg.validate().is_err());
    }
}
