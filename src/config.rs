//! Gateway configuration: a single immutable YAML document loaded once at
//! process start (see `main.rs`). Nothing here is reloaded or watched —
//! the gateway is stateless across restarts, and config is part of that
//! statelessness.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_IDLE_TTL_SECS: u64 = 3600;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub requests_per_second: u32,
    pub burst: u32,
    pub model_tokens_per_minute: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_endpoint", rename = "metrics_endpoint")]
    pub endpoint: String,
    #[serde(default, rename = "prometheus_enabled")]
    pub expose_prometheus: bool,
    #[serde(default = "default_true")]
    pub expose_json: bool,
    #[serde(default)]
    pub expose_csv: bool,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default = "default_true")]
    pub mask_keys: bool,
}

fn default_metrics_endpoint() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_metrics_endpoint(),
            expose_prometheus: false,
            expose_json: true,
            expose_csv: false,
            auth_required: false,
            mask_keys: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_port: u16,
    pub target_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    pub limits: LimitsConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_body_bytes() -> u64 {
    DEFAULT_MAX_BODY_BYTES
}

fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

#[derive(Debug, thiserror::Error)]
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
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load, parse, and validate the config file at `path`. Fatal at start on any failure.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path_ref.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::Invalid(
                "listen_port must be between 1 and 65535".to_string(),
            ));
        }
        if reqwest::Url::parse(&self.target_url).is_err() {
            return Err(ConfigError::Invalid(format!(
                "target_url is not an absolute URL: {}",
                self.target_url
            )));
        }
        if self.limits.requests_per_second == 0 {
            return Err(ConfigError::Invalid(
                "limits.requests_per_second must be > 0".to_string(),
            ));
        }
        if self.limits.burst < self.limits.requests_per_second {
            return Err(ConfigError::Invalid(
                "limits.burst must be >= limits.requests_per_second".to_string(),
            ));
        }
        if self.limits.model_tokens_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "limits.model_tokens_per_minute must be > 0".to_string(),
            ));
        }
        if let Some(tls) = &self.tls {
            if tls.enabled && (tls.cert_path.is_none() || tls.key_path.is_none()) {
                return Err(ConfigError::Invalid(
                    "tls.enabled requires both cert_path and key_path".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
listen_port: 8080
target_url: "https://api.openai.com"
log_level: "info"
api_keys:
  "sk-client-1": "sk-upstream-1"
limits:
  requests_per_second: 100
  burst: 200
  model_tokens_per_minute: 50000
tls: { enabled: false }
metrics: { enabled: true, metrics_endpoint: "/metrics", prometheus_enabled: true, auth_required: false, mask_keys: true }
"#
    }

    #[test]
    fn parses_the_documented_example() {
        let config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.limits.burst, 200);
        assert!(config.metrics.expose_prometheus);
    }

    #[test]
    fn rejects_burst_below_rps() {
        let mut config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        config.limits.burst = 1;
        config.limits.requests_per_second = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_target_url() {
        let mut config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        config.target_url = "not-a-url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_api_keys_is_allowed() {
        let config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        assert!(!config.api_keys.is_empty());

        let mut stripped = config.clone();
        stripped.api_keys.clear();
        assert!(stripped.validate().is_ok());
    }

    #[test]
    fn load_reads_parses_and_validates_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, sample_yaml()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.target_url, "https://api.openai.com");
    }

    #[test]
    fn load_reports_a_read_error_for_a_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.yaml");
        assert!(matches!(Config::load(&missing), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn load_reports_a_parse_error_for_malformed_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "not: [valid, yaml: structure").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }
}
