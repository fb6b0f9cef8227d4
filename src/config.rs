//! The single JSON configuration document (`spec.md` §6) and its
//! startup-time validation (`spec.md` §7, "Configuration invalid").

use serde::Deserialize;
use thiserror::Error;

use crate::types::SourceDescriptor;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub aggregator: AggregatorConfig,
    pub zmap: ZmapConfig,
    pub checker: CheckerConfig,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub interval_seconds: u64,
    pub sources: Vec<SourceDescriptor>,
    pub user_agent: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 900,
            sources: Vec::new(),
            user_agent: "proxy-pool/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ZmapConfig {
    pub enabled: bool,
    pub ports: Vec<u16>,
    pub rate_limit: u32,
    pub bandwidth: String,
    pub max_runtime_seconds: u64,
    pub target_ranges: Vec<String>,
    pub blacklist: Vec<String>,
    pub interface: Option<String>,
    pub zmap_binary: String,
    pub cooldown_seconds: u64,
}

impl Default for ZmapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ports: vec![80, 8080, 1080],
            rate_limit: 10_000,
            bandwidth: String::new(),
            max_runtime_seconds: 600,
            target_ranges: Vec::new(),
            blacklist: Vec::new(),
            interface: None,
            zmap_binary: "zmap".to_string(),
            cooldown_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckerMode {
    ConnectOnly,
    FullHttp,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    pub timeout_ms: u64,
    pub concurrency_total: usize,
    pub batch_size: usize,
    pub retries: u32,
    pub test_url: String,
    pub mode: CheckerMode,
    pub enable_adaptive_concurrency: bool,
    pub max_fd_usage_percent: u32,
    pub max_cpu_usage_percent: u32,
    pub enable_fast_filter: bool,
    pub fast_filter_timeout_ms: u64,
    pub fast_filter_concurrency: usize,
    pub socks_enabled: bool,
    pub socks_timeout_ms: u64,
    pub socks_test_url: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            concurrency_total: 20_000,
            batch_size: 1_000,
            retries: 1,
            test_url: "http://www.gstatic.com/generate_204".to_string(),
            mode: CheckerMode::ConnectOnly,
            enable_adaptive_concurrency: true,
            max_fd_usage_percent: 70,
            max_cpu_usage_percent: 90,
            enable_fast_filter: true,
            fast_filter_timeout_ms: 2_000,
            fast_filter_concurrency: 50_000,
            socks_enabled: true,
            socks_timeout_ms: 8_000,
            socks_test_url: "www.google.com:80".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub addr: String,
    pub api_key_env: String,
    pub rate_limit_per_minute: u32,
    pub rate_limit_per_ip: bool,
    pub enable_api_key_auth: bool,
    pub enable_ip_rate_limit: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            api_key_env: "PROXY_API_KEY".to_string(),
            rate_limit_per_minute: 1_200,
            rate_limit_per_ip: true,
            enable_api_key_auth: true,
            enable_ip_rate_limit: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    File,
    Sqlite,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub path: String,
    pub persist_interval_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::File,
            path: "proxy_pool_snapshot.json".to_string(),
            persist_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "/metrics".to_string(),
            namespace: "proxy_pool".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("aggregator.interval_seconds must be > 0")]
    BadAggregatorInterval,
    #[error("no enabled aggregator sources and zmap scanning is disabled: nothing to validate")]
    NoSourcesAndNoScanner,
    #[error("zmap.enabled is true but zmap.ports is empty")]
    ZmapEnabledNoPorts,
    #[error("zmap port {0} out of range [1, 65535]")]
    ZmapPortOutOfRange(u32),
    #[error("zmap.rate_limit {0} out of range [1, 1000000]")]
    ZmapRateLimitOutOfRange(u32),
    #[error("zmap.max_runtime_seconds {0} out of range [1, 86400]")]
    ZmapMaxRuntimeOutOfRange(u64),
    #[error("checker.concurrency_total must be > 0")]
    BadConcurrencyTotal,
    #[error("checker.timeout_ms must be > 0")]
    BadCheckerTimeout,
    #[error("checker.retries must be <= 10")]
    RetriesTooHigh,
    #[error("api.rate_limit_per_minute must be > 0")]
    BadRateLimit,
    #[error("storage.persist_interval_seconds must be > 0")]
    BadPersistInterval,
    #[error("zmap.target_ranges entry {0:?} is not a valid CIDR")]
    BadTargetRange(String),
}

impl Config {
    pub fn from_json(data: &str) -> anyhow::Result<Config> {
        let cfg: Config = serde_json::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Startup-time validation, per `spec.md` §7 "Configuration invalid".
    /// The affected subsystem is disabled or the process refuses to start;
    /// never discovered mid-cycle.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregator.interval_seconds == 0 {
            return Err(ConfigError::BadAggregatorInterval);
        }
        let any_source_enabled = self.aggregator.sources.iter().any(|s| s.enabled);
        if !any_source_enabled && !self.zmap.enabled {
            return Err(ConfigError::NoSourcesAndNoScanner);
        }
        if self.zmap.enabled {
            if self.zmap.ports.is_empty() {
                return Err(ConfigError::ZmapEnabledNoPorts);
            }
            for &p in &self.zmap.ports {
                if p == 0 {
                    return Err(ConfigError::ZmapPortOutOfRange(p as u32));
                }
            }
            if self.zmap.rate_limit == 0 || self.zmap.rate_limit > 1_000_000 {
                return Err(ConfigError::ZmapRateLimitOutOfRange(self.zmap.rate_limit));
            }
            if self.zmap.max_runtime_seconds == 0 || self.zmap.max_runtime_seconds > 86_400 {
                return Err(ConfigError::ZmapMaxRuntimeOutOfRange(
                    self.zmap.max_runtime_seconds,
                ));
            }
            for cidr in &self.zmap.target_ranges {
                if cidr.parse::<ipnet::IpNet>().is_err() {
                    return Err(ConfigError::BadTargetRange(cidr.clone()));
                }
            }
        }
        if self.checker.concurrency_total == 0 {
            return Err(ConfigError::BadConcurrencyTotal);
        }
        if self.checker.timeout_ms == 0 {
            return Err(ConfigError::BadCheckerTimeout);
        }
        if self.checker.retries > 10 {
            return Err(ConfigError::RetriesTooHigh);
        }
        if self.api.rate_limit_per_minute == 0 {
            return Err(ConfigError::BadRateLimit);
        }
        if self.storage.persist_interval_seconds == 0 {
            return Err(ConfigError::BadPersistInterval);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let mut cfg = Config::default();
        cfg.aggregator.sources.push(SourceDescriptor {
            url: "https://example.test/list.txt".to_string(),
            protocol: "auto".to_string(),
            enabled: true,
        });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn no_sources_and_no_scanner_rejected() {
        let cfg = Config::default();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NoSourcesAndNoScanner)
        ));
    }

    #[test]
    fn zmap_enabled_with_no_ports_rejected() {
        let mut cfg = Config::default();
        cfg.zmap.enabled = true;
        cfg.zmap.ports.clear();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ZmapEnabledNoPorts)
        ));
    }

    #[test]
    fn zmap_rate_limit_out_of_range_rejected() {
        let mut cfg = Config::default();
        cfg.zmap.enabled = true;
        cfg.zmap.rate_limit = 2_000_000;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ZmapRateLimitOutOfRange(_))
        ));
    }
}
