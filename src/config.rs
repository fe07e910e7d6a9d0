//! Service configuration for the Ursa binary.
//!
//! Values come from an optional file (YAML, TOML or JSON, by extension) and
//! are overridden by `URSA__`-prefixed environment variables, e.g.
//! `URSA__REAPER__SWEEP_INTERVAL_SECS=30`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, UrsaError};
use crate::ratelimit::{ReaperSettings, DEFAULT_MAX_MEMOIZED_PATHS};

/// Main configuration for the Ursa service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UrsaConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Idle reaper configuration
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the rate limit rules file
    pub rules_path: Option<PathBuf>,

    /// Upper bound on distinct paths remembered by the route resolver
    #[serde(default = "default_max_memoized_paths")]
    pub max_memoized_paths: usize,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            max_memoized_paths: default_max_memoized_paths(),
        }
    }
}

fn default_max_memoized_paths() -> usize {
    DEFAULT_MAX_MEMOIZED_PATHS
}

/// Idle reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Run the reaper at all
    #[serde(default = "default_reaper_enabled")]
    pub enabled: bool,

    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds a bucket may stay unused before removal
    #[serde(default = "default_ttl")]
    pub bucket_ttl_secs: u64,

    /// Seconds an empty box may stay unused before removal
    #[serde(default = "default_ttl")]
    pub box_ttl_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: default_reaper_enabled(),
            sweep_interval_secs: default_sweep_interval(),
            bucket_ttl_secs: default_ttl(),
            box_ttl_secs: default_ttl(),
        }
    }
}

fn default_reaper_enabled() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_ttl() -> u64 {
    600
}

impl ReaperConfig {
    pub fn settings(&self) -> ReaperSettings {
        ReaperSettings {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            bucket_ttl: Duration::from_secs(self.bucket_ttl_secs),
            box_ttl: Duration::from_secs(self.box_ttl_secs),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl UrsaConfig {
    /// Load configuration from an optional file plus `URSA__*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder
            .add_source(
                ::config::Environment::with_prefix("URSA")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize::<UrsaConfig>())
            .map_err(|e| UrsaError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = UrsaConfig::default();
        assert!(config.reaper.enabled);
        assert_eq!(config.reaper.settings(), ReaperSettings::default());
        assert_eq!(config.rate_limiting.max_memoized_paths, DEFAULT_MAX_MEMOIZED_PATHS);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "rate_limiting:\n  rules_path: /etc/ursa/rates.yaml\n\
             reaper:\n  sweep_interval_secs: 5\n\
             logging:\n  format: json"
        )
        .unwrap();

        let config = UrsaConfig::load(Some(file.path())).unwrap();
        assert_eq!(
            config.rate_limiting.rules_path,
            Some(PathBuf::from("/etc/ursa/rates.yaml"))
        );
        assert_eq!(config.reaper.sweep_interval_secs, 5);
        assert_eq!(config.reaper.bucket_ttl_secs, 600);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_yaml_through_config_layers() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "reaper:\n  enabled: false\n  box_ttl_secs: 30").unwrap();

        let config = UrsaConfig::load(Some(file.path())).unwrap();
        assert!(!config.reaper.enabled);
        assert_eq!(config.reaper.box_ttl_secs, 30);
        assert_eq!(config.reaper.sweep_interval_secs, 60);
    }
}
