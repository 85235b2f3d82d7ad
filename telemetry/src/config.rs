//! Configuration module for the StudyTrail telemetry client.
//!
//! This module handles parsing configuration from environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STUDYTRAIL_COLLECTOR_URL` | When live | - | Collector base URL (e.g., `https://api.studytrail.dev`) |
//! | `STUDYTRAIL_DEPLOYMENT` | No | `live` | `live`, `static` or `demo` |
//! | `STUDYTRAIL_FLUSH_INTERVAL_SECS` | No | 30 | Seconds between timer flushes |
//! | `STUDYTRAIL_BUFFER_HIGH_WATER` | No | 100 | Buffer length above which a failed send evicts |
//! | `STUDYTRAIL_BUFFER_RETAIN` | No | 50 | Newest events kept after eviction |
//! | `STUDYTRAIL_TOKEN_PATH` | No | `~/.studytrail/token` | File holding the bearer token |
//! | `STUDYTRAIL_BOUND_UNAUTHENTICATED` | No | `false` | Apply the bound while waiting for a token |
//! | `STUDYTRAIL_UNLOAD_TIMEOUT_SECS` | No | 5 | Upper bound on the final flush |
//!
//! # Example
//!
//! ```no_run
//! use studytrail_telemetry::config::Config;
//!
//! let config = Config::from_env().expect("Failed to load configuration");
//! println!("Deployment: {}", config.deployment);
//! ```

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use directories::BaseDirs;
use thiserror::Error;

use crate::buffer::{BufferLimits, DEFAULT_HIGH_WATER_MARK, DEFAULT_RETAIN_ON_OVERFLOW};
use crate::context::Deployment;
use crate::dispatcher::{DispatchSettings, RetryPolicy};
use crate::telemetry::{
    TelemetryConfig, DEFAULT_FLUSH_INTERVAL_SECS, DEFAULT_UNLOAD_TIMEOUT_SECS,
};

/// Default token directory name relative to home.
const DEFAULT_TOKEN_DIR: &str = ".studytrail";

/// Default token file name inside the token directory.
const DEFAULT_TOKEN_FILE: &str = "token";

const ENV_COLLECTOR_URL: &str = "STUDYTRAIL_COLLECTOR_URL";
const ENV_DEPLOYMENT: &str = "STUDYTRAIL_DEPLOYMENT";
const ENV_FLUSH_INTERVAL: &str = "STUDYTRAIL_FLUSH_INTERVAL_SECS";
const ENV_HIGH_WATER: &str = "STUDYTRAIL_BUFFER_HIGH_WATER";
const ENV_RETAIN: &str = "STUDYTRAIL_BUFFER_RETAIN";
const ENV_TOKEN_PATH: &str = "STUDYTRAIL_TOKEN_PATH";
const ENV_BOUND_UNAUTHENTICATED: &str = "STUDYTRAIL_BOUND_UNAUTHENTICATED";
const ENV_UNLOAD_TIMEOUT: &str = "STUDYTRAIL_UNLOAD_TIMEOUT_SECS";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,
}

/// Configuration for the telemetry client.
#[derive(Debug, Clone)]
pub struct Config {
    /// Collector base URL. Always present for live deployments.
    pub collector_url: Option<String>,

    /// Whether events are delivered or discarded.
    pub deployment: Deployment,

    /// Seconds between timer flushes.
    pub flush_interval_secs: u64,

    /// Eviction limits applied after failed sends.
    pub buffer_limits: BufferLimits,

    /// File holding the bearer token.
    pub token_path: PathBuf,

    /// Apply the buffer bound while no token is available.
    pub bound_while_unauthenticated: bool,

    /// Upper bound on the final flush, in seconds.
    pub unload_timeout_secs: u64,
}

impl Config {
    /// Creates a new `Config` by parsing environment variables.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `STUDYTRAIL_COLLECTOR_URL` is not set for a live deployment
    /// - a numeric or boolean variable cannot be parsed, or is out of range
    /// - `STUDYTRAIL_BUFFER_RETAIN` is not below `STUDYTRAIL_BUFFER_HIGH_WATER`
    /// - the home directory cannot be determined (needed for the default token path)
    pub fn from_env() -> Result<Self, ConfigError> {
        let deployment = parse_var::<Deployment>(ENV_DEPLOYMENT)?.unwrap_or_default();

        // Required only when events are actually delivered
        let collector_url = env::var(ENV_COLLECTOR_URL)
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        if deployment.collects() && collector_url.is_none() {
            return Err(ConfigError::MissingEnvVar(ENV_COLLECTOR_URL.to_string()));
        }

        let flush_interval_secs =
            parse_var::<u64>(ENV_FLUSH_INTERVAL)?.unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS);
        if flush_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_FLUSH_INTERVAL.to_string(),
                message: "flush interval must be at least 1 second".to_string(),
            });
        }

        let high_water_mark =
            parse_var::<usize>(ENV_HIGH_WATER)?.unwrap_or(DEFAULT_HIGH_WATER_MARK);
        if high_water_mark == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_HIGH_WATER.to_string(),
                message: "high water mark must be greater than 0".to_string(),
            });
        }

        let retain = parse_var::<usize>(ENV_RETAIN)?.unwrap_or(DEFAULT_RETAIN_ON_OVERFLOW);
        if retain >= high_water_mark {
            return Err(ConfigError::InvalidValue {
                key: ENV_RETAIN.to_string(),
                message: format!("must be less than the high water mark ({high_water_mark})"),
            });
        }

        let token_path = match env::var(ENV_TOKEN_PATH) {
            Ok(path) => PathBuf::from(path),
            Err(_) => {
                let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
                base_dirs
                    .home_dir()
                    .join(DEFAULT_TOKEN_DIR)
                    .join(DEFAULT_TOKEN_FILE)
            }
        };

        let bound_while_unauthenticated =
            parse_var::<bool>(ENV_BOUND_UNAUTHENTICATED)?.unwrap_or(false);

        let unload_timeout_secs =
            parse_var::<u64>(ENV_UNLOAD_TIMEOUT)?.unwrap_or(DEFAULT_UNLOAD_TIMEOUT_SECS);

        Ok(Self {
            collector_url,
            deployment,
            flush_interval_secs,
            buffer_limits: BufferLimits {
                high_water_mark,
                retain,
            },
            token_path,
            bound_while_unauthenticated,
            unload_timeout_secs,
        })
    }

    /// Runtime settings for [`Telemetry`](crate::telemetry::Telemetry).
    #[must_use]
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            unload_timeout: Duration::from_secs(self.unload_timeout_secs),
            dispatch: DispatchSettings {
                deployment: self.deployment,
                limits: self.buffer_limits,
                retry_policy: RetryPolicy::default(),
                bound_while_unauthenticated: self.bound_while_unauthenticated,
            },
        }
    }
}

/// Reads and parses an optional variable. Unset yields `Ok(None)`.
fn parse_var<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e} (got '{val}')"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    /// Helper to run tests with isolated environment variables.
    /// Clears all STUDYTRAIL_* vars before the test and restores them after.
    fn with_clean_env<F, R>(f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let saved_vars: Vec<(String, String)> = env::vars()
            .filter(|(k, _)| k.starts_with("STUDYTRAIL_"))
            .collect();

        for (key, _) in &saved_vars {
            env::remove_var(key);
        }

        let result = f();

        for (key, _) in env::vars().filter(|(k, _)| k.starts_with("STUDYTRAIL_")) {
            env::remove_var(key);
        }
        for (key, value) in saved_vars {
            env::set_var(key, value);
        }

        result
    }

    #[test]
    #[serial]
    fn test_missing_collector_url() {
        with_clean_env(|| {
            let result = Config::from_env();
            assert!(result.is_err());

            let err = result.unwrap_err();
            assert!(
                matches!(err, ConfigError::MissingEnvVar(ref s) if s == "STUDYTRAIL_COLLECTOR_URL")
            );
        });
    }

    #[test]
    #[serial]
    fn test_minimal_config() {
        with_clean_env(|| {
            env::set_var("STUDYTRAIL_COLLECTOR_URL", "https://collector.example.com");

            let config = Config::from_env().expect("should parse minimal config");

            assert_eq!(
                config.collector_url.as_deref(),
                Some("https://collector.example.com")
            );
            assert_eq!(config.deployment, Deployment::Live);
            assert_eq!(config.flush_interval_secs, 30);
            assert_eq!(config.buffer_limits, BufferLimits::default());
            assert!(!config.bound_while_unauthenticated);
            assert_eq!(config.unload_timeout_secs, 5);
            assert!(config.token_path.ends_with(".studytrail/token"));
        });
    }

    #[test]
    #[serial]
    fn test_full_config() {
        with_clean_env(|| {
            env::set_var("STUDYTRAIL_COLLECTOR_URL", "https://collector.example.com");
            env::set_var("STUDYTRAIL_DEPLOYMENT", "live");
            env::set_var("STUDYTRAIL_FLUSH_INTERVAL_SECS", "10");
            env::set_var("STUDYTRAIL_BUFFER_HIGH_WATER", "200");
            env::set_var("STUDYTRAIL_BUFFER_RETAIN", "120");
            env::set_var("STUDYTRAIL_TOKEN_PATH", "/custom/token");
            env::set_var("STUDYTRAIL_BOUND_UNAUTHENTICATED", "true");
            env::set_var("STUDYTRAIL_UNLOAD_TIMEOUT_SECS", "2");

            let config = Config::from_env().expect("should parse full config");

            assert_eq!(config.flush_interval_secs, 10);
            assert_eq!(
                config.buffer_limits,
                BufferLimits {
                    high_water_mark: 200,
                    retain: 120
                }
            );
            assert_eq!(config.token_path, PathBuf::from("/custom/token"));
            assert!(config.bound_while_unauthenticated);
            assert_eq!(config.unload_timeout_secs, 2);

            let telemetry = config.telemetry_config();
            assert_eq!(telemetry.flush_interval, Duration::from_secs(10));
            assert_eq!(telemetry.unload_timeout, Duration::from_secs(2));
            assert_eq!(telemetry.dispatch.limits.retain, 120);
            assert!(telemetry.dispatch.bound_while_unauthenticated);
        });
    }

    #[test]
    #[serial]
    fn test_static_deployment_needs_no_collector() {
        with_clean_env(|| {
            env::set_var("STUDYTRAIL_DEPLOYMENT", "demo");

            let config = Config::from_env().expect("static deployments need no URL");

            assert_eq!(config.deployment, Deployment::Static);
            assert!(config.collector_url.is_none());
        });
    }

    #[test]
    #[serial]
    fn test_blank_collector_url_is_missing() {
        with_clean_env(|| {
            env::set_var("STUDYTRAIL_COLLECTOR_URL", "   ");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(_)));
        });
    }

    #[test]
    #[serial]
    fn test_unknown_deployment_rejected() {
        with_clean_env(|| {
            env::set_var("STUDYTRAIL_DEPLOYMENT", "staging");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, ref message }
                    if key == "STUDYTRAIL_DEPLOYMENT" && message.contains("staging")
            ));
        });
    }

    #[test]
    #[serial]
    fn test_invalid_flush_interval() {
        with_clean_env(|| {
            env::set_var("STUDYTRAIL_COLLECTOR_URL", "https://collector.example.com");
            env::set_var("STUDYTRAIL_FLUSH_INTERVAL_SECS", "soon");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "STUDYTRAIL_FLUSH_INTERVAL_SECS"
            ));
        });
    }

    #[test]
    #[serial]
    fn test_zero_flush_interval_rejected() {
        with_clean_env(|| {
            env::set_var("STUDYTRAIL_COLLECTOR_URL", "https://collector.example.com");
            env::set_var("STUDYTRAIL_FLUSH_INTERVAL_SECS", "0");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, ref message }
                    if key == "STUDYTRAIL_FLUSH_INTERVAL_SECS" && message.contains("at least 1 second")
            ));
        });
    }

    #[test]
    #[serial]
    fn test_retain_must_be_below_high_water() {
        with_clean_env(|| {
            env::set_var("STUDYTRAIL_COLLECTOR_URL", "https://collector.example.com");
            env::set_var("STUDYTRAIL_BUFFER_HIGH_WATER", "40");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, ref message }
                    if key == "STUDYTRAIL_BUFFER_RETAIN" && message.contains("(40)")
            ));
        });
    }

    #[test]
    #[serial]
    fn test_invalid_boolean_rejected() {
        with_clean_env(|| {
            env::set_var("STUDYTRAIL_COLLECTOR_URL", "https://collector.example.com");
            env::set_var("STUDYTRAIL_BOUND_UNAUTHENTICATED", "yes please");

            let err = Config::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidValue { ref key, .. } if key == "STUDYTRAIL_BOUND_UNAUTHENTICATED"
            ));
        });
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "STUDYTRAIL_BUFFER_RETAIN".to_string(),
            message: "must be less than the high water mark (100)".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for STUDYTRAIL_BUFFER_RETAIN: must be less than the high water mark (100)"
        );
        assert_eq!(
            ConfigError::NoHomeDirectory.to_string(),
            "failed to determine home directory"
        );
    }
}
