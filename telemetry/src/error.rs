//! Error types for the StudyTrail telemetry client.
//!
//! Capture never fails, so these errors only surface from setup (loading
//! configuration, building a transport) and from the command-line driver.

use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Errors that can occur while setting up or driving the telemetry client.
///
/// # Examples
///
/// ```
/// use studytrail_telemetry::error::{Result, TelemetryError};
///
/// fn parse_line(line: &str) -> Result<serde_json::Value> {
///     Ok(serde_json::from_str(line)?)
/// }
///
/// assert!(matches!(parse_line("{"), Err(TelemetryError::Json(_))));
/// ```
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Batch delivery or transport setup error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_error_config_display() {
        let config_err = ConfigError::MissingEnvVar("STUDYTRAIL_COLLECTOR_URL".to_string());
        let err = TelemetryError::Config(config_err);
        assert_eq!(
            err.to_string(),
            "configuration error: missing required environment variable: STUDYTRAIL_COLLECTOR_URL"
        );
    }

    #[test]
    fn telemetry_error_transport_display() {
        let err: TelemetryError = TransportError::AuthFailed.into();
        assert!(matches!(err, TelemetryError::Transport(_)));
        assert_eq!(
            err.to_string(),
            "transport error: authentication failed: collector rejected the token"
        );
    }

    #[test]
    fn telemetry_error_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TelemetryError = io_err.into();
        assert!(matches!(err, TelemetryError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn telemetry_error_json_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ invalid json }").unwrap_err();
        let err: TelemetryError = json_err.into();
        assert!(matches!(err, TelemetryError::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }

    #[test]
    fn error_source_chain() {
        use std::error::Error;

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: TelemetryError = io_err.into();

        assert!(err.source().is_some());
    }
}
