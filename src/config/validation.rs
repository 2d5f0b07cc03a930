//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, compression level in 0-9)
//! - Check that addresses parse and TLS files exist
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use std::path::Path;

use crate::config::schema::ServerConfig;

/// A single semantic problem in a configuration document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be at least 1"));
    }
    if let Some(tls) = &config.listener.tls {
        for (field, path) in [
            ("listener.tls.cert_path", &tls.cert_path),
            ("listener.tls.key_path", &tls.key_path),
        ] {
            if !Path::new(path).exists() {
                errors.push(ValidationError::new(field, format!("'{path}' does not exist")));
            }
        }
    }

    if config.timeouts.tls_handshake_secs == 0 {
        errors.push(ValidationError::new("timeouts.tls_handshake_secs", "must be positive"));
    }
    if config.timeouts.idle_secs == 0 {
        errors.push(ValidationError::new("timeouts.idle_secs", "must be positive"));
    }

    let limits = &config.limits;
    // "GET / HTTP/1.1" is the shortest useful request line.
    if limits.max_request_line < 16 {
        errors.push(ValidationError::new("limits.max_request_line", "must be at least 16"));
    }
    if limits.max_header_bytes == 0 {
        errors.push(ValidationError::new("limits.max_header_bytes", "must be positive"));
    }
    if limits.max_websocket_frame < 125 {
        errors.push(ValidationError::new(
            "limits.max_websocket_frame",
            "must allow at least a control frame (125 bytes)",
        ));
    }

    if config.compression.level > 9 {
        errors.push(ValidationError::new("compression.level", "must be between 0 and 9"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ServerConfig::default()), Ok(()));
    }

    #[test]
    fn reports_every_problem() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "nowhere".to_string();
        config.listener.max_connections = 0;
        config.compression.level = 12;
        config.listener.tls = Some(TlsConfig {
            cert_path: "/definitely/missing/cert.pem".to_string(),
            key_path: "/definitely/missing/key.pem".to_string(),
        });

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "listener.bind_address",
                "listener.max_connections",
                "listener.tls.cert_path",
                "listener.tls.key_path",
                "compression.level",
            ]
        );
    }
}
