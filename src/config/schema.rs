//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the HTTP transport.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, TLS, proxy trust).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Wire-level size limits.
    pub limits: LimitsConfig,

    /// Response compression.
    pub compression: CompressionConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Trust `X-Forwarded-For` for the caller address.
    pub behind_proxy: bool,

    /// Maximum concurrent connections (admission valve).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            behind_proxy: false,
            max_connections: 200,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long a connection may sit idle waiting for the next request line.
    pub idle_secs: u64,

    /// Upper bound on the TLS handshake.
    pub tls_handshake_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_secs: 60,
            tls_handshake_secs: 10,
        }
    }
}

/// Size limits applied while parsing hostile input.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Longest accepted request line, in bytes.
    pub max_request_line: usize,

    /// Largest accepted header block, in bytes.
    pub max_header_bytes: usize,

    /// Largest request body buffered ahead of an h2c upgrade.
    pub h2c_upgrade_body_limit: usize,

    /// Largest accepted WebSocket frame payload.
    pub max_websocket_frame: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_line: 8 * 1024,
            max_header_bytes: 64 * 1024,
            h2c_upgrade_body_limit: 65_535,
            max_websocket_frame: 16 * 1024 * 1024,
        }
    }
}

/// Response compression configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Gzip responses for peers that accept it.
    pub enabled: bool,

    /// Compression level, 0-9.
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 6,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.listener.max_connections, 200);
        assert_eq!(config.limits.h2c_upgrade_body_limit, 65_535);
        assert!(config.compression.enabled);
        assert!(config.listener.tls.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [listener]
            bind_address = "127.0.0.1:9000"
            behind_proxy = true

            [listener.tls]
            cert_path = "cert.pem"
            key_path = "key.pem"

            [limits]
            max_header_bytes = 1024
            "#,
        )
        .unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:9000");
        assert!(config.listener.behind_proxy);
        assert_eq!(config.listener.max_connections, 200);
        assert_eq!(config.listener.tls.unwrap().key_path, "key.pem");
        assert_eq!(config.limits.max_header_bytes, 1024);
        assert_eq!(config.limits.max_request_line, 8 * 1024);
    }
}
