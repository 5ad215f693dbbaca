//! Startup error types.
//!
//! Everything here is fatal: the relay logs the error and exits. Per-request
//! failures never become a `RelayError`, they are mapped straight to an HTTP
//! status in the gateway.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for relay startup operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    // ── Configuration ─────────────────────────────────────────────────────
    /// Config file could not be read
    #[error("Unable to read config file '{path}': {source} (check that CONFIGURATION_DIRECTORY or --config is set correctly)")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML or has unexpected keys
    #[error("Invalid config file '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// QoS outside 0..=2
    #[error("Invalid QoS level {0} (expected 0, 1 or 2)")]
    InvalidQos(u8),

    // ── Broker ────────────────────────────────────────────────────────────
    /// Broker refused or could not be reached during startup
    #[error("Unable to connect to MQTT broker at {host}:{port}: {source}")]
    BrokerUnreachable {
        host: String,
        port: u16,
        #[source]
        source: rumqttc::ConnectionError,
    },

    /// No CONNACK within the startup window
    #[error("Timed out connecting to MQTT broker at {host}:{port}")]
    BrokerTimeout { host: String, port: u16 },

    // ── HTTP ──────────────────────────────────────────────────────────────
    /// HTTP listener could not be bound
    #[error("Failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// HTTP server terminated with an error
    #[error("HTTP server error: {0}")]
    Serve(#[source] std::io::Error),
}
