//! Configuration loading from a TOML file, with defaults.
//!
//! ```toml
//! [server]
//! port = 5000
//! dual_stack = true
//!
//! [connection]
//! request_timeout_ms = 2000
//! write_timeout_ms = 10000
//! asymmetric_key_bits = 4096
//! symmetric_key_bits = 256
//! ```

use crate::message::MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Settings for the connection registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port used by `keelnet serve` when none is given on the command line.
    pub port: u16,
    /// Also listen on the IPv6 wildcard address.
    pub dual_stack: bool,
    /// Capacity of the client added/removed event channel.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            dual_stack: true,
            event_capacity: 256,
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Default wait for a correlated response.
    pub request_timeout_ms: u64,
    /// Longest a single frame write may take before the connection is
    /// considered lost.
    pub write_timeout_ms: u64,
    /// RSA modulus size for the handshake keypair.
    pub asymmetric_key_bits: u32,
    /// AES key size requested during the handshake (128, 192 or 256).
    pub symmetric_key_bits: u32,
    /// How long an unclaimed response stays buffered.
    pub reply_retention_ms: u64,
    /// Upper bound on buffered unclaimed responses.
    pub max_buffered_replies: usize,
    /// Largest accepted frame body.
    pub max_message_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 2000,
            write_timeout_ms: 10_000,
            asymmetric_key_bits: 4096,
            symmetric_key_bits: 256,
            reply_retention_ms: 30_000,
            max_buffered_replies: 1024,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn reply_retention(&self) -> Duration {
        Duration::from_millis(self.reply_retention_ms)
    }
}

/// Load configuration from a TOML file.
///
/// A missing, unreadable or invalid file is logged and the defaults are used.
pub fn load_config(path: Option<&Path>) -> WireConfig {
    let Some(path) = path else {
        return WireConfig::default();
    };

    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return WireConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<WireConfig>(&contents) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "Failed to parse config, using defaults"
                );
                WireConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %path.display(),
                "Failed to read config file, using defaults"
            );
            WireConfig::default()
        }
    }
}
