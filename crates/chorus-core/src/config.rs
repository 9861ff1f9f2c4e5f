//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Server configuration.
///
/// Defaults plus the `PORT` environment variable cover the deployed setup;
/// tests construct values directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    /// TCP port for the HTTP/WebSocket listener.
    pub port: u16,

    /// ICE server URLs handed to every peer connection.
    pub ice_servers: Vec<String>,

    /// Seconds to wait for ICE candidate gathering before sending a session
    /// description with whatever has been gathered so far.
    pub gather_timeout_secs: u64,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            port: 80,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            gather_timeout_secs: 10,
        }
    }
}

impl SfuConfig {
    /// Defaults with `PORT` applied from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(_) => warn!(%port, "ignoring unparseable PORT"),
            }
        }
        config
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_secs(self.gather_timeout_secs)
    }
}
