//! Configuration handling for the sofa binary.
//!
//! Settings come from a YAML file with `server:` and `client:` sections,
//! then environment variables, then command-line flags (applied in `main`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sofa_session::{ClientConfig, MultiClientConfig, ServerConfig};
use std::path::Path;
use tracing::{info, warn};

/// Full binary configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SofaConfig {
    /// Listener settings for `serve` and the proxy front end
    pub server: ServerConfig,
    /// Outbound settings for `connect` and the proxy back end
    pub client: ClientConfig,
}

impl SofaConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing or unparsable file falls back to defaults with a warning.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<SofaConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Defaults plus environment overrides, for runs without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply `SOFA_*` overrides read through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("SOFA_HOST") {
            info!("Host overridden by environment: {}", host);
            self.server.host = host.clone();
            self.client.host = host;
        }

        if let Some(port) = lookup("SOFA_PORT").and_then(|v| v.parse::<u16>().ok()) {
            info!("Port overridden by environment: {}", port);
            self.server.port = port;
            self.client.port = port;
        }

        if let Some(divide) = lookup("SOFA_DIVIDE").and_then(|v| v.parse::<usize>().ok()) {
            info!("Partition count overridden by environment: {}", divide);
            self.server.divide = divide;
        }

        if let Some(size) = lookup("SOFA_READ_BUFFER").and_then(|v| v.parse::<usize>().ok()) {
            info!("Read buffer overridden by environment: {}", size);
            self.server.read_buffer_size = size;
            self.client.read_buffer_size = size;
        }

        if let Some(ms) = lookup("SOFA_IDLE_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            info!("Idle timeout overridden by environment: {}ms", ms);
            self.server.idle_timeout_ms = ms;
            self.client.idle_timeout_ms = ms;
        }
    }

    /// Settings for the proxy's outbound bundle
    pub fn multi_client(&self) -> MultiClientConfig {
        MultiClientConfig {
            read_buffer_size: self.client.read_buffer_size,
            divide: self.server.divide,
            idle_timeout_ms: self.client.idle_timeout_ms,
        }
    }
}
