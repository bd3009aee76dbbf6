//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! The core's `EXO_*` / `PUBSUB_ADAPTER` switches are applied on top of
//! whatever the file provides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP/WS server to (0 = auto-allocate).
    /// Override: `EXO_BIND_PORT`
    pub bind_port: u16,

    /// Core pipeline configuration (bus, ingest, asr, consumer, ...).
    /// Field names follow `exoassist_core::Config`.
    pub core: exoassist_core::Config,
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: ServerConfig = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("EXO_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }
        self.core.apply_env_overrides();
    }

    /// Converts to the core's Config type.
    pub fn to_core_config(&self) -> exoassist_core::Config {
        let mut core = self.core.clone();
        core.preferred_port = self.bind_port;
        core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_loads_without_file() {
        let config = ServerConfig::load(None).unwrap();
        assert!(config.to_core_config().validate().is_ok());
    }

    #[test]
    fn yaml_overrides_core_fields() {
        let yaml = r#"
bind_port: 9100
core:
  ingest:
    max_buffer_ms: 750
    idle_close_s: 5
    max_buffer_drops: 100
    bridge_enabled: true
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bind_port, 9100);
        assert_eq!(config.core.ingest.max_buffer_ms, 750);
        assert_eq!(config.to_core_config().preferred_port, 9100);
    }
}
