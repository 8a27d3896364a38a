//! Broker configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Broker settings, loadable from a TOML file.
///
/// Every field has a default so a partial (or missing) file works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address the QUIC endpoint binds to.
    pub bind_addr: String,
    /// Directory holding the per-room `.dat`/`.idx` files.
    pub data_dir: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            data_dir: PathBuf::from("db"),
        }
    }
}

impl BrokerConfig {
    /// Load from `path`, falling back to defaults when the file is missing
    /// or malformed.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    warn!(?path, error = %e, "malformed broker config, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
