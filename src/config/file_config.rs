use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Settings read from a TOML file. Every field is optional.
///
/// ```toml
/// base_url = "https://pool.example.com/api"
/// auth_token = "..."
/// destination = "main-catalog"
/// poll_interval_secs = 2
///
/// [default_options]
/// category = "house"
/// ```
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Endpoint settings (can override CLI)
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub destination: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub status_timeout_secs: Option<u64>,

    // Status polling
    pub poll_interval_secs: Option<u64>,
    pub max_poll_ticks: Option<u32>,

    /// Metadata fields attached to every enqueued archive.
    pub default_options: Option<BTreeMap<String, String>>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
