mod file_config;

pub use file_config::FileConfig;

use crate::upload_queue::{JobOptions, PollerConfig, UploadQueueSettings};
use anyhow::{anyhow, bail, Result};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_MAX_POLL_TICKS: u32 = 1800;
pub const DEFAULT_STATUS_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub destination: Option<String>,
    pub options: JobOptions,
    pub poll_interval_secs: u64,
    pub max_poll_ticks: u32,
    pub status_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            auth_token: None,
            destination: None,
            options: JobOptions::new(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_poll_ticks: DEFAULT_MAX_POLL_TICKS,
            status_timeout_secs: DEFAULT_STATUS_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Endpoint settings
    pub base_url: String,
    pub auth_token: Option<String>,
    pub destination: Option<String>,
    pub connect_timeout_secs: u64,
    pub status_timeout_secs: u64,

    // Status polling
    pub poll_interval_secs: u64,
    pub max_poll_ticks: u32,

    pub default_options: JobOptions,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let base_url = file
            .base_url
            .or_else(|| cli.base_url.clone())
            .ok_or_else(|| {
                anyhow!("base_url must be specified via --base-url or in config file")
            })?;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            bail!("base_url must be an http(s) URL, got {:?}", base_url);
        }

        let auth_token = file
            .auth_token
            .or_else(|| cli.auth_token.clone())
            .filter(|t| !t.is_empty());
        let destination = file.destination.or_else(|| cli.destination.clone());

        let poll_interval_secs = file.poll_interval_secs.unwrap_or(cli.poll_interval_secs);
        if poll_interval_secs == 0 {
            bail!("poll_interval_secs must be greater than 0");
        }
        let max_poll_ticks = file.max_poll_ticks.unwrap_or(cli.max_poll_ticks);
        if max_poll_ticks == 0 {
            bail!("max_poll_ticks must be greater than 0");
        }

        let status_timeout_secs = file.status_timeout_secs.unwrap_or(cli.status_timeout_secs);
        let connect_timeout_secs = file
            .connect_timeout_secs
            .unwrap_or(cli.connect_timeout_secs);

        // Per-key merge, file entries win
        let mut default_options = cli.options.clone();
        default_options.extend(file.default_options.unwrap_or_default());

        Ok(Self {
            base_url,
            auth_token,
            destination,
            connect_timeout_secs,
            status_timeout_secs,
            poll_interval_secs,
            max_poll_ticks,
            default_options,
        })
    }

    pub fn queue_settings(&self) -> UploadQueueSettings {
        UploadQueueSettings {
            destination: self.destination.clone(),
            poller: PollerConfig {
                interval: Duration::from_secs(self.poll_interval_secs),
                max_ticks: self.max_poll_ticks,
            },
        }
    }
}

/// Parses a `key=value` metadata option.
pub fn parse_option(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("option key is empty in {:?}", s));
    }
    Ok((key.to_string(), value.trim().to_string()))
}
