//! Node configuration

use anyhow::{Context, bail};
use repmgr_core::{RemoteSiteConfig, RepMgrConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Node configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Log output format
    pub log_format: LogFormat,
    /// Replication manager settings
    pub repmgr: RepMgrConfig,
}

impl NodeConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid node configuration")
    }

    /// Load a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config = Self::from_toml(&content)?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load configuration from an optional file, then environment variables
    /// Priority: Environment variables > config file > defaults
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.repmgr.validate()?;
        Ok(config)
    }

    /// Apply `REPMGR_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let repmgr = &mut self.repmgr;
        if let Some(host) = lookup("REPMGR_LOCAL_HOST") {
            repmgr.local_host = host;
        }
        if let Some(port) = lookup("REPMGR_LOCAL_PORT") {
            repmgr.local_port = parse_var("REPMGR_LOCAL_PORT", &port)?;
        }
        if let Some(priority) = lookup("REPMGR_PRIORITY") {
            repmgr.priority = parse_var("REPMGR_PRIORITY", &priority)?;
        }
        if let Some(sites) = lookup("REPMGR_REMOTE_SITES") {
            repmgr.remote_sites = parse_sites(&sites)?;
        }
        if let Some(secs) = lookup("REPMGR_ACK_TIMEOUT_SECS") {
            repmgr.ack_timeout_secs = parse_var("REPMGR_ACK_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("REPMGR_CONNECTION_RETRY_SECS") {
            repmgr.connection_retry_secs = parse_var("REPMGR_CONNECTION_RETRY_SECS", &secs)?;
        }
        if let Some(limit) = lookup("REPMGR_OUT_QUEUE_LIMIT") {
            repmgr.out_queue_limit = parse_var("REPMGR_OUT_QUEUE_LIMIT", &limit)?;
        }
        if let Some(format) = lookup("REPMGR_LOG_FORMAT") {
            self.log_format = match format.to_ascii_lowercase().as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                other => bail!("REPMGR_LOG_FORMAT must be text or json, got {:?}", other),
            };
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid {}: {:?}", key, value))
}

/// Parse `host:port[,host:port...]`
fn parse_sites(value: &str) -> anyhow::Result<Vec<RemoteSiteConfig>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (host, port) = entry
                .rsplit_once(':')
                .with_context(|| format!("remote site {:?} is not host:port", entry))?;
            let port = parse_var("REPMGR_REMOTE_SITES", port)?;
            Ok(RemoteSiteConfig::new(host, port))
        })
        .collect()
}
