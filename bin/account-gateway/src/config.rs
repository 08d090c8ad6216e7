//! Gateway configuration file

use account_oauth::OAuthConfig;
use anyhow::{Context, Result};
use discovery_core::{DiscoveryConfig, ETCD_ENDPOINTS_ENV};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::warn;

pub const CONFIG_ENV: &str = "ACCOUNT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/server.yaml";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub log_format: LogFormat,
    /// Name this gateway registers under
    pub service_name: String,
    /// Address advertised to other services. Self-registration is skipped
    /// when unset.
    pub advertise_addr: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], 8080).into(),
            log_format: LogFormat::Text,
            service_name: "account-service".to_string(),
            advertise_addr: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub discovery: DiscoveryConfig,
    pub oauth: OAuthConfig,
}

impl GatewayConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("invalid gateway configuration")?;
        Ok(config)
    }

    /// Load from `$ACCOUNT_CONFIG` (or the default path), falling back to
    /// defaults when the default file does not exist
    pub fn load() -> Result<Self> {
        let explicit = std::env::var(CONFIG_ENV).ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut config = if explicit.is_none() && !Path::new(&path).exists() {
            warn!(path = %path, "Configuration file not found, using defaults");
            Self::default()
        } else {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path))?;
            Self::from_yaml(&text)?
        };

        config
            .discovery
            .finalize(std::env::var(ETCD_ENDPOINTS_ENV).ok())?;
        Ok(config)
    }
}
