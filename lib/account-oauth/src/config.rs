//! OAuth caller configuration

use discovery_pool::TlsClientSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const GITHUB_OAUTH_SERVICE: &str = "github-oauth-service";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Discovery name of the GitHub OAuth service
    pub service_name: String,
    /// Deadline applied to each RPC
    pub request_timeout_ms: u64,
    pub tls: TlsClientSettings,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            service_name: GITHUB_OAUTH_SERVICE.to_string(),
            request_timeout_ms: 5000,
            tls: TlsClientSettings::default(),
        }
    }
}

impl OAuthConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
