//! Client TLS for outbound service-to-service connections

use discovery_core::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tonic::transport::{Certificate, ClientTlsConfig, Identity};
use tracing::{debug, info};

/// PEM files used to build a [`ClientTlsConfig`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientSettings {
    /// CA certificate used to verify the server
    pub ca_file: Option<PathBuf>,
    /// Expected server name, when it differs from the dialled host
    pub domain_name: Option<String>,
    /// Client certificate and key for mutual TLS
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl TlsClientSettings {
    pub fn with_ca_file(ca_file: impl Into<PathBuf>) -> Self {
        Self {
            ca_file: Some(ca_file.into()),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ca_file.is_some()
    }

    /// Load the PEM files. Returns `None` when no CA file is configured.
    pub async fn load(&self) -> Result<Option<ClientTlsConfig>> {
        let Some(ca_file) = &self.ca_file else {
            return Ok(None);
        };

        let ca_pem = read_pem(ca_file).await?;
        let mut config = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca_pem));
        debug!(ca_file = %ca_file.display(), "CA certificate loaded");

        if let Some(domain) = &self.domain_name {
            config = config.domain_name(domain.clone());
        }

        match (&self.cert_file, &self.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let cert_pem = read_pem(cert_file).await?;
                let key_pem = read_pem(key_file).await?;
                config = config.identity(Identity::from_pem(cert_pem, key_pem));
                info!("Client TLS configured with mutual authentication");
            }
            (None, None) => info!("Client TLS configured"),
            _ => {
                return Err(DiscoveryError::Config(
                    "cert_file and key_file must be set together".to_string(),
                ))
            }
        }

        Ok(Some(config))
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>> {
    let pem = tokio::fs::read(path).await.map_err(|e| {
        DiscoveryError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    if pem.is_empty() {
        return Err(DiscoveryError::Config(format!("{} is empty", path.display())));
    }
    Ok(pem)
}
