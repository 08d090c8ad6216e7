//! Registers one service instance and keeps it advertised until interrupted

use anyhow::{bail, Context, Result};
use discovery_core::{noop_observer, DiscoveryConfig, StoreBackend};
use discovery_etcd::{CoordinationClient, ServiceRegistrar};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::fmt::init as tracing_init;

const CONFIG_ENV: &str = "REGISTRAR_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/server.yaml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegistrarFile {
    registration: Registration,
    discovery: DiscoveryConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Registration {
    service_name: String,
    address: String,
}

impl RegistrarFile {
    fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let text = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path))?;
        let mut file: Self = serde_yaml::from_str(&text).with_context(|| format!("invalid {}", path))?;

        file.discovery
            .finalize(std::env::var(discovery_core::ETCD_ENDPOINTS_ENV).ok())?;
        file.check()?;
        Ok(file)
    }

    fn check(&self) -> Result<()> {
        if self.registration.service_name.is_empty() || self.registration.address.is_empty() {
            bail!("registration.service_name and registration.address are required");
        }
        // nobody else can see an in-process store
        if self.discovery.store.backend != StoreBackend::Etcd {
            bail!("service-registrar requires the etcd store backend");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    info!("Starting service-registrar...");

    let file = RegistrarFile::load()?;
    let client = Arc::new(CoordinationClient::new(file.discovery.store.clone()));

    let registrar = ServiceRegistrar::new(client, file.discovery.registrar.clone(), noop_observer());
    let Registration {
        service_name,
        address,
    } = &file.registration;
    registrar.register(service_name, address).await?;
    info!(service = %service_name, address = %address, "Registered; press Ctrl-C to withdraw");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Err(e) = registrar.unregister(service_name, address).await {
        error!(service = %service_name, error = %e, "Failed to withdraw registration; the lease will expire it");
    }
    registrar.shutdown().await;
    info!("service-registrar stopped");
    Ok(())
}
