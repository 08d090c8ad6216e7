//! Process-wide discovery wiring
//!
//! Owns the registrar, the connection pool with its health sweep, and the
//! root cancellation token every resolver hangs off.

use anyhow::Result;
use discovery_core::{DiscoveryConfig, DiscoveryObserver, StoreBackend};
use discovery_etcd::{CoordinationClient, DiscoveryResolverBuilder, MemoryStore, ServiceRegistrar};
use discovery_pool::{
    ConnectionPool, DiscoveryConnector, DiscoveryMetrics, HealthCheckConfig, HealthSweep,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct DiscoveryContext {
    pub registrar: ServiceRegistrar,
    pub pool: Arc<ConnectionPool<DiscoveryConnector>>,
    pub metrics: Arc<DiscoveryMetrics>,
    sweep: HealthSweep,
    root: CancellationToken,
}

impl DiscoveryContext {
    /// Wire everything up. The coordination store itself is dialled lazily on
    /// first use.
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let client = match config.store.backend {
            StoreBackend::Etcd => CoordinationClient::new(config.store.clone()),
            StoreBackend::Memory => {
                info!("Using in-memory coordination store");
                CoordinationClient::with_store(Arc::new(MemoryStore::new()))
            }
        };
        Self::with_client(Arc::new(client), config)
    }

    pub fn with_client(client: Arc<CoordinationClient>, config: &DiscoveryConfig) -> Result<Self> {
        let metrics = Arc::new(DiscoveryMetrics::new()?);
        let observer: Arc<dyn DiscoveryObserver> = metrics.clone();
        let root = CancellationToken::new();

        let registrar =
            ServiceRegistrar::new(client.clone(), config.registrar.clone(), observer.clone());

        let builder = DiscoveryResolverBuilder::new(
            client,
            config.resolver.clone(),
            root.child_token(),
            observer.clone(),
        );
        let connector = DiscoveryConnector::new(config.pool.clone()).with_builder(Arc::new(builder));
        let pool = Arc::new(ConnectionPool::with_observer(connector, observer));

        let sweep = HealthSweep::start(
            pool.clone(),
            HealthCheckConfig::from(&config.pool),
            CancellationToken::new(),
        );

        info!(backend = ?config.store.backend, "Discovery context initialized");
        Ok(Self {
            registrar,
            pool,
            metrics,
            sweep,
            root,
        })
    }

    /// Advertise this process under `service_name` and report whether it
    /// took. Failure is logged; the gateway keeps serving without it.
    pub async fn advertise(&self, service_name: &str, address: &str) -> bool {
        match self.registrar.register(service_name, address).await {
            Ok(()) => true,
            Err(e) => {
                error!(service = %service_name, address = %address, error = %e, "Self-registration failed, serving unregistered");
                false
            }
        }
    }

    /// Tear down in dependency order: resolvers, registrations, pooled
    /// connections, then the sweep.
    pub async fn shutdown(mut self) {
        info!("Shutting down discovery context");
        self.root.cancel();
        self.registrar.shutdown().await;
        self.pool.close_all().await;
        self.sweep.stop().await;
        info!("Discovery context stopped");
    }
}
