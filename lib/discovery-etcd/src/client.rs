//! Process-wide handle to the coordination store

use crate::etcd::EtcdStore;
use crate::memory::MemoryStore;
use crate::store::CoordinationStore;
use discovery_core::{Result, StoreBackend, StoreConfig};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// CoordinationClient connects to the configured store lazily, exactly once.
///
/// Concurrent first callers share a single connection attempt. A failed
/// attempt leaves the cell empty so the next caller tries again. The
/// configuration is fixed at construction.
pub struct CoordinationClient {
    config: StoreConfig,
    store: OnceCell<Arc<dyn CoordinationStore>>,
}

impl CoordinationClient {
    /// Create a client that connects on first use
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            store: OnceCell::new(),
        }
    }

    /// Wrap an already constructed store
    pub fn with_store(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            config: StoreConfig::default(),
            store: OnceCell::new_with(Some(store)),
        }
    }

    /// Get the shared store, connecting if this is the first call
    pub async fn store(&self) -> Result<Arc<dyn CoordinationStore>> {
        let store = self
            .store
            .get_or_try_init(|| async {
                let store: Arc<dyn CoordinationStore> = match self.config.backend {
                    StoreBackend::Etcd => match EtcdStore::connect(&self.config).await {
                        Ok(store) => Arc::new(store),
                        Err(e) => {
                            warn!(error = %e, "Failed to initialize coordination client");
                            return Err(e);
                        }
                    },
                    StoreBackend::Memory => Arc::new(MemoryStore::new()),
                };
                info!(backend = ?self.config.backend, "Coordination client initialized");
                Ok(store)
            })
            .await?;

        Ok(store.clone())
    }

    /// Whether the store has been connected
    pub fn is_initialized(&self) -> bool {
        self.store.initialized()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_initializes_once() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            ..Default::default()
        };
        let client = Arc::new(CoordinationClient::new(config));
        assert!(!client.is_initialized());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.store().await.unwrap() })
            })
            .collect();

        let mut stores = Vec::new();
        for handle in handles {
            stores.push(handle.await.unwrap());
        }
        assert!(client.is_initialized());
        assert!(stores.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_with_store() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let client = CoordinationClient::with_store(store.clone());
        assert!(client.is_initialized());
        assert!(Arc::ptr_eq(&client.store().await.unwrap(), &store));
    }
}
