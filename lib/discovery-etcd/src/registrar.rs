//! Service registration with self-healing lease renewal
//!
//! A registration is a key bound to a short lease. The renewal task keeps the
//! lease alive and, whenever the keep-alive stream ends, re-publishes the key
//! under a brand-new lease. It has no terminal failure state: it only stops
//! when the registration is withdrawn or the registrar shuts down.

use crate::client::CoordinationClient;
use crate::store::{CoordinationStore, Lease, LeaseId};
use discovery_core::{DiscoveryObserver, RegistrarConfig, Result, ServiceRecord};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

struct Registration {
    record: ServiceRecord,
    lease_id: Arc<AtomicI64>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// ServiceRegistrar advertises instances in the coordination store
pub struct ServiceRegistrar {
    client: Arc<CoordinationClient>,
    config: RegistrarConfig,
    observer: Arc<dyn DiscoveryObserver>,
    registrations: Mutex<HashMap<String, Registration>>,
    shutdown: CancellationToken,
}

impl ServiceRegistrar {
    pub fn new(
        client: Arc<CoordinationClient>,
        config: RegistrarConfig,
        observer: Arc<dyn DiscoveryObserver>,
    ) -> Self {
        Self {
            client,
            config,
            observer,
            registrations: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Publish `address` under `service_name` and keep it alive.
    ///
    /// Registering a pair that is already registered is a no-op.
    pub async fn register(&self, service_name: &str, address: &str) -> Result<()> {
        let record = ServiceRecord::new(service_name, address);
        let mut registrations = self.registrations.lock().await;

        if registrations.contains_key(&record.id()) {
            debug!(record = %record, "Service already registered");
            return Ok(());
        }

        let store = self.client.store().await?;
        info!(key = %record.key(), "Registering service");

        let lease = self.publish_initial(store.as_ref(), &record).await?;
        let lease_id = Arc::new(AtomicI64::new(lease.id));
        let cancel = self.shutdown.child_token();

        let renewal = RenewalTask {
            store,
            record: record.clone(),
            ttl: self.config.lease_ttl(),
            retry_delay: self.config.retry_delay(),
            lease_id: lease_id.clone(),
            cancel: cancel.clone(),
            observer: self.observer.clone(),
        };
        let task = tokio::spawn(renewal.run(lease));

        info!(key = %record.key(), lease_id = lease.id, ttl = ?lease.ttl, "Service registered");
        registrations.insert(
            record.id(),
            Registration {
                record,
                lease_id,
                cancel,
                task,
            },
        );
        Ok(())
    }

    async fn publish_initial(
        &self,
        store: &dyn CoordinationStore,
        record: &ServiceRecord,
    ) -> Result<Lease> {
        let attempts = self.config.initial_attempts.max(1);
        let mut attempt = 1;
        loop {
            match publish(store, record, self.config.lease_ttl()).await {
                Ok(lease) => return Ok(lease),
                Err(e) if attempt < attempts => {
                    warn!(key = %record.key(), attempt, error = %e, "Registration failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(e) => {
                    error!(key = %record.key(), attempts, error = %e, "Registration failed");
                    return Err(e);
                }
            }
        }
    }

    /// Withdraw a registration: stop renewing, delete the key and revoke the
    /// lease. The key is deleted even if this registrar never published it.
    pub async fn unregister(&self, service_name: &str, address: &str) -> Result<()> {
        let record = ServiceRecord::new(service_name, address);
        let registration = self.registrations.lock().await.remove(&record.id());

        let lease_id = match registration {
            Some(registration) => {
                registration.cancel.cancel();
                if let Err(e) = registration.task.await {
                    warn!(key = %record.key(), error = %e, "Renewal task ended abnormally");
                }
                Some(registration.lease_id.load(Ordering::SeqCst))
            }
            None => None,
        };

        let store = self.client.store().await?;
        store.delete(&record.key()).await?;

        if let Some(lease_id) = lease_id {
            if let Err(e) = store.revoke_lease(lease_id).await {
                warn!(key = %record.key(), lease_id, error = %e, "Failed to revoke lease");
            }
        }

        info!(key = %record.key(), "Service unregistered");
        Ok(())
    }

    /// Unregister everything, best effort
    pub async fn shutdown(&self) {
        let records: Vec<ServiceRecord> = self
            .registrations
            .lock()
            .await
            .values()
            .map(|r| r.record.clone())
            .collect();

        for record in records {
            if let Err(e) = self.unregister(&record.service_name, &record.address).await {
                warn!(key = %record.key(), error = %e, "Failed to unregister service");
            }
        }
        self.shutdown.cancel();
    }

    /// Lease currently backing a registration
    pub async fn lease_id(&self, service_name: &str, address: &str) -> Option<LeaseId> {
        let id = ServiceRecord::new(service_name, address).id();
        self.registrations
            .lock()
            .await
            .get(&id)
            .map(|r| r.lease_id.load(Ordering::SeqCst))
    }

    pub async fn registrations(&self) -> Vec<ServiceRecord> {
        self.registrations
            .lock()
            .await
            .values()
            .map(|r| r.record.clone())
            .collect()
    }
}

/// Grant a lease and write the record under it
async fn publish(store: &dyn CoordinationStore, record: &ServiceRecord, ttl: Duration) -> Result<Lease> {
    let lease = store.grant_lease(ttl).await?;
    if let Err(e) = store.put(&record.key(), lease.id).await {
        let _ = store.revoke_lease(lease.id).await;
        return Err(e);
    }
    Ok(lease)
}

struct RenewalTask {
    store: Arc<dyn CoordinationStore>,
    record: ServiceRecord,
    ttl: Duration,
    retry_delay: Duration,
    lease_id: Arc<AtomicI64>,
    cancel: CancellationToken,
    observer: Arc<dyn DiscoveryObserver>,
}

impl RenewalTask {
    async fn run(self, mut lease: Lease) {
        loop {
            if !self.renew(&lease).await {
                break;
            }

            warn!(key = %self.record.key(), lease_id = lease.id, "Lease lost, re-registering");
            self.observer.on_lease_lost(&self.record);

            lease = match self.republish().await {
                Some(lease) => lease,
                None => break,
            };
            self.lease_id.store(lease.id, Ordering::SeqCst);
            self.observer.on_reregistered(&self.record);
            info!(key = %self.record.key(), lease_id = lease.id, "Service re-registered");
        }
        debug!(key = %self.record.key(), "Lease renewal stopped");
    }

    /// Consume keep-alives until the stream ends. Returns `false` if
    /// cancelled.
    async fn renew(&self, lease: &Lease) -> bool {
        let mut renewals = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            result = self.store.keep_alive(lease) => match result {
                Ok(renewals) => renewals,
                Err(e) => {
                    warn!(key = %self.record.key(), lease_id = lease.id, error = %e, "Failed to start lease renewal");
                    return true;
                }
            },
        };

        debug!(key = %self.record.key(), lease_id = lease.id, "Lease renewal started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                next = renewals.next() => match next {
                    Some(Ok(ttl)) => trace!(lease_id = lease.id, ttl = ?ttl, "Lease renewed"),
                    Some(Err(e)) => {
                        warn!(key = %self.record.key(), lease_id = lease.id, error = %e, "Lease renewal failed");
                        return true;
                    }
                    None => {
                        warn!(key = %self.record.key(), lease_id = lease.id, "Keep-alive stream closed");
                        return true;
                    }
                },
            }
        }
    }

    /// Publish under a fresh lease, retrying with a fixed delay until it
    /// succeeds. Returns `None` if cancelled.
    async fn republish(&self) -> Option<Lease> {
        let mut attempt: u64 = 0;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }

            attempt += 1;
            match publish(self.store.as_ref(), &self.record, self.ttl).await {
                Ok(lease) => return Some(lease),
                Err(e) => {
                    warn!(key = %self.record.key(), attempt, error = %e, "Re-registration failed, retrying");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use discovery_core::noop_observer;

    fn registrar(store: &MemoryStore) -> ServiceRegistrar {
        let client = Arc::new(CoordinationClient::with_store(Arc::new(store.clone())));
        ServiceRegistrar::new(client, RegistrarConfig::default(), noop_observer())
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_writes_key() {
        let store = MemoryStore::new();
        let registrar = registrar(&store);

        registrar.register("github-oauth-service", "10.0.0.5:9001").await.unwrap();

        let key = "/services/github-oauth-service/10.0.0.5:9001";
        assert_eq!(store.keys("/services/github-oauth-service/"), vec![key]);
        assert_eq!(
            store.lease_of(key),
            registrar.lease_id("github-oauth-service", "10.0.0.5:9001").await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_twice_is_idempotent() {
        let store = MemoryStore::new();
        let registrar = registrar(&store);

        registrar.register("svc", "10.0.0.5:9001").await.unwrap();
        registrar.register("svc", "10.0.0.5:9001").await.unwrap();

        assert_eq!(store.keys("/services/svc/").len(), 1);
        assert_eq!(store.lease_count(), 1);
        assert_eq!(registrar.registrations().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_outlives_ttl_while_renewed() {
        let store = MemoryStore::new();
        let registrar = registrar(&store);
        registrar.register("svc", "10.0.0.5:9001").await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.keys("/services/svc/").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_fails_when_store_offline() {
        let store = MemoryStore::new();
        store.set_available(false);
        let registrar = registrar(&store);

        assert!(registrar.register("svc", "10.0.0.5:9001").await.is_err());
        assert!(registrar.registrations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_deletes_key_and_lease() {
        let store = MemoryStore::new();
        let registrar = registrar(&store);
        registrar.register("svc", "10.0.0.5:9001").await.unwrap();

        registrar.unregister("svc", "10.0.0.5:9001").await.unwrap();
        assert!(store.keys("/services/svc/").is_empty());
        assert_eq!(store.lease_count(), 0);
        assert!(registrar.registrations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_unregisters_everything() {
        let store = MemoryStore::new();
        let registrar = registrar(&store);
        registrar.register("a", "10.0.0.5:9001").await.unwrap();
        registrar.register("b", "10.0.0.6:9001").await.unwrap();

        registrar.shutdown().await;
        assert!(store.keys("/services/").is_empty());
    }
}
