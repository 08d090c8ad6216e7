//! Connection pool keyed by service name
//!
//! At most one connection is cached per service. Lookups take the shared lock
//! and return a healthy entry directly; building or replacing an entry only
//! happens under the exclusive lock after re-checking, so concurrent callers
//! for the same service trigger a single build.

use crate::connector::{Connector, PooledConnection};
use crate::state::ConnectionState;
use discovery_core::{noop_observer, DiscoveryObserver, Result, Target};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tonic::transport::ClientTlsConfig;
use tracing::{debug, info, warn};

/// Pool view of one service's entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Absent,
    Ready,
    Unhealthy,
}

struct PoolEntry<T> {
    connection: T,
    last_known_state: ConnectionState,
    // reused when the sweep rebuilds this entry
    tls: Option<ClientTlsConfig>,
    built_at: Instant,
}

impl<T: PooledConnection> PoolEntry<T> {
    fn refresh(&mut self) -> ConnectionState {
        self.last_known_state = self.connection.state();
        self.last_known_state
    }
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    entries: RwLock<HashMap<String, PoolEntry<C::Connection>>>,
    observer: Arc<dyn DiscoveryObserver>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C) -> Self {
        Self::with_observer(connector, noop_observer())
    }

    pub fn with_observer(connector: C, observer: Arc<dyn DiscoveryObserver>) -> Self {
        Self {
            connector,
            entries: RwLock::new(HashMap::new()),
            observer,
        }
    }

    /// Return a usable connection to `service_name`, building one if none is
    /// cached or the cached one is unhealthy.
    ///
    /// A failed build is returned to the caller and nothing is cached.
    pub async fn get_connection(
        &self,
        service_name: &str,
        tls: Option<ClientTlsConfig>,
    ) -> Result<C::Connection> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(service_name) {
                if entry.connection.state().is_usable() {
                    return Ok(entry.connection.clone());
                }
            }
        }

        let mut entries = self.entries.write().await;
        // someone else may have built it while we waited for the lock
        if let Some(entry) = entries.get_mut(service_name) {
            if entry.refresh().is_usable() {
                return Ok(entry.connection.clone());
            }
        }

        let connection = self.build(service_name, tls.as_ref()).await?;
        let replaced = self.install(&mut entries, service_name, connection.clone(), tls);
        self.observer.on_connection_built(service_name, replaced);
        self.observer.on_pool_size(entries.len());
        Ok(connection)
    }

    /// Current view of the entry for `service_name`
    pub async fn entry_state(&self, service_name: &str) -> EntryState {
        let entries = self.entries.read().await;
        match entries.get(service_name) {
            None => EntryState::Absent,
            Some(entry) if entry.connection.state().is_usable() => EntryState::Ready,
            Some(_) => EntryState::Unhealthy,
        }
    }

    /// Rebuild every cached entry that is no longer usable. Returns how many
    /// entries were replaced.
    pub async fn sweep(&self) -> usize {
        let names: Vec<String> = self.entries.read().await.keys().cloned().collect();
        debug!(entries = names.len(), "Sweeping connection pool");

        let mut rebuilt = 0;
        for name in names {
            if self.rebuild_if_unhealthy(&name).await {
                rebuilt += 1;
            }
        }
        if rebuilt > 0 {
            info!(rebuilt, "Connection pool sweep replaced unhealthy entries");
        }
        rebuilt
    }

    async fn rebuild_if_unhealthy(&self, service_name: &str) -> bool {
        {
            let entries = self.entries.read().await;
            match entries.get(service_name) {
                Some(entry) if !entry.connection.state().is_usable() => {}
                _ => return false,
            }
        }

        let mut entries = self.entries.write().await;
        // gone after close_all, or rebuilt by a caller meanwhile
        let Some(entry) = entries.get_mut(service_name) else {
            return false;
        };
        if entry.refresh().is_usable() {
            return false;
        }
        let tls = entry.tls.clone();

        match self.build(service_name, tls.as_ref()).await {
            Ok(connection) => {
                self.install(&mut entries, service_name, connection, tls);
                self.observer.on_connection_built(service_name, true);
                true
            }
            Err(e) => {
                warn!(service = %service_name, error = %e, "Sweep failed to rebuild connection");
                false
            }
        }
    }

    async fn build(
        &self,
        service_name: &str,
        tls: Option<&ClientTlsConfig>,
    ) -> Result<C::Connection> {
        let target = Target::for_service(service_name);
        match self.connector.connect(&target, tls).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                warn!(service = %service_name, error = %e, "Failed to build connection");
                self.observer.on_connection_failed(service_name);
                Err(e)
            }
        }
    }

    /// Cache `connection`, closing whatever it replaced. Returns whether an
    /// entry was replaced.
    fn install(
        &self,
        entries: &mut HashMap<String, PoolEntry<C::Connection>>,
        service_name: &str,
        connection: C::Connection,
        tls: Option<ClientTlsConfig>,
    ) -> bool {
        let entry = PoolEntry {
            last_known_state: connection.state(),
            connection,
            tls,
            built_at: Instant::now(),
        };
        match entries.insert(service_name.to_string(), entry) {
            Some(old) => {
                info!(
                    service = %service_name,
                    previous_state = %old.last_known_state,
                    age_secs = old.built_at.elapsed().as_secs(),
                    "Replaced unhealthy connection"
                );
                old.connection.close();
                true
            }
            None => {
                info!(service = %service_name, "Connection established");
                false
            }
        }
    }

    /// Close every cached connection and empty the pool
    pub async fn close_all(&self) {
        let mut entries = self.entries.write().await;
        for (name, entry) in entries.drain() {
            debug!(service = %name, "Closing pooled connection");
            entry.connection.close();
        }
        self.observer.on_pool_size(0);
        info!("Connection pool closed");
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use discovery_core::DiscoveryError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone)]
    struct FakeConnection {
        id: usize,
        state: Arc<Mutex<ConnectionState>>,
    }

    impl FakeConnection {
        fn set(&self, state: ConnectionState) {
            *self.state.lock().unwrap() = state;
        }
    }

    impl PooledConnection for FakeConnection {
        fn state(&self) -> ConnectionState {
            *self.state.lock().unwrap()
        }

        fn close(&self) {
            self.set(ConnectionState::Shutdown);
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        built: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Connection = FakeConnection;

        async fn connect(
            &self,
            _target: &Target,
            _tls: Option<&ClientTlsConfig>,
        ) -> Result<FakeConnection> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DiscoveryError::ConnectionBuild("refused".to_string()));
            }
            let id = self.built.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConnection {
                id,
                state: Arc::new(Mutex::new(ConnectionState::Idle)),
            })
        }
    }

    #[tokio::test]
    async fn test_cached_connection_is_reused() {
        let pool = ConnectionPool::new(FakeConnector::default());
        let first = pool.get_connection("svc", None).await.unwrap();
        let second = pool.get_connection("svc", None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(pool.len().await, 1);
        assert_eq!(pool.entry_state("svc").await, EntryState::Ready);
        assert_eq!(pool.entry_state("other").await, EntryState::Absent);
    }

    #[tokio::test]
    async fn test_unhealthy_entry_is_replaced_and_closed() {
        let pool = ConnectionPool::new(FakeConnector::default());
        let first = pool.get_connection("svc", None).await.unwrap();
        first.set(ConnectionState::TransientFailure);
        assert_eq!(pool.entry_state("svc").await, EntryState::Unhealthy);

        let second = pool.get_connection("svc", None).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.state(), ConnectionState::Shutdown);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_build_is_not_cached() {
        let connector = FakeConnector::default();
        connector.fail.store(true, Ordering::SeqCst);
        let pool = ConnectionPool::new(connector);

        assert!(pool.get_connection("svc", None).await.is_err());
        assert_eq!(pool.entry_state("svc").await, EntryState::Absent);
    }

    #[tokio::test]
    async fn test_sweep_rebuilds_only_unhealthy() {
        let pool = ConnectionPool::new(FakeConnector::default());
        let healthy = pool.get_connection("a", None).await.unwrap();
        let broken = pool.get_connection("b", None).await.unwrap();
        broken.set(ConnectionState::Shutdown);

        assert_eq!(pool.sweep().await, 1);
        assert_eq!(pool.get_connection("a", None).await.unwrap().id, healthy.id);
        assert_ne!(pool.get_connection("b", None).await.unwrap().id, broken.id);
    }

    #[tokio::test]
    async fn test_close_all_empties_pool() {
        let pool = ConnectionPool::new(FakeConnector::default());
        let conn = pool.get_connection("svc", None).await.unwrap();
        pool.close_all().await;
        assert!(pool.is_empty().await);
        assert_eq!(conn.state(), ConnectionState::Shutdown);
    }
}
