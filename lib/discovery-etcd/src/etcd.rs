//! etcd-backed coordination store

use crate::store::{
    renewal_interval, CoordinationStore, KeepAliveStream, Lease, LeaseId, StoreEvent, WatchStream,
};
use async_trait::async_trait;
use discovery_core::{DiscoveryError, Result, StoreConfig};
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    WatchOptions, WatchStream as EtcdWatchStream, Watcher,
};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, trace, warn};

fn unavailable(e: etcd_client::Error) -> DiscoveryError {
    DiscoveryError::StoreUnavailable(e.to_string())
}

/// EtcdStore wraps a shared etcd client. The client is cheap to clone and
/// every operation works on its own clone.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the configured endpoints
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(config.dial_timeout())
            .with_keep_alive(config.keep_alive_time(), config.keep_alive_timeout());

        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(unavailable)?;

        debug!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    /// Wrap an already connected client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

struct KeepAliveState {
    lease_id: LeaseId,
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
    interval: tokio::time::Interval,
}

struct WatchState {
    // dropping the watcher cancels the server-side watch
    _watcher: Watcher,
    stream: EtcdWatchStream,
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<Lease> {
        let mut client = self.client.clone();
        let resp = client
            .lease_grant(ttl.as_secs().max(1) as i64, None)
            .await
            .map_err(unavailable)?;

        Ok(Lease {
            id: resp.id(),
            ttl: Duration::from_secs(resp.ttl().max(0) as u64),
        })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await.map_err(unavailable)?;
        Ok(())
    }

    async fn keep_alive(&self, lease: &Lease) -> Result<KeepAliveStream> {
        let mut client = self.client.clone();
        let (keeper, stream) = client
            .lease_keep_alive(lease.id)
            .await
            .map_err(unavailable)?;

        let state = KeepAliveState {
            lease_id: lease.id,
            keeper,
            stream,
            interval: tokio::time::interval(renewal_interval(lease.ttl)),
        };

        // etcd only answers keep-alive requests, so the stream drives them itself.
        let renewals = futures::stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            state.interval.tick().await;

            if let Err(e) = state.keeper.keep_alive().await {
                warn!(lease_id = state.lease_id, error = %e, "Keep-alive send failed");
                return Some((Err(DiscoveryError::LeaseLost(e.to_string())), None));
            }

            match state.stream.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    trace!(lease_id = state.lease_id, ttl = resp.ttl(), "Keep-alive OK");
                    let ttl = Duration::from_secs(resp.ttl() as u64);
                    Some((Ok(ttl), Some(state)))
                }
                Ok(Some(_)) => {
                    let msg = format!("lease {} expired", state.lease_id);
                    Some((Err(DiscoveryError::LeaseLost(msg)), None))
                }
                Ok(None) => None,
                Err(e) => Some((Err(DiscoveryError::LeaseLost(e.to_string())), None)),
            }
        });

        Ok(renewals.boxed())
    }

    async fn put(&self, key: &str, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(key, "", Some(PutOptions::new().with_lease(lease)))
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(key, None).await.map_err(unavailable)?;
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok().map(str::to_string))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let (watcher, stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        let state = WatchState {
            _watcher: watcher,
            stream,
        };

        let batches = futures::stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            match state.stream.message().await {
                Ok(Some(resp)) => {
                    if resp.canceled() {
                        let reason = resp.cancel_reason().to_string();
                        return Some((Err(DiscoveryError::WatchClosed(reason)), None));
                    }

                    let events = resp
                        .events()
                        .iter()
                        .filter_map(|event| {
                            let key = event.kv()?.key_str().ok()?.to_string();
                            Some(match event.event_type() {
                                EventType::Put => StoreEvent::Put(key),
                                EventType::Delete => StoreEvent::Delete(key),
                            })
                        })
                        .collect();

                    Some((Ok(events), Some(state)))
                }
                Ok(None) => None,
                Err(e) => Some((Err(DiscoveryError::WatchClosed(e.to_string())), None)),
            }
        });

        Ok(batches.boxed())
    }
}
