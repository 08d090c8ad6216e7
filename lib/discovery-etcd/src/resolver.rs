//! Address resolution backed by prefix watches
//!
//! A resolver keeps the address set for one service name and pushes every
//! change to an [`AddressSink`]. When its watch fails it rebuilds from a fresh
//! listing after a fixed delay, so consumers see an eventually consistent
//! stream of snapshots rather than a transactional log.

use crate::client::CoordinationClient;
use crate::store::{CoordinationStore, StoreEvent};
use async_trait::async_trait;
use discovery_core::{
    address_from_key, service_prefix, AddressSet, DiscoveryError, DiscoveryObserver,
    ResolverConfig, Result, Target, WatchEvent, DISCOVERY_SCHEME,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a resolver
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolverState {
    /// Listing the prefix and opening the watch
    Building,
    /// Applying watch events
    Watching,
    /// Cancelled; terminal
    Closed,
}

/// Receives address snapshots from a resolver
#[async_trait]
pub trait AddressSink: Send + Sync {
    /// Replace the consumer's view with `addresses`
    async fn update_addresses(&self, addresses: Vec<String>) -> Result<()>;

    /// The resolver lost its watch and is rebuilding
    fn report_rebuilding(&self) {}
}

/// Builds resolvers for targets of one scheme
#[async_trait]
pub trait ResolverBuilder: Send + Sync {
    fn scheme(&self) -> &str;

    async fn build(&self, target: &Target, sink: Arc<dyn AddressSink>) -> Result<Resolver>;
}

/// Handle to a running resolver. Dropping it closes the resolver.
pub struct Resolver {
    target: Target,
    cancel: CancellationToken,
    state: watch::Receiver<ResolverState>,
    task: Option<JoinHandle<()>>,
}

impl Resolver {
    /// Start resolving `target` against `store`. Cancelling `cancel` (or any
    /// parent of it) closes the resolver.
    pub fn spawn(
        target: Target,
        store: Arc<dyn CoordinationStore>,
        sink: Arc<dyn AddressSink>,
        config: &ResolverConfig,
        cancel: CancellationToken,
        observer: Arc<dyn DiscoveryObserver>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ResolverState::Building);

        let watch_loop = WatchLoop {
            target: target.clone(),
            prefix: service_prefix(&target.service_name),
            store,
            sink,
            retry_delay: config.retry_delay(),
            cancel: cancel.clone(),
            state: state_tx,
            observer,
        };
        let task = tokio::spawn(watch_loop.run());

        Self {
            target,
            cancel,
            state: state_rx,
            task: Some(task),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> ResolverState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<ResolverState> {
        self.state.clone()
    }

    /// Hint that the consumer wants fresh results. The watch already
    /// delivers changes as they happen, so this only logs.
    pub fn resolve_now(&self) {
        debug!(target = %self.target, "Resolve requested");
    }

    /// Stop watching. Takes effect within one retry interval.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!(target = %self.target, "Closing resolver");
            self.cancel.cancel();
        }
    }

    /// Close and wait for the watch loop to exit
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WatchLoop {
    target: Target,
    prefix: String,
    store: Arc<dyn CoordinationStore>,
    sink: Arc<dyn AddressSink>,
    retry_delay: Duration,
    cancel: CancellationToken,
    state: watch::Sender<ResolverState>,
    observer: Arc<dyn DiscoveryObserver>,
}

impl WatchLoop {
    async fn run(self) {
        info!(target = %self.target, prefix = %self.prefix, "Starting resolver watch");
        let mut rebuilding = false;

        while !self.cancel.is_cancelled() {
            self.state.send_replace(ResolverState::Building);
            if rebuilding {
                self.sink.report_rebuilding();
                self.observer.on_resolver_rebuild(&self.target);
            }

            match self.watch_once().await {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        target = %self.target,
                        error = %e,
                        retry_in = ?self.retry_delay,
                        "Resolver watch failed, rebuilding"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_delay) => {}
                    }
                    rebuilding = true;
                }
            }
        }

        self.state.send_replace(ResolverState::Closed);
        info!(target = %self.target, "Resolver closed");
    }

    /// One Building → Watching cycle. Returns `Ok` only when cancelled.
    async fn watch_once(&self) -> Result<()> {
        // The watch is opened before the listing so that nothing registered
        // in between is missed; overlapping events are idempotent against
        // the listed set.
        let mut events = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            result = self.store.watch_prefix(&self.prefix) => result?,
        };

        let keys = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            result = self.store.list_prefix(&self.prefix) => result?,
        };

        let mut addresses = AddressSet::from_addresses(
            keys.iter()
                .filter_map(|key| address_from_key(key, &self.prefix)),
        );
        if addresses.is_empty() {
            info!(target = %self.target, "No addresses registered");
        } else {
            debug!(target = %self.target, addresses = ?addresses.snapshot(), "Resolved addresses");
        }
        self.push(&addresses).await?;
        self.state.send_replace(ResolverState::Watching);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                next = events.next() => match next {
                    None => return Err(DiscoveryError::WatchClosed("watch stream ended".into())),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(batch)) => {
                        let batch = self.to_watch_events(batch);
                        if addresses.apply(&batch) {
                            if let Err(e) = self.push(&addresses).await {
                                // non-fatal, the next change pushes a full snapshot again
                                warn!(target = %self.target, error = %e, "Failed to push address update");
                            }
                        }
                    }
                },
            }
        }
    }

    fn to_watch_events(&self, batch: Vec<StoreEvent>) -> Vec<WatchEvent> {
        batch
            .into_iter()
            .filter_map(|event| match event {
                StoreEvent::Put(key) => {
                    address_from_key(&key, &self.prefix).map(|a| WatchEvent::Put(a.to_string()))
                }
                StoreEvent::Delete(key) => {
                    address_from_key(&key, &self.prefix).map(|a| WatchEvent::Delete(a.to_string()))
                }
            })
            .collect()
    }

    /// Hand a snapshot to the sink. A sink that never returns cannot hold
    /// the loop past cancellation.
    async fn push(&self, addresses: &AddressSet) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            result = self.sink.update_addresses(addresses.snapshot()) => {
                result?;
                self.observer.on_addresses_updated(&self.target, addresses.len());
                Ok(())
            }
        }
    }
}

/// Builds coordination-store resolvers for `discovery:///<service>` targets
pub struct DiscoveryResolverBuilder {
    client: Arc<CoordinationClient>,
    config: ResolverConfig,
    cancel: CancellationToken,
    observer: Arc<dyn DiscoveryObserver>,
}

impl DiscoveryResolverBuilder {
    /// Every resolver built here is closed when `cancel` is cancelled.
    pub fn new(
        client: Arc<CoordinationClient>,
        config: ResolverConfig,
        cancel: CancellationToken,
        observer: Arc<dyn DiscoveryObserver>,
    ) -> Self {
        Self {
            client,
            config,
            cancel,
            observer,
        }
    }
}

#[async_trait]
impl ResolverBuilder for DiscoveryResolverBuilder {
    fn scheme(&self) -> &str {
        DISCOVERY_SCHEME
    }

    async fn build(&self, target: &Target, sink: Arc<dyn AddressSink>) -> Result<Resolver> {
        if target.scheme != DISCOVERY_SCHEME {
            return Err(DiscoveryError::UnknownScheme(target.scheme.clone()));
        }

        let store = self.client.store().await?;
        Ok(Resolver::spawn(
            target.clone(),
            store,
            sink,
            &self.config,
            self.cancel.child_token(),
            self.observer.clone(),
        ))
    }
}
