//! Balanced gRPC channels fed by a resolver
//!
//! Each [`DiscoveryChannel`] owns a tonic balance channel and the resolver
//! feeding it. Address snapshots from the resolver are diffed against the
//! endpoints already installed and turned into insert/remove changes; tonic
//! spreads calls across the ready endpoints.

use crate::state::ConnectionState;
use async_trait::async_trait;
use discovery_core::{DiscoveryError, Result, Target};
use discovery_etcd::{AddressSink, Resolver, ResolverBuilder};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tower::discover::Change;
use tracing::{debug, info, warn};

/// Per-endpoint settings applied to every resolved address
#[derive(Clone, Debug)]
pub struct ChannelOptions {
    pub connect_timeout: Duration,
    /// Capacity of the change buffer between the resolver and the channel
    pub buffer: usize,
    pub tls: Option<ClientTlsConfig>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            buffer: 1024,
            tls: None,
        }
    }
}

/// Whether the resolver has ever produced an address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resolution {
    /// No snapshot received yet
    Pending,
    /// Every snapshot so far was empty
    Empty,
    /// At least one snapshot carried an address; sticky
    Resolved,
}

struct Shared {
    target: Target,
    state: watch::Sender<ConnectionState>,
    resolution: watch::Sender<Resolution>,
    resolver: Mutex<Option<Resolver>>,
}

impl Shared {
    /// Move to `next` unless already shut down
    fn transition(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Shutdown || *current == next {
                return false;
            }
            debug!(target = %self.target, from = %current, to = %next, "Connection state changed");
            *current = next;
            true
        });
    }

    fn record_snapshot(&self, has_addresses: bool) {
        self.resolution.send_if_modified(|current| {
            let next = match (*current, has_addresses) {
                (_, true) | (Resolution::Resolved, false) => Resolution::Resolved,
                _ => Resolution::Empty,
            };
            let changed = *current != next;
            *current = next;
            changed
        });
    }
}

/// A pooled connection to every live instance of one service
#[derive(Clone)]
pub struct DiscoveryChannel {
    channel: Channel,
    shared: Arc<Shared>,
    sink: Arc<BalanceSink>,
}

impl DiscoveryChannel {
    /// Create the balance channel and start resolving `target` into it
    pub async fn build(
        target: Target,
        builder: &dyn ResolverBuilder,
        options: ChannelOptions,
    ) -> Result<Self> {
        let endpoint_template = EndpointTemplate::new(&options)?;
        let (channel, changes) = Channel::balance_channel::<String>(options.buffer.max(1));
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (resolution, _) = watch::channel(Resolution::Pending);

        let shared = Arc::new(Shared {
            target: target.clone(),
            state,
            resolution,
            resolver: Mutex::new(None),
        });

        let sink = Arc::new(BalanceSink {
            shared: Arc::downgrade(&shared),
            target: target.clone(),
            changes,
            endpoint_template,
            endpoints: Mutex::new(Endpoints::default()),
        });

        let resolver = builder.build(&target, sink.clone()).await?;
        *lock(&shared.resolver) = Some(resolver);

        info!(target = %target, "Discovery channel created");
        Ok(Self {
            channel,
            shared,
            sink,
        })
    }

    /// The underlying channel, for generated gRPC clients. Hands any
    /// endpoint changes still waiting for buffer space to the channel first.
    pub fn channel(&self) -> Channel {
        if let Err(e) = self.sink.flush() {
            debug!(target = %self.shared.target, error = %e, "Endpoint flush failed");
        }
        self.channel.clone()
    }

    pub fn target(&self) -> &Target {
        &self.shared.target
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether any address has ever been resolved for this channel
    pub fn has_resolved(&self) -> bool {
        *self.shared.resolution.borrow() == Resolution::Resolved
    }

    /// Wait up to `timeout` for the first address snapshot and report whether
    /// any address has ever been resolved.
    pub async fn wait_for_addresses(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.resolution.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|r| *r != Resolution::Pending)).await;
        self.has_resolved()
    }

    /// Shut the channel down and close its resolver
    pub fn close(&self) {
        self.shared.state.send_replace(ConnectionState::Shutdown);
        if let Some(resolver) = lock(&self.shared.resolver).take() {
            resolver.close();
        }
        debug!(target = %self.shared.target, "Discovery channel closed");
    }
}

impl fmt::Debug for DiscoveryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryChannel")
            .field("target", &self.shared.target)
            .field("state", &self.state())
            .field("resolution", &*self.shared.resolution.borrow())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
struct EndpointTemplate {
    scheme: &'static str,
    connect_timeout: Duration,
    tls: Option<ClientTlsConfig>,
}

impl EndpointTemplate {
    fn new(options: &ChannelOptions) -> Result<Self> {
        let template = Self {
            scheme: if options.tls.is_some() { "https" } else { "http" },
            connect_timeout: options.connect_timeout,
            tls: options.tls.clone(),
        };
        // surface a bad TLS configuration at build time rather than per address
        template.endpoint("127.0.0.1:1")?;
        Ok(template)
    }

    fn endpoint(&self, address: &str) -> Result<Endpoint> {
        let uri = format!("{}://{}", self.scheme, address);
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| DiscoveryError::ConnectionBuild(format!("{}: {}", address, e)))?
            .connect_timeout(self.connect_timeout);

        match &self.tls {
            Some(tls) => endpoint
                .tls_config(tls.clone())
                .map_err(|e| DiscoveryError::ConnectionBuild(format!("TLS: {}", e))),
            None => Ok(endpoint),
        }
    }
}

/// Endpoints the resolver asked for versus those handed to the channel
#[derive(Default)]
struct Endpoints {
    wanted: HashMap<String, Endpoint>,
    installed: HashSet<String>,
}

/// Resolver sink translating address snapshots into balance changes.
///
/// tonic drains the change buffer only while requests are in flight, so the
/// sink never waits for space. Changes that do not fit stay pending and are
/// retried on the next snapshot or the next [`DiscoveryChannel::channel`].
struct BalanceSink {
    shared: std::sync::Weak<Shared>,
    target: Target,
    changes: mpsc::Sender<Change<String, Endpoint>>,
    endpoint_template: EndpointTemplate,
    endpoints: Mutex<Endpoints>,
}

impl BalanceSink {
    fn transition(&self, next: ConnectionState) {
        if let Some(shared) = self.shared.upgrade() {
            shared.transition(next);
        }
    }

    /// Returns `Ok(false)` when the buffer is full
    fn send(&self, change: Change<String, Endpoint>) -> Result<bool> {
        match self.changes.try_send(change) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => {
                self.transition(ConnectionState::TransientFailure);
                Err(DiscoveryError::ConnectionBuild(format!(
                    "balance channel for {} closed",
                    self.target
                )))
            }
        }
    }

    /// Hand the channel whatever separates the installed set from the wanted
    /// one, as far as the buffer allows
    fn flush(&self) -> Result<()> {
        let mut endpoints = lock(&self.endpoints);
        let Endpoints { wanted, installed } = &mut *endpoints;

        let removed: Vec<String> = installed
            .iter()
            .filter(|address| !wanted.contains_key(*address))
            .cloned()
            .collect();
        for address in removed {
            if !self.send(Change::Remove(address.clone()))? {
                self.deferred();
                return Ok(());
            }
            installed.remove(&address);
            debug!(target = %self.target, address = %address, "Endpoint removed");
        }

        for (address, endpoint) in wanted.iter() {
            if installed.contains(address) {
                continue;
            }
            if !self.send(Change::Insert(address.clone(), endpoint.clone()))? {
                self.deferred();
                return Ok(());
            }
            installed.insert(address.clone());
            debug!(target = %self.target, address = %address, "Endpoint added");
        }
        Ok(())
    }

    fn deferred(&self) {
        debug!(target = %self.target, "Balance buffer full, endpoint changes deferred");
    }
}

#[async_trait]
impl AddressSink for BalanceSink {
    async fn update_addresses(&self, addresses: Vec<String>) -> Result<()> {
        let mut wanted = HashMap::with_capacity(addresses.len());
        for address in addresses {
            match self.endpoint_template.endpoint(&address) {
                Ok(endpoint) => {
                    wanted.insert(address, endpoint);
                }
                Err(e) => {
                    warn!(target = %self.target, address = %address, error = %e, "Skipping unusable address");
                }
            }
        }

        let count = wanted.len();
        lock(&self.endpoints).wanted = wanted;
        self.flush()?;

        if let Some(shared) = self.shared.upgrade() {
            shared.record_snapshot(count > 0);
        }
        if count == 0 {
            warn!(target = %self.target, "No reachable addresses");
            self.transition(ConnectionState::TransientFailure);
        } else {
            self.transition(ConnectionState::Ready);
        }
        Ok(())
    }

    fn report_rebuilding(&self) {
        self.transition(ConnectionState::Connecting);
    }
}
