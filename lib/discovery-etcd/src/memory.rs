//! Single-process coordination store
//!
//! Leases expire on a reaper tick and watches fan out in store order, so the
//! registrar and resolvers behave against it the way they do against etcd.
//! The fault hooks (`set_available`, `fail_keepalives`, `break_watches`,
//! `expire_lease`) simulate partitions and crashes.

use crate::store::{
    renewal_interval, CoordinationStore, KeepAliveStream, Lease, LeaseId, StoreEvent, WatchStream,
};
use async_trait::async_trait;
use discovery_core::{DiscoveryError, Result};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

const REAP_INTERVAL: Duration = Duration::from_millis(100);

type WatchSender = mpsc::UnboundedSender<Result<Vec<StoreEvent>>>;

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

struct PrefixWatch {
    prefix: String,
    tx: WatchSender,
}

struct State {
    available: bool,
    fail_keepalives: bool,
    next_lease: LeaseId,
    leases: HashMap<LeaseId, LeaseEntry>,
    keys: BTreeMap<String, LeaseId>,
    watches: Vec<PrefixWatch>,
}

impl State {
    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(DiscoveryError::StoreUnavailable("memory store offline".into()))
        }
    }

    fn notify(&mut self, events: Vec<StoreEvent>) {
        if events.is_empty() {
            return;
        }
        self.watches.retain(|watch| {
            let matching: Vec<StoreEvent> = events
                .iter()
                .filter(|event| match event {
                    StoreEvent::Put(key) | StoreEvent::Delete(key) => key.starts_with(&watch.prefix),
                })
                .cloned()
                .collect();
            matching.is_empty() || watch.tx.send(Ok(matching)).is_ok()
        });
    }

    /// Remove a lease and every key bound to it
    fn drop_lease(&mut self, lease: LeaseId) -> Vec<StoreEvent> {
        let Some(entry) = self.leases.remove(&lease) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = entry.keys.into_iter().collect();
        keys.sort();

        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            if self.keys.get(&key) == Some(&lease) {
                self.keys.remove(&key);
                events.push(StoreEvent::Delete(key));
            }
        }
        events
    }

    fn reap(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease in expired {
            debug!(lease_id = lease, "Lease expired");
            let events = self.drop_lease(lease);
            self.notify(events);
        }
    }

    fn break_watches(&mut self, reason: &str) {
        for watch in self.watches.drain(..) {
            let _ = watch.tx.send(Err(DiscoveryError::WatchClosed(reason.to_string())));
        }
    }
}

/// In-memory coordination store
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Create a store and start its lease reaper. Must be called inside a
    /// tokio runtime; the reaper stops once every handle is dropped.
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State {
            available: true,
            fail_keepalives: false,
            next_lease: 1,
            leases: HashMap::new(),
            keys: BTreeMap::new(),
            watches: Vec::new(),
        }));

        tokio::spawn(reap_loop(Arc::downgrade(&state)));
        Self { state }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // state stays consistent across a panicking holder
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the store offline (or back online). Going offline also breaks
    /// every open watch.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        state.available = available;
        if !available {
            state.break_watches("memory store offline");
        }
    }

    /// Make every keep-alive stream end at its next renewal
    pub fn fail_keepalives(&self, fail: bool) {
        self.lock().fail_keepalives = fail;
    }

    /// Terminate every open watch with an error
    pub fn break_watches(&self) {
        self.lock().break_watches("watch forcibly closed");
    }

    /// Expire a lease now, as if its holder had crashed
    pub fn expire_lease(&self, lease: LeaseId) {
        let mut state = self.lock();
        let events = state.drop_lease(lease);
        state.notify(events);
    }

    /// Lease currently bound to `key`
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.lock().keys.get(key).copied()
    }

    /// Keys under `prefix`, ignoring availability
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .keys
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn lease_count(&self) -> usize {
        self.lock().leases.len()
    }

    /// Number of watches whose consumer is still listening
    pub fn watch_count(&self) -> usize {
        self.lock()
            .watches
            .iter()
            .filter(|watch| !watch.tx.is_closed())
            .count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn reap_loop(state: Weak<Mutex<State>>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        let Some(shared) = state.upgrade() else {
            break;
        };
        let mut guard = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.reap(Instant::now());
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<Lease> {
        let mut state = self.lock();
        state.check_available()?;

        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(Lease { id, ttl })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.lock();
        state.check_available()?;
        let events = state.drop_lease(lease);
        state.notify(events);
        Ok(())
    }

    async fn keep_alive(&self, lease: &Lease) -> Result<KeepAliveStream> {
        {
            let state = self.lock();
            state.check_available()?;
            if !state.leases.contains_key(&lease.id) {
                return Err(DiscoveryError::LeaseLost(format!("lease {} not found", lease.id)));
            }
        }

        let store = self.clone();
        let lease_id = lease.id;
        let mut interval = tokio::time::interval(renewal_interval(lease.ttl));
        interval.reset();

        let renewals = futures::stream::unfold(Some((store, interval)), move |ctx| async move {
            let (store, mut interval) = ctx?;
            interval.tick().await;

            let renewed = {
                let mut state = store.lock();
                if !state.available || state.fail_keepalives {
                    None
                } else {
                    state.leases.get_mut(&lease_id).map(|entry| {
                        entry.deadline = Instant::now() + entry.ttl;
                        entry.ttl
                    })
                }
            };

            match renewed {
                Some(ttl) => {
                    trace!(lease_id, "Lease renewed");
                    Some((Ok(ttl), Some((store, interval))))
                }
                None => None,
            }
        });

        Ok(renewals.boxed())
    }

    async fn put(&self, key: &str, lease: LeaseId) -> Result<()> {
        let mut state = self.lock();
        state.check_available()?;

        match state.leases.get_mut(&lease) {
            Some(entry) => {
                entry.keys.insert(key.to_string());
            }
            None => {
                return Err(DiscoveryError::LeaseLost(format!("lease {} not found", lease)));
            }
        }

        if let Some(previous) = state.keys.insert(key.to_string(), lease) {
            if previous != lease {
                if let Some(entry) = state.leases.get_mut(&previous) {
                    entry.keys.remove(key);
                }
            }
        }

        state.notify(vec![StoreEvent::Put(key.to_string())]);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.lock();
        state.check_available()?;

        if let Some(lease) = state.keys.remove(key) {
            if let Some(entry) = state.leases.get_mut(&lease) {
                entry.keys.remove(key);
            }
            state.notify(vec![StoreEvent::Delete(key.to_string())]);
        }
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.lock();
        state.check_available()?;
        Ok(state
            .keys
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            state.check_available()?;
            state.watches.push(PrefixWatch {
                prefix: prefix.to_string(),
                tx,
            });
        }

        let batches = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|batch| (batch, rx))
        });
        Ok(batches.boxed())
    }
}
