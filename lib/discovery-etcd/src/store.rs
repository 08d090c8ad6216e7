//! Coordination store abstraction
//!
//! The registrar and resolvers only need a handful of primitives from the
//! store: leases, keyed puts/deletes, prefix listing and prefix watches.

use async_trait::async_trait;
use discovery_core::Result;
use futures::stream::BoxStream;
use std::time::Duration;

pub type LeaseId = i64;

/// A time-bounded grant. Keys attached to it vanish when it expires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// Key-level mutation delivered by a prefix watch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Put(String),
    Delete(String),
}

/// Renewal acknowledgements carrying the refreshed TTL. The stream ends when
/// the lease can no longer be renewed.
pub type KeepAliveStream = BoxStream<'static, Result<Duration>>;

/// Batches of events in store order. The stream ends or yields an error when
/// the watch is torn down by the store.
pub type WatchStream = BoxStream<'static, Result<Vec<StoreEvent>>>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Grant a lease with the given TTL
    async fn grant_lease(&self, ttl: Duration) -> Result<Lease>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Start renewing `lease`
    async fn keep_alive(&self, lease: &Lease) -> Result<KeepAliveStream>;

    /// Write `key` with an empty value bound to `lease`
    async fn put(&self, key: &str, lease: LeaseId) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Every key currently stored under `prefix`
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Subscribe to mutations under `prefix`
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;
}

/// Renewal cadence for a lease: a third of its TTL.
pub(crate) fn renewal_interval(ttl: Duration) -> Duration {
    (ttl / 3).max(Duration::from_millis(100))
}
