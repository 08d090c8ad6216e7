//! Hooks fired by the self-healing discovery loops

use crate::{ServiceRecord, Target};
use std::sync::Arc;

/// Receives lifecycle events from registrars, resolvers and the pool.
///
/// Every method has a no-op default so implementors pick what they count.
pub trait DiscoveryObserver: Send + Sync {
    /// A registration's keep-alive stream ended or failed
    fn on_lease_lost(&self, _record: &ServiceRecord) {}

    /// A registration was re-published under a fresh lease
    fn on_reregistered(&self, _record: &ServiceRecord) {}

    /// A resolver re-entered `Building` after its watch failed
    fn on_resolver_rebuild(&self, _target: &Target) {}

    /// A resolver pushed a new address set downstream
    fn on_addresses_updated(&self, _target: &Target, _count: usize) {}

    /// The pool built a connection (first use or replacement)
    fn on_connection_built(&self, _service_name: &str, _replaced: bool) {}

    /// The pool failed to build a connection
    fn on_connection_failed(&self, _service_name: &str) {}

    /// Number of connections cached by the pool changed
    fn on_pool_size(&self, _cached: usize) {}
}

pub struct NoopObserver;

impl DiscoveryObserver for NoopObserver {}

pub fn noop_observer() -> Arc<dyn DiscoveryObserver> {
    Arc::new(NoopObserver)
}
