//! Prometheus metrics for the discovery loops and the connection pool

use anyhow::Result;
use discovery_core::{DiscoveryObserver, ServiceRecord, Target};
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Counters and gauges fed through [`DiscoveryObserver`]
#[derive(Clone)]
pub struct DiscoveryMetrics {
    /// Keep-alive streams that ended or failed
    pub lease_losses_total: CounterVec,
    /// Records re-published under a fresh lease
    pub reregistrations_total: CounterVec,
    pub resolver_rebuilds_total: CounterVec,
    pub address_updates_total: CounterVec,
    /// Addresses in the last snapshot pushed per service
    pub resolved_addresses: GaugeVec,
    pub pool_builds_total: CounterVec,
    pub pool_rebuilds_total: CounterVec,
    pub pool_build_failures_total: CounterVec,
    pub pool_connections: Gauge,
    pub registry: Arc<Registry>,
}

impl DiscoveryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let lease_losses_total = CounterVec::new(
            Opts::new("discovery_lease_losses_total", "Registrations whose lease was lost"),
            &["service"],
        )?;
        let reregistrations_total = CounterVec::new(
            Opts::new("discovery_reregistrations_total", "Registrations re-published under a new lease"),
            &["service"],
        )?;
        let resolver_rebuilds_total = CounterVec::new(
            Opts::new("discovery_resolver_rebuilds_total", "Resolver rebuilds after a failed watch"),
            &["service"],
        )?;
        let address_updates_total = CounterVec::new(
            Opts::new("discovery_address_updates_total", "Address sets pushed by resolvers"),
            &["service"],
        )?;
        let resolved_addresses = GaugeVec::new(
            Opts::new("discovery_resolved_addresses", "Addresses currently resolved per service"),
            &["service"],
        )?;
        let pool_builds_total = CounterVec::new(
            Opts::new("discovery_pool_builds_total", "Connections built on first use"),
            &["service"],
        )?;
        let pool_rebuilds_total = CounterVec::new(
            Opts::new("discovery_pool_rebuilds_total", "Unhealthy connections replaced"),
            &["service"],
        )?;
        let pool_build_failures_total = CounterVec::new(
            Opts::new("discovery_pool_build_failures_total", "Failed connection builds"),
            &["service"],
        )?;
        let pool_connections = Gauge::new("discovery_pool_connections", "Connections cached by the pool")?;

        registry.register(Box::new(lease_losses_total.clone()))?;
        registry.register(Box::new(reregistrations_total.clone()))?;
        registry.register(Box::new(resolver_rebuilds_total.clone()))?;
        registry.register(Box::new(address_updates_total.clone()))?;
        registry.register(Box::new(resolved_addresses.clone()))?;
        registry.register(Box::new(pool_builds_total.clone()))?;
        registry.register(Box::new(pool_rebuilds_total.clone()))?;
        registry.register(Box::new(pool_build_failures_total.clone()))?;
        registry.register(Box::new(pool_connections.clone()))?;

        Ok(Self {
            lease_losses_total,
            reregistrations_total,
            resolver_rebuilds_total,
            address_updates_total,
            resolved_addresses,
            pool_builds_total,
            pool_rebuilds_total,
            pool_build_failures_total,
            pool_connections,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl DiscoveryObserver for DiscoveryMetrics {
    fn on_lease_lost(&self, record: &ServiceRecord) {
        self.lease_losses_total
            .with_label_values(&[&record.service_name])
            .inc();
    }

    fn on_reregistered(&self, record: &ServiceRecord) {
        self.reregistrations_total
            .with_label_values(&[&record.service_name])
            .inc();
    }

    fn on_resolver_rebuild(&self, target: &Target) {
        self.resolver_rebuilds_total
            .with_label_values(&[&target.service_name])
            .inc();
    }

    fn on_addresses_updated(&self, target: &Target, count: usize) {
        self.address_updates_total
            .with_label_values(&[&target.service_name])
            .inc();
        self.resolved_addresses
            .with_label_values(&[&target.service_name])
            .set(count as f64);
    }

    fn on_connection_built(&self, service_name: &str, replaced: bool) {
        let counter = if replaced {
            &self.pool_rebuilds_total
        } else {
            &self.pool_builds_total
        };
        counter.with_label_values(&[service_name]).inc();
    }

    fn on_connection_failed(&self, service_name: &str) {
        self.pool_build_failures_total
            .with_label_values(&[service_name])
            .inc();
    }

    fn on_pool_size(&self, cached: usize) {
        self.pool_connections.set(cached as f64);
    }
}
