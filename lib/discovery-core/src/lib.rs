//! Core service discovery types
//!
//! This library provides:
//! - Service records and the coordination store key layout
//! - The per-service address set maintained by resolvers
//! - Resolution target parsing
//! - Shared error and configuration types

pub mod address_set;
pub mod config;
pub mod error;
pub mod observer;
pub mod record;
pub mod target;

pub use address_set::{AddressSet, WatchEvent};
pub use config::{
    DiscoveryConfig, PoolConfig, RegistrarConfig, ResolverConfig, StoreBackend, StoreConfig,
    ETCD_ENDPOINTS_ENV,
};
pub use error::{DiscoveryError, Result};
pub use observer::{noop_observer, DiscoveryObserver, NoopObserver};
pub use record::{address_from_key, service_prefix, ServiceRecord, SERVICES_ROOT};
pub use target::{Target, DISCOVERY_SCHEME};
