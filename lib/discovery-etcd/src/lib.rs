//! Coordination store integration
//!
//! This library provides:
//! - The `CoordinationStore` abstraction with etcd and in-memory backends
//! - A lazily connected, process-wide coordination client
//! - Service registration with self-healing lease renewal
//! - Watch-driven address resolvers

pub mod client;
pub mod etcd;
pub mod memory;
pub mod registrar;
pub mod resolver;
pub mod store;

pub use client::CoordinationClient;
pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use registrar::ServiceRegistrar;
pub use resolver::{AddressSink, DiscoveryResolverBuilder, Resolver, ResolverBuilder, ResolverState};
pub use store::{CoordinationStore, KeepAliveStream, Lease, LeaseId, StoreEvent, WatchStream};
