//! Discovery-backed gRPC connection pool
//!
//! This library provides:
//! - Balanced tonic channels fed by coordination-store resolvers
//! - A per-service connection pool with double-checked construction
//! - A periodic health sweep replacing unhealthy connections
//! - Prometheus metrics for the discovery loops

pub mod channel;
pub mod connector;
pub mod health_check;
pub mod metrics;
pub mod pool;
pub mod state;
pub mod tls;

pub use channel::{ChannelOptions, DiscoveryChannel};
pub use connector::{Connector, DiscoveryConnector, PooledConnection};
pub use health_check::{HealthCheckConfig, HealthSweep};
pub use metrics::DiscoveryMetrics;
pub use pool::{ConnectionPool, EntryState};
pub use state::ConnectionState;
pub use tls::TlsClientSettings;
