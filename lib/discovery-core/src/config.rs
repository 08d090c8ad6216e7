//! Discovery configuration
//!
//! Loaded from YAML, every field optional. Durations are stored as plain
//! integers so the file stays readable; accessors convert them.

use crate::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Environment variable overriding `store.endpoints` (comma separated)
pub const ETCD_ENDPOINTS_ENV: &str = "DISCOVERY_ETCD_ENDPOINTS";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub store: StoreConfig,
    pub registrar: RegistrarConfig,
    pub resolver: ResolverConfig,
    pub pool: PoolConfig,
}

/// Which coordination store backend to use
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Etcd,
    /// Single-process store, for local development
    Memory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub endpoints: Vec<String>,
    pub dial_timeout_secs: u64,
    pub keep_alive_time_secs: u64,
    pub keep_alive_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Etcd,
            endpoints: vec!["127.0.0.1:2379".to_string()],
            dial_timeout_secs: 5,
            keep_alive_time_secs: 30,
            keep_alive_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn keep_alive_time(&self) -> Duration {
        Duration::from_secs(self.keep_alive_time_secs)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Lease TTL; upper bound on how long a crashed instance stays advertised
    pub lease_ttl_secs: u64,
    /// Fixed delay between re-registration attempts
    pub retry_delay_ms: u64,
    /// Attempts for the initial grant + put before `register` fails
    pub initial_attempts: u32,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 10,
            retry_delay_ms: 2000,
            initial_attempts: 3,
        }
    }
}

impl RegistrarConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Delay before rebuilding after the watch stream fails
    pub retry_delay_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { retry_delay_ms: 3000 }
    }
}

impl ResolverConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Interval of the background health sweep
    pub sweep_interval_secs: u64,
    /// Connect timeout applied to every resolved endpoint
    pub connect_timeout_ms: u64,
    /// Capacity of the endpoint change buffer feeding each balanced channel.
    /// Changes are drained only while requests are in flight.
    pub balance_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            connect_timeout_ms: 5000,
            balance_buffer: 1024,
        }
    }
}

impl PoolConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl DiscoveryConfig {
    /// Apply the endpoint override, then validate. Run once after parsing so
    /// an override can fill in endpoints the file leaves empty.
    pub fn finalize(&mut self, endpoints_override: Option<String>) -> Result<()> {
        self.apply_env_overrides(endpoints_override);
        self.validate()?;
        debug!(endpoints = ?self.store.endpoints, backend = ?self.store.backend, "Discovery configuration ready");
        Ok(())
    }

    /// Replace the store endpoints with a comma separated override
    pub fn apply_env_overrides(&mut self, endpoints: Option<String>) {
        if let Some(raw) = endpoints {
            let endpoints: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !endpoints.is_empty() {
                self.store.endpoints = endpoints;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Etcd && self.store.endpoints.is_empty() {
            return Err(DiscoveryError::Config("store.endpoints must not be empty".into()));
        }
        if self.registrar.lease_ttl_secs == 0 {
            return Err(DiscoveryError::Config("registrar.lease_ttl_secs must be positive".into()));
        }
        if self.pool.sweep_interval_secs == 0 {
            return Err(DiscoveryError::Config("pool.sweep_interval_secs must be positive".into()));
        }
        if self.pool.balance_buffer == 0 {
            return Err(DiscoveryError::Config("pool.balance_buffer must be positive".into()));
        }
        Ok(())
    }
}
