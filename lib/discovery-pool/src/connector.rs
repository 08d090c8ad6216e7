//! Building pooled connections for a resolution target

use crate::channel::{ChannelOptions, DiscoveryChannel};
use crate::state::ConnectionState;
use async_trait::async_trait;
use discovery_core::{DiscoveryError, PoolConfig, Result, Target};
use discovery_etcd::ResolverBuilder;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::transport::ClientTlsConfig;
use tracing::debug;

/// A connection the pool can cache and health-check
pub trait PooledConnection: Clone + Send + Sync + 'static {
    fn state(&self) -> ConnectionState;

    fn close(&self);
}

impl PooledConnection for DiscoveryChannel {
    fn state(&self) -> ConnectionState {
        DiscoveryChannel::state(self)
    }

    fn close(&self) {
        DiscoveryChannel::close(self)
    }
}

/// Creates connections for the pool
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: PooledConnection;

    async fn connect(
        &self,
        target: &Target,
        tls: Option<&ClientTlsConfig>,
    ) -> Result<Self::Connection>;
}

/// Connects through the resolver builder registered for the target's scheme
pub struct DiscoveryConnector {
    builders: HashMap<String, Arc<dyn ResolverBuilder>>,
    config: PoolConfig,
}

impl DiscoveryConnector {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            builders: HashMap::new(),
            config,
        }
    }

    /// Register `builder` for its scheme, replacing any previous one
    pub fn with_builder(mut self, builder: Arc<dyn ResolverBuilder>) -> Self {
        self.builders.insert(builder.scheme().to_string(), builder);
        self
    }

    pub fn schemes(&self) -> Vec<&str> {
        self.builders.keys().map(String::as_str).collect()
    }
}

#[async_trait]
impl Connector for DiscoveryConnector {
    type Connection = DiscoveryChannel;

    async fn connect(
        &self,
        target: &Target,
        tls: Option<&ClientTlsConfig>,
    ) -> Result<DiscoveryChannel> {
        let builder = self
            .builders
            .get(&target.scheme)
            .ok_or_else(|| DiscoveryError::UnknownScheme(target.scheme.clone()))?;

        debug!(target = %target, tls = tls.is_some(), "Connecting");
        let options = ChannelOptions {
            connect_timeout: self.config.connect_timeout(),
            buffer: self.config.balance_buffer,
            tls: tls.cloned(),
        };
        DiscoveryChannel::build(target.clone(), builder.as_ref(), options).await
    }
}
