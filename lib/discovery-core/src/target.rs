//! Resolution targets of the form `<scheme>:///<service>`

use crate::{DiscoveryError, Result};
use std::fmt;

/// Scheme that selects coordination-store backed resolution.
pub const DISCOVERY_SCHEME: &str = "discovery";

/// A parsed resolution target
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    pub scheme: String,
    pub service_name: String,
}

impl Target {
    /// Target for `service_name` under the discovery scheme
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            scheme: DISCOVERY_SCHEME.to_string(),
            service_name: service_name.into(),
        }
    }

    /// Parse `scheme:///service`. The authority must be empty and the
    /// service name non-empty without further path segments.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| DiscoveryError::InvalidTarget(format!("missing scheme: {}", uri)))?;

        if scheme.is_empty() {
            return Err(DiscoveryError::InvalidTarget(format!("empty scheme: {}", uri)));
        }

        let service_name = rest.strip_prefix('/').ok_or_else(|| {
            DiscoveryError::InvalidTarget(format!("authority not supported: {}", uri))
        })?;

        if service_name.is_empty() || service_name.contains('/') {
            return Err(DiscoveryError::InvalidTarget(format!(
                "invalid service name in {}",
                uri
            )));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            service_name: service_name.to_string(),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:///{}", self.scheme, self.service_name)
    }
}
