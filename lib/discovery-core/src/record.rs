//! Service records and the coordination store key layout
use serde::{Deserialize, Serialize};
use std::fmt;

/// Root of every registration key.
pub const SERVICES_ROOT: &str = "/services";

/// "instance `address` serves `service_name`"
///
/// The address is encoded entirely in the store key; the stored value is empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service_name: String,
    pub address: String,
}

impl ServiceRecord {
    pub fn new(service_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            address: address.into(),
        }
    }

    /// Identity of the record, `<service>/<address>`
    pub fn id(&self) -> String {
        format!("{}/{}", self.service_name, self.address)
    }

    /// Full store key, `/services/<service>/<address>`
    pub fn key(&self) -> String {
        format!("{}{}", service_prefix(&self.service_name), self.address)
    }

    /// Parse a store key back into a record. Returns `None` for keys outside
    /// the services root or with an empty address.
    pub fn from_key(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(SERVICES_ROOT)?.strip_prefix('/')?;
        let (service_name, address) = rest.split_once('/')?;
        if service_name.is_empty() || address.is_empty() {
            return None;
        }
        Some(Self::new(service_name, address))
    }
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Prefix under which every instance of `service_name` is registered.
pub fn service_prefix(service_name: &str) -> String {
    format!("{}/{}/", SERVICES_ROOT, service_name)
}

/// Strip `prefix` from `key`, yielding the instance address. The bare prefix
/// itself yields `None`.
pub fn address_from_key<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    match key.strip_prefix(prefix) {
        Some("") | None => None,
        Some(addr) => Some(addr),
    }
}
