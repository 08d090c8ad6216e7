//! Live address set for one logical service

use tracing::debug;

/// A single membership change observed on a watch stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// Instance joined or renewed
    Put(String),
    /// Instance left or its lease expired
    Delete(String),
}

/// AddressSet holds the instance addresses currently registered for one
/// service. Order is irrelevant to consumers but insertion order is kept so
/// snapshots are stable between updates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressSet {
    addresses: Vec<String>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from a listing, collapsing duplicates and dropping empty entries.
    pub fn from_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for addr in addresses {
            set.insert(addr);
        }
        set
    }

    /// Insert an address. Returns `false` if it was already present.
    pub fn insert(&mut self, address: impl Into<String>) -> bool {
        let address = address.into();
        if address.is_empty() || self.contains(&address) {
            return false;
        }
        debug!(address = %address, "Address added");
        self.addresses.push(address);
        true
    }

    /// Remove the first matching address. Returns `false` if it was absent.
    pub fn remove(&mut self, address: &str) -> bool {
        match self.addresses.iter().position(|a| a == address) {
            Some(idx) => {
                self.addresses.remove(idx);
                debug!(address = %address, "Address removed");
                true
            }
            None => false,
        }
    }

    /// Apply a batch of watch events in the order received. Returns whether
    /// the set changed.
    pub fn apply(&mut self, events: &[WatchEvent]) -> bool {
        let mut changed = false;
        for event in events {
            changed |= match event {
                WatchEvent::Put(addr) => self.insert(addr.clone()),
                WatchEvent::Delete(addr) => self.remove(addr),
            };
        }
        changed
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.iter().any(|a| a == address)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.addresses.iter().map(String::as_str)
    }

    /// Owned copy handed to consumers; the set itself is never shared mutably.
    pub fn snapshot(&self) -> Vec<String> {
        self.addresses.clone()
    }
}
