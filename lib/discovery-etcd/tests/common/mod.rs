#![allow(dead_code)]

use async_trait::async_trait;
use discovery_core::{DiscoveryObserver, ResolverConfig, Result, ServiceRecord, Target};
use discovery_etcd::{AddressSink, CoordinationClient, MemoryStore, Resolver};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Sink that publishes every snapshot on a watch channel
pub struct RecordingSink {
    tx: watch::Sender<Option<Vec<String>>>,
    pub updates: AtomicUsize,
    pub rebuilds: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        let (tx, _) = watch::channel(None);
        Arc::new(Self {
            tx,
            updates: AtomicUsize::new(0),
            rebuilds: AtomicUsize::new(0),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Vec<String>>> {
        self.tx.subscribe()
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Wait until the latest snapshot, sorted, equals `expected`
    pub async fn wait_for(&self, expected: &[&str], within: Duration) {
        let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        expected.sort();

        let mut rx = self.subscribe();
        let reached = matches!(tokio::time::timeout(
            within,
            rx.wait_for(|current| match current {
                Some(addrs) => {
                    let mut addrs = addrs.clone();
                    addrs.sort();
                    addrs == expected
                }
                None => false,
            }),
        )
        .await, Ok(Ok(_)));

        assert!(
            reached,
            "address set never became {:?}, last was {:?}",
            expected,
            *self.tx.borrow()
        );
    }
}

#[async_trait]
impl AddressSink for RecordingSink {
    async fn update_addresses(&self, addresses: Vec<String>) -> Result<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.tx.send_replace(Some(addresses));
        Ok(())
    }

    fn report_rebuilding(&self) {
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct CountingObserver {
    pub leases_lost: AtomicUsize,
    pub reregistered: AtomicUsize,
    pub rebuilds: AtomicUsize,
}

impl DiscoveryObserver for CountingObserver {
    fn on_lease_lost(&self, _record: &ServiceRecord) {
        self.leases_lost.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reregistered(&self, _record: &ServiceRecord) {
        self.reregistered.fetch_add(1, Ordering::SeqCst);
    }

    fn on_resolver_rebuild(&self, _target: &Target) {
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn client(store: &MemoryStore) -> Arc<CoordinationClient> {
    Arc::new(CoordinationClient::with_store(Arc::new(store.clone())))
}

pub fn spawn_resolver(
    store: &MemoryStore,
    service: &str,
    sink: Arc<RecordingSink>,
    observer: Arc<CountingObserver>,
) -> Resolver {
    Resolver::spawn(
        Target::for_service(service),
        Arc::new(store.clone()),
        sink,
        &ResolverConfig::default(),
        CancellationToken::new(),
        observer,
    )
}
