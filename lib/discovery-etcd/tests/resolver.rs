mod common;

use common::{spawn_resolver, CountingObserver, RecordingSink};
use discovery_core::ServiceRecord;
use discovery_etcd::{CoordinationStore, MemoryStore, ResolverState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const SERVICE: &str = "github-oauth-service";
const WITHIN: Duration = Duration::from_secs(5);

async fn advertise(store: &MemoryStore, address: &str) -> i64 {
    let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
    let key = ServiceRecord::new(SERVICE, address).key();
    store.put(&key, lease.id).await.unwrap();
    lease.id
}

#[tokio::test(start_paused = true)]
async fn initial_listing_is_published() {
    let store = MemoryStore::new();
    advertise(&store, "10.0.0.5:9001").await;
    advertise(&store, "10.0.0.6:9001").await;

    let sink = RecordingSink::new();
    let resolver = spawn_resolver(&store, SERVICE, sink.clone(), Arc::default());

    sink.wait_for(&["10.0.0.5:9001", "10.0.0.6:9001"], WITHIN).await;
    let mut state = resolver.subscribe();
    state.wait_for(|s| *s == ResolverState::Watching).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn empty_listing_is_published() {
    let store = MemoryStore::new();
    let sink = RecordingSink::new();
    let _resolver = spawn_resolver(&store, SERVICE, sink.clone(), Arc::default());

    sink.wait_for(&[], WITHIN).await;
}

#[tokio::test(start_paused = true)]
async fn watch_events_update_the_set() {
    let store = MemoryStore::new();
    let sink = RecordingSink::new();
    let _resolver = spawn_resolver(&store, SERVICE, sink.clone(), Arc::default());
    sink.wait_for(&[], WITHIN).await;

    advertise(&store, "10.0.0.5:9001").await;
    sink.wait_for(&["10.0.0.5:9001"], WITHIN).await;

    let lease = advertise(&store, "10.0.0.6:9001").await;
    sink.wait_for(&["10.0.0.5:9001", "10.0.0.6:9001"], WITHIN).await;

    store.revoke_lease(lease).await.unwrap();
    sink.wait_for(&["10.0.0.5:9001"], WITHIN).await;

    store.delete(&ServiceRecord::new(SERVICE, "10.0.0.5:9001").key()).await.unwrap();
    sink.wait_for(&[], WITHIN).await;
}

#[tokio::test(start_paused = true)]
async fn other_services_are_ignored() {
    let store = MemoryStore::new();
    let sink = RecordingSink::new();
    let _resolver = spawn_resolver(&store, SERVICE, sink.clone(), Arc::default());
    sink.wait_for(&[], WITHIN).await;

    let lease = store.grant_lease(Duration::from_secs(10)).await.unwrap();
    let other = ServiceRecord::new("github-oauth-service-v2", "10.0.0.9:9001");
    store.put(&other.key(), lease.id).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    sink.wait_for(&[], WITHIN).await;
    assert_eq!(sink.updates(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_puts_keep_one_address() {
    let store = MemoryStore::new();
    let sink = RecordingSink::new();
    let _resolver = spawn_resolver(&store, SERVICE, sink.clone(), Arc::default());
    sink.wait_for(&[], WITHIN).await;

    advertise(&store, "10.0.0.5:9001").await;
    advertise(&store, "10.0.0.5:9001").await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    sink.wait_for(&["10.0.0.5:9001"], WITHIN).await;
    // initial empty set plus one insert; the duplicate put changes nothing
    assert_eq!(sink.updates(), 2);
}

#[tokio::test(start_paused = true)]
async fn broken_watch_is_rebuilt_from_fresh_listing() {
    let store = MemoryStore::new();
    let first = advertise(&store, "10.0.0.5:9001").await;

    let sink = RecordingSink::new();
    let observer = Arc::new(CountingObserver::default());
    let resolver = spawn_resolver(&store, SERVICE, sink.clone(), observer.clone());
    sink.wait_for(&["10.0.0.5:9001"], WITHIN).await;

    // Partition: the watch dies and membership changes while nobody is looking.
    store.set_available(false);
    store.expire_lease(first);
    let mut state = resolver.subscribe();
    state.wait_for(|s| *s == ResolverState::Building).await.unwrap();
    store.set_available(true);
    advertise(&store, "10.0.0.6:9001").await;

    sink.wait_for(&["10.0.0.6:9001"], Duration::from_secs(10)).await;
    state.wait_for(|s| *s == ResolverState::Watching).await.unwrap();
    assert!(observer.rebuilds.load(Ordering::SeqCst) >= 1);
    assert!(sink.rebuilds.load(Ordering::SeqCst) >= 1);

    // the rebuilt watch keeps delivering
    advertise(&store, "10.0.0.7:9001").await;
    sink.wait_for(&["10.0.0.6:9001", "10.0.0.7:9001"], WITHIN).await;
}

#[tokio::test(start_paused = true)]
async fn forced_watch_termination_recovers() {
    let store = MemoryStore::new();
    advertise(&store, "10.0.0.5:9001").await;

    let sink = RecordingSink::new();
    let resolver = spawn_resolver(&store, SERVICE, sink.clone(), Arc::default());
    sink.wait_for(&["10.0.0.5:9001"], WITHIN).await;

    store.break_watches();
    assert_eq!(store.watch_count(), 0);

    // one retry interval later the resolver is watching again
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(sink.rebuilds.load(Ordering::SeqCst), 1);
    assert_eq!(resolver.state(), ResolverState::Watching);
    assert_eq!(store.watch_count(), 1);
    sink.wait_for(&["10.0.0.5:9001"], WITHIN).await;

    advertise(&store, "10.0.0.6:9001").await;
    sink.wait_for(&["10.0.0.5:9001", "10.0.0.6:9001"], WITHIN).await;
}

#[tokio::test(start_paused = true)]
async fn close_is_terminal() {
    let store = MemoryStore::new();
    let sink = RecordingSink::new();
    let resolver = spawn_resolver(&store, SERVICE, sink.clone(), Arc::default());
    sink.wait_for(&[], WITHIN).await;

    let mut state = resolver.subscribe();
    resolver.close();
    state.wait_for(|s| *s == ResolverState::Closed).await.unwrap();

    advertise(&store, "10.0.0.5:9001").await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(sink.updates(), 1);
    assert_eq!(store.watch_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn close_interrupts_retry_delay() {
    let store = MemoryStore::new();
    store.set_available(false);

    let sink = RecordingSink::new();
    let resolver = spawn_resolver(&store, SERVICE, sink.clone(), Arc::default());
    let mut state = resolver.subscribe();

    // let the first attempt fail and the loop settle into its retry delay
    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = tokio::time::Instant::now();
    resolver.shutdown().await;

    assert_eq!(*state.borrow_and_update(), ResolverState::Closed);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(sink.updates(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_closes_the_resolver() {
    let store = MemoryStore::new();
    let sink = RecordingSink::new();
    let resolver = spawn_resolver(&store, SERVICE, sink.clone(), Arc::default());
    sink.wait_for(&[], WITHIN).await;

    let mut state = resolver.subscribe();
    drop(resolver);
    state.wait_for(|s| *s == ResolverState::Closed).await.unwrap();
}

/// Sink whose first update never completes
struct StalledSink;

#[async_trait::async_trait]
impl discovery_etcd::AddressSink for StalledSink {
    async fn update_addresses(&self, _addresses: Vec<String>) -> discovery_core::Result<()> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn close_interrupts_a_stalled_sink() {
    let store = MemoryStore::new();
    advertise(&store, "10.0.0.5:9001").await;

    let resolver = discovery_etcd::Resolver::spawn(
        discovery_core::Target::for_service(SERVICE),
        Arc::new(store.clone()),
        Arc::new(StalledSink),
        &discovery_core::ResolverConfig::default(),
        tokio_util::sync::CancellationToken::new(),
        Arc::new(CountingObserver::default()),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(resolver.state(), ResolverState::Building);

    let mut state = resolver.subscribe();
    let closed = tokio::time::timeout(Duration::from_secs(3), resolver.shutdown()).await;
    assert!(closed.is_ok());
    assert_eq!(*state.borrow_and_update(), ResolverState::Closed);
    assert_eq!(store.watch_count(), 0);
}
