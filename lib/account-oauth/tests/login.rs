use account_oauth::{LoginError, OAuthConfig, OAuthLoginService};
use discovery_core::{noop_observer, DiscoveryError, PoolConfig, RegistrarConfig, ResolverConfig};
use discovery_etcd::{CoordinationClient, DiscoveryResolverBuilder, MemoryStore, ServiceRegistrar};
use discovery_pool::{ConnectionPool, DiscoveryConnector, TlsClientSettings};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn pool(store: &MemoryStore) -> Arc<ConnectionPool<DiscoveryConnector>> {
    let client = Arc::new(CoordinationClient::with_store(Arc::new(store.clone())));
    let builder = DiscoveryResolverBuilder::new(
        client,
        ResolverConfig::default(),
        CancellationToken::new(),
        noop_observer(),
    );
    let connector = DiscoveryConnector::new(PoolConfig::default()).with_builder(Arc::new(builder));
    Arc::new(ConnectionPool::new(connector))
}

#[tokio::test(start_paused = true)]
async fn empty_code_is_rejected_before_any_rpc() {
    let store = MemoryStore::new();
    let pool = pool(&store);
    let service = OAuthLoginService::new(pool.clone(), &OAuthConfig::default())
        .await
        .unwrap();

    assert!(matches!(service.github_login("  ").await, Err(LoginError::EmptyCode)));
    assert!(pool.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn no_instances_is_service_unavailable() {
    let store = MemoryStore::new();
    let service = OAuthLoginService::new(pool(&store), &OAuthConfig::default())
        .await
        .unwrap();

    match service.github_login("abc123").await {
        Err(LoginError::ServiceUnavailable(DiscoveryError::NoAddresses(name))) => {
            assert_eq!(name, "github-oauth-service")
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn resolved_instance_reaches_the_rpc() {
    let store = MemoryStore::new();
    let pool = pool(&store);
    let registrar = ServiceRegistrar::new(
        Arc::new(CoordinationClient::with_store(Arc::new(store.clone()))),
        RegistrarConfig::default(),
        noop_observer(),
    );
    registrar
        .register("github-oauth-service", "127.0.0.1:1")
        .await
        .unwrap();
    let service = OAuthLoginService::new(pool, &OAuthConfig::default())
        .await
        .unwrap();

    // an address was resolved, so the failure comes from the call itself
    let err = service.github_login("abc123").await.unwrap_err();
    assert!(!err.is_unavailable(), "unexpected {:?}", err);
    registrar.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pool_failure_is_service_unavailable() {
    // no resolver builders registered, so every build fails
    let pool = Arc::new(ConnectionPool::new(DiscoveryConnector::new(PoolConfig::default())));
    let service = OAuthLoginService::new(pool, &OAuthConfig::default())
        .await
        .unwrap();

    let err = service.github_login("abc123").await.unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn missing_ca_file_fails_construction() {
    let store = MemoryStore::new();
    let config = OAuthConfig {
        tls: TlsClientSettings::with_ca_file("/nonexistent/grpc-ca.pem"),
        ..OAuthConfig::default()
    };
    let result = OAuthLoginService::new(pool(&store), &config).await;
    assert!(matches!(result, Err(LoginError::Tls(_))));
}
