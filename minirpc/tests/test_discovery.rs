#![forbid(unsafe_code)]

use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use minirpc::{
    ClientConfig, InstanceMeta, Registry, RegistryClient, RegistryClientConfig, RegistryConfig,
    RpcClient, RpcServer, ServerConfig, ServiceTable,
};
use serde_json::json;

async fn start_registry() -> (Arc<Registry>, RegistryClient) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let registry = Registry::create(RegistryConfig {
        sweep_interval: Duration::from_millis(200),
        sweep_initial_delay: Duration::from_millis(100),
        expire_threshold: Duration::from_secs(1),
    })
    .unwrap();
    let addr = std::net::SocketAddr::from_str("127.0.0.1:0").unwrap();
    let addr = registry.listen(addr).await.unwrap();
    let client = RegistryClient::new(RegistryClientConfig::new("127.0.0.1", addr.port()));
    (registry, client)
}

fn hi_table(counter: Arc<AtomicUsize>) -> ServiceTable {
    let mut table = ServiceTable::default();
    table.add_method("hi", move |(user,): (String,)| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok::<_, String>(format!("hi {user}, welcome"))
    });
    table
}

fn server_config() -> ServerConfig {
    ServerConfig {
        heartbeat_interval: Duration::from_millis(200),
        parameters: json!({"mode": "development"}).as_object().unwrap().clone(),
        ..Default::default()
    }
}

async fn start_server(registry: &RegistryClient, counter: Arc<AtomicUsize>) -> Arc<RpcServer> {
    let server = RpcServer::with_registry(hi_table(counter), server_config(), registry.clone());
    let addr = std::net::SocketAddr::from_str("127.0.0.1:0").unwrap();
    server.listen(addr).await.unwrap();
    server
}

async fn wait_for_instances(registry: &RegistryClient, count: usize) {
    for _ in 0..50 {
        if registry.find_instances("json").await.unwrap().len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("registry never reached {count} instances");
}

#[tokio::test]
async fn test_calls_spread_across_servers() {
    let (registry, registry_client) = start_registry().await;
    let counters = [Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))];
    let server_a = start_server(&registry_client, counters[0].clone()).await;
    let server_b = start_server(&registry_client, counters[1].clone()).await;
    wait_for_instances(&registry_client, 2).await;

    let instances = registry_client.find_instances("json").await.unwrap();
    assert!(instances.iter().all(|i| i.parameters["mode"] == "development"));

    let client =
        RpcClient::with_registry(registry_client.clone(), ClientConfig::default()).unwrap();
    for _ in 0..10 {
        let greeting = client.call("hi", vec![json!("accio")]).await.unwrap();
        assert_eq!(greeting, json!("hi accio, welcome"));
    }
    for _ in 0..90 {
        client.call("hi", vec![json!("accio")]).await.unwrap();
    }
    let counts: Vec<usize> = counters.iter().map(|c| c.load(Ordering::Relaxed)).collect();
    assert_eq!(counts.iter().sum::<usize>(), 100);
    assert!(counts.iter().all(|&c| c > 10), "{counts:?}");

    client.stop();
    server_a.stop().await;
    server_b.stop().await;
    registry.stop();
    registry.join().await;
}

#[tokio::test]
async fn test_stopped_server_leaves_registry() {
    let (registry, registry_client) = start_registry().await;
    let server_a = start_server(&registry_client, Arc::default()).await;
    let server_b = start_server(&registry_client, Arc::default()).await;
    wait_for_instances(&registry_client, 2).await;

    server_a.stop().await;
    let remaining = registry_client.find_instances("json").await.unwrap();
    assert_eq!(remaining, vec![server_b.instance().unwrap()]);

    // the client refreshes to the one remaining server.
    let client = RpcClient::with_registry(
        registry_client.clone(),
        ClientConfig {
            poll_interval: Duration::from_millis(100),
            ..Default::default()
        },
    )
    .unwrap();
    client.refresh().await.unwrap();
    let cache = client.cache().unwrap();
    assert_eq!(cache.len(), 1);
    for _ in 0..5 {
        client.call("hi", vec![json!("accio")]).await.unwrap();
    }

    client.stop();
    server_b.stop().await;
    registry.stop();
    registry.join().await;
}

#[tokio::test]
async fn test_silent_server_is_swept() {
    let (registry, registry_client) = start_registry().await;

    // registered once, never heartbeats.
    let silent = InstanceMeta::new("json", "127.0.0.1", 1);
    registry_client.register(&silent).await.unwrap();
    assert_eq!(registry.store().len(), 1);

    // a heartbeating server survives the sweeps.
    let server = start_server(&registry_client, Arc::default()).await;
    tokio::time::sleep(Duration::from_millis(1600)).await;
    let remaining = registry_client.find_instances("json").await.unwrap();
    assert_eq!(remaining, vec![server.instance().unwrap()]);

    server.stop().await;
    registry.stop();
    registry.join().await;
}

#[tokio::test]
async fn test_failed_refresh_keeps_cache() {
    let (registry, registry_client) = start_registry().await;
    let server = start_server(&registry_client, Arc::default()).await;
    wait_for_instances(&registry_client, 1).await;

    let client =
        RpcClient::with_registry(registry_client.clone(), ClientConfig::default()).unwrap();
    client.refresh().await.unwrap();
    assert_eq!(client.cache().unwrap().len(), 1);

    // the registry goes away; calls keep working off the cache.
    registry.stop();
    registry.join().await;
    assert!(client.refresh().await.is_err());
    assert_eq!(client.cache().unwrap().len(), 1);
    let greeting = client.call("hi", vec![json!("accio")]).await.unwrap();
    assert_eq!(greeting, json!("hi accio, welcome"));

    client.stop();
    server.stop().await;
}
