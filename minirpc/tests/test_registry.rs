#![forbid(unsafe_code)]

use std::{str::FromStr, sync::Arc, time::Duration};

use minirpc::{InstanceMeta, Registry, RegistryClient, RegistryClientConfig, RegistryConfig};
use serde_json::{Value, json};

async fn start_registry() -> (Arc<Registry>, std::net::SocketAddr) {
    let registry = Registry::create(RegistryConfig::default()).unwrap();
    let addr = std::net::SocketAddr::from_str("127.0.0.1:0").unwrap();
    let addr = registry.listen(addr).await.unwrap();
    (registry, addr)
}

#[tokio::test]
async fn test_register_and_find() {
    let (registry, addr) = start_registry().await;
    let client = reqwest::Client::new();

    let instance = json!({
        "protocol": "json",
        "host": "127.0.0.1",
        "port": 9999,
        "status": null,
        "parameters": {"mode": "development"}
    });
    for _ in 0..2 {
        let response = client
            .post(format!("http://{addr}/register"))
            .json(&instance)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        let registered: Value = response.json().await.unwrap();
        assert_eq!(registered["status"], true);
        assert_eq!(registered["port"], 9999);
    }

    let found: Vec<Value> = client
        .get(format!("http://{addr}/findAllInstances?proto=json"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["host"], "127.0.0.1");
    assert_eq!(found[0]["parameters"]["mode"], "development");

    let found: Vec<Value> = client
        .get(format!("http://{addr}/findAllInstances?proto=binary"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(found.is_empty());

    registry.stop();
    registry.join().await;
}

#[tokio::test]
async fn test_unregister() {
    let (registry, addr) = start_registry().await;
    let client = reqwest::Client::new();
    let instance = json!({"protocol": "json", "host": "127.0.0.1", "port": 1});

    client
        .post(format!("http://{addr}/register"))
        .json(&instance)
        .send()
        .await
        .unwrap();
    assert_eq!(registry.store().len(), 1);

    for _ in 0..2 {
        let response = client
            .post(format!("http://{addr}/unregister"))
            .json(&instance)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let unregistered: Value = response.json().await.unwrap();
        assert_eq!(unregistered["status"], false);
    }
    assert!(registry.store().is_empty());

    registry.stop();
    registry.join().await;
}

#[tokio::test]
async fn test_unknown_route_and_bad_body() {
    let (registry, addr) = start_registry().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/myRegistry/unknown"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"error": "Not Found"}));

    // the route exists but only for POST.
    let response = client
        .get(format!("http://{addr}/register"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = client
        .post(format!("http://{addr}/register"))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("invalid instance"));
    assert!(registry.store().is_empty());

    registry.stop();
    registry.join().await;
}

#[tokio::test]
async fn test_registry_client() {
    let (registry, addr) = start_registry().await;
    let client = RegistryClient::new(RegistryClientConfig::new("127.0.0.1", addr.port()));

    let instance = InstanceMeta::new("json", "::1", 8000);
    let registered = client.register(&instance).await.unwrap();
    assert!(registered.is_alive());
    assert_eq!(registered, instance);

    let found = client.find_instances("json").await.unwrap();
    assert_eq!(found, vec![instance.clone()]);

    let unregistered = client.unregister(&instance).await.unwrap();
    assert_eq!(unregistered.status, Some(false));
    assert!(client.find_instances("json").await.unwrap().is_empty());

    registry.stop();
    assert!(registry.join_timeout(Duration::from_secs(1)).await);
}
