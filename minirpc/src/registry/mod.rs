//! The registry: an instance table with heartbeat expiry behind a small
//! JSON-over-HTTP front end, plus the client used to talk to it.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use hyper::{Request, body::Incoming, server::conn::http1::Builder};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::{net::TcpListener, time::Instant};

use crate::{
    TaskSupervisor,
    error::{Error, ErrorKind, Result},
    transport::accept_with_backoff,
};

mod client;
pub use client::{RegistryClient, RegistryClientConfig};

mod http;
pub use http::handle_request;

mod store;
pub use store::RegistryStore;

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct RegistryConfig {
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Delay before the first sweep so the listener can bind first.
    #[serde_inline_default(Duration::from_secs(2))]
    #[serde(with = "humantime_serde")]
    pub sweep_initial_delay: Duration,
    #[serde_inline_default(Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub expire_threshold: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl RegistryConfig {
    /// Rejects a zero `sweep_interval`, which would leave the registry
    /// without a sweep.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "sweep_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct Registry {
    store: Arc<RegistryStore>,
    config: RegistryConfig,
    http: Builder,
    task_supervisor: TaskSupervisor,
}

impl Registry {
    /// Creates the registry and starts its health sweep.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the config does not validate.
    pub fn create(config: RegistryConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = Arc::new(Self {
            store: Arc::default(),
            config,
            http: Builder::new(),
            task_supervisor: TaskSupervisor::create(),
        });

        let store = registry.store.clone();
        let config = registry.config.clone();
        registry.task_supervisor.spawn(async move {
            tokio::time::sleep(config.sweep_initial_delay).await;
            let mut interval = tokio::time::interval(config.sweep_interval);
            loop {
                interval.tick().await;
                store.sweep_expired(Instant::now(), config.expire_threshold);
            }
        });

        Ok(registry)
    }

    #[must_use]
    pub fn store(&self) -> &Arc<RegistryStore> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Binds `addr` and serves the HTTP routes until stopped. Returns the
    /// bound address, which differs from `addr` when port 0 was requested.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, format!("{addr}: {e}")))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;
        tracing::info!("registry listening: {listener_addr}");

        let this = self.clone();
        self.task_supervisor.spawn(async move {
            loop {
                let (stream, peer) = accept_with_backoff(|| listener.accept()).await;
                this.serve_stream(stream, peer);
            }
        });

        Ok(listener_addr)
    }

    fn serve_stream(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let store = self.store.clone();
        let connection = self.http.serve_connection(
            TokioIo::new(stream),
            hyper::service::service_fn(move |req: Request<Incoming>| {
                handle_request(store.clone(), req)
            }),
        );
        self.task_supervisor.spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("registry connection from {peer} failed: {e}");
            }
        });
    }

    pub fn stop(&self) {
        self.task_supervisor.stop();
    }

    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }

    pub async fn join_timeout(&self, timeout: Duration) -> bool {
        self.task_supervisor.join_timeout(timeout).await
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("instances", &self.store.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InstanceMeta;

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.sweep_initial_delay, Duration::from_secs(2));
        assert_eq!(config.expire_threshold, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_task_evicts_silent_instances() {
        let registry = Registry::create(RegistryConfig::default()).unwrap();
        registry
            .store()
            .register(InstanceMeta::new("json", "127.0.0.1", 9999));
        assert_eq!(registry.store().len(), 1);

        // initial delay + a sweep that sees the instance as fresh.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(registry.store().len(), 1);

        // the first sweep after the threshold evicts it.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(registry.store().is_empty());

        registry.stop();
        assert!(registry.join_timeout(Duration::from_secs(1)).await);
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let config = RegistryConfig {
            sweep_interval: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let err = Registry::create(config).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let config: RegistryConfig = serde_json::from_str(r#"{"sweep_interval": "0s"}"#).unwrap();
        assert!(config.validate().is_err());
        assert!(RegistryConfig::default().validate().is_ok());
    }
}
