use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;
use serde_json::{Map, Value};

use crate::{
    TaskSupervisor, Transport,
    codec::{Reply, Request},
    discovery::{LoadBalance, RandomBalance, ServerAddr, ServerCache},
    error::{Error, ErrorKind, Result},
    registry::RegistryClient,
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Bound on connecting, and separately on one request/reply exchange.
    #[serde_inline_default(Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// How often the registry is asked for the current servers.
    #[serde_inline_default(Duration::from_secs(3))]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde_inline_default("json".to_string())]
    pub protocol: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Discovery {
    Direct(ServerAddr),
    Registry {
        registry: RegistryClient,
        cache: Arc<ServerCache>,
    },
}

/// Calls remote methods by name.
///
/// A client either talks to one fixed server or discovers servers through
/// the registry. Every call opens a fresh connection, sends one request,
/// reads one reply and closes the connection.
#[derive(Debug)]
pub struct RpcClient {
    discovery: Discovery,
    config: ClientConfig,
    balance: Box<dyn LoadBalance>,
    task_supervisor: TaskSupervisor,
}

impl RpcClient {
    /// A client that sends every call to `host:port`.
    #[must_use]
    pub fn direct(host: impl Into<String>, port: u16, config: ClientConfig) -> Self {
        Self {
            discovery: Discovery::Direct(ServerAddr::new(host, port)),
            config,
            balance: Box::new(RandomBalance),
            task_supervisor: TaskSupervisor::create(),
        }
    }

    /// A client that discovers servers of `config.protocol` through
    /// `registry`. A background poller refreshes the server cache every
    /// `config.poll_interval` until the client is stopped or dropped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the config does not validate.
    pub fn with_registry(registry: RegistryClient, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(ServerCache::default());
        let task_supervisor = TaskSupervisor::create();

        let poller = {
            let registry = registry.clone();
            let cache = cache.clone();
            let protocol = config.protocol.clone();
            let poll_interval = config.poll_interval;
            async move {
                let mut interval = tokio::time::interval(poll_interval);
                loop {
                    interval.tick().await;
                    let _ = refresh(&registry, &protocol, &cache).await;
                }
            }
        };
        task_supervisor.spawn(poller);

        Ok(Self {
            discovery: Discovery::Registry { registry, cache },
            config,
            balance: Box::new(RandomBalance),
            task_supervisor,
        })
    }

    /// Replaces the default random choice of server.
    #[must_use]
    pub fn with_balancer(mut self, balance: impl LoadBalance + 'static) -> Self {
        self.balance = Box::new(balance);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The discovered servers; `None` for a direct client.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<ServerCache>> {
        match &self.discovery {
            Discovery::Direct(_) => None,
            Discovery::Registry { cache, .. } => Some(cache),
        }
    }

    /// Fetches the current servers from the registry right away. A failed
    /// fetch leaves the cache as it was.
    pub async fn refresh(&self) -> Result<usize> {
        match &self.discovery {
            Discovery::Direct(_) => Ok(1),
            Discovery::Registry { registry, cache } => {
                refresh(registry, &self.config.protocol, cache).await
            }
        }
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with_kwargs(method, args, Map::new()).await
    }

    /// Calls `method` and decodes its result as `R`.
    pub async fn call_as<R: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<R> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn call_with_kwargs(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        let req = Request::new(method, args).with_kwargs(kwargs);
        let server = self.pick_server().await?;
        tracing::info!(
            "call {method} on {server}, args: {:?}, kwargs: {:?}",
            req.method_args,
            req.method_kwargs
        );

        let result = self.call_server(&server, &req).await;
        match &result {
            Ok(value) => tracing::info!("{method} on {server} returned {value}"),
            Err(e) => tracing::error!("{method} on {server} failed: {e}"),
        }
        result
    }

    pub fn stop(&self) {
        self.task_supervisor.stop();
    }

    async fn pick_server(&self) -> Result<ServerAddr> {
        let (registry, cache) = match &self.discovery {
            Discovery::Direct(server) => return Ok(server.clone()),
            Discovery::Registry { registry, cache } => (registry, cache),
        };

        if cache.is_empty() {
            let _ = refresh(registry, &self.config.protocol, cache).await;
        }
        let servers = cache.snapshot();
        self.balance.choose(&servers).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::NoAvailableServers,
                format!("no available servers for protocol {}", self.config.protocol),
            )
        })
    }

    async fn call_server(&self, server: &ServerAddr, req: &Request) -> Result<Value> {
        let mut transport =
            match Transport::connect(&server.host, server.port, self.config.timeout).await {
                Ok(transport) => transport,
                Err(e) => {
                    if let Some(cache) = self.cache()
                        && cache.evict(server)
                    {
                        tracing::warn!("evict unreachable server {server}");
                    }
                    return Err(e);
                }
            };

        let exchange = async {
            transport.send_frame(&req.encode()?).await?;
            match transport.recv_frame().await? {
                Some(bytes) => Reply::decode(&bytes),
                None => Err(Error::new(
                    ErrorKind::EndOfStream,
                    format!("{server} closed the connection without replying"),
                )),
            }
        };
        let reply = match tokio::time::timeout(self.config.timeout, exchange).await {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(Error::new(
                    ErrorKind::Timeout,
                    format!("no reply from {server} within {:?}", self.config.timeout),
                ));
            }
        };

        if let Err(e) = transport.close().await {
            tracing::debug!("close connection to {server} failed: {e}");
        }
        reply.into_result()
    }
}

async fn refresh(registry: &RegistryClient, protocol: &str, cache: &ServerCache) -> Result<usize> {
    match registry.find_instances(protocol).await {
        Ok(instances) => {
            let servers: Vec<_> = instances
                .iter()
                .filter_map(ServerAddr::from_instance)
                .collect();
            tracing::debug!("discovered {} {protocol} servers", servers.len());
            let count = servers.len();
            cache.merge(servers);
            Ok(count)
        }
        Err(e) => {
            tracing::warn!("discover {protocol} servers failed, keep cached servers: {e}");
            Err(e)
        }
    }
}
