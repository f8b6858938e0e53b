use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use serde_json::{Map, Value};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    ServiceTable, TaskSupervisor, Transport,
    codec::Request,
    error::{Error, ErrorKind, Result},
    instance::InstanceMeta,
    registry::RegistryClient,
    transport::accept_with_backoff,
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ServerConfig {
    /// Protocol name the server registers under.
    #[serde_inline_default("json".to_string())]
    pub protocol: String,
    /// Host announced to the registry. Defaults to the bound address, or
    /// loopback when bound to an unspecified address.
    #[serde_inline_default(None)]
    pub advertise_host: Option<String>,
    #[serde_inline_default(Duration::from_secs(9))]
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat failures after which heartbeating stops; `0`
    /// keeps retrying forever.
    #[serde_inline_default(3)]
    pub max_heartbeat_failures: u32,
    #[serde_inline_default(Duration::from_secs(3))]
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,
    /// Extra parameters attached to the registered instance.
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "heartbeat_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// RPC server exposing the methods of a [`ServiceTable`].
///
/// The `Server` manages:
/// - An accept loop spawning one handler task per connection
/// - Per-connection request loops: a connection may carry any number of
///   sequential request/reply pairs
/// - Heartbeats to the registry, when one is configured
///
/// # Examples
///
/// ```rust,no_run
/// # use minirpc::{RpcServer, ServerConfig, ServiceTable};
/// # use std::{net::SocketAddr, str::FromStr};
/// # #[tokio::main]
/// # async fn main() {
/// let mut table = ServiceTable::default();
/// table.add_method("hi", |(user,): (String,)| {
///     Ok::<_, String>(format!("hi {user}, welcome"))
/// });
///
/// let server = RpcServer::create(table, ServerConfig::default());
/// let addr = SocketAddr::from_str("127.0.0.1:8000").unwrap();
/// server.listen(addr).await.unwrap();
///
/// tokio::signal::ctrl_c().await.unwrap();
/// server.stop().await;
/// # }
/// ```
pub struct RpcServer {
    table: Arc<ServiceTable>,
    config: ServerConfig,
    registry: Option<RegistryClient>,
    instance: Mutex<Option<InstanceMeta>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    task_supervisor: TaskSupervisor,
}

impl RpcServer {
    /// Creates a server that does not register anywhere.
    #[must_use]
    pub fn create(table: ServiceTable, config: ServerConfig) -> Arc<Self> {
        Self::build(table, config, None)
    }

    /// Creates a server that registers itself with `registry` once it
    /// listens, and heartbeats until stopped.
    #[must_use]
    pub fn with_registry(
        table: ServiceTable,
        config: ServerConfig,
        registry: RegistryClient,
    ) -> Arc<Self> {
        Self::build(table, config, Some(registry))
    }

    fn build(
        table: ServiceTable,
        config: ServerConfig,
        registry: Option<RegistryClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: Arc::new(table),
            config,
            registry,
            instance: Mutex::default(),
            heartbeat: Mutex::default(),
            stopping: AtomicBool::new(false),
            task_supervisor: TaskSupervisor::create(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn table(&self) -> &Arc<ServiceTable> {
        &self.table
    }

    /// The instance this server announces, once it is listening.
    #[must_use]
    pub fn instance(&self) -> Option<InstanceMeta> {
        self.instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts listening for incoming connections on the specified address.
    ///
    /// # Returns
    ///
    /// Returns the actual address the server is listening on, which may differ
    /// from the requested address if port 0 was specified.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the config does not validate, and
    /// `TcpBindFailed` if the address cannot be bound.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        self.config.validate()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, format!("{addr}: {e}")))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;
        tracing::info!("server listening: {listener_addr}");

        let instance = InstanceMeta::new(
            &self.config.protocol,
            self.advertise_host(listener_addr.ip()),
            listener_addr.port(),
        )
        .add_parameters(self.config.parameters.clone());
        *self.instance.lock().unwrap_or_else(PoisonError::into_inner) = Some(instance.clone());

        let this = self.clone();
        self.task_supervisor.spawn(async move {
            loop {
                let (stream, peer) = accept_with_backoff(|| listener.accept()).await;
                this.handle_new_stream(stream, peer);
            }
        });

        if let Some(registry) = &self.registry {
            let heartbeat = self.task_supervisor.spawn(heartbeat_loop(
                registry.clone(),
                instance,
                self.config.heartbeat_interval,
                self.config.max_heartbeat_failures,
            ));
            *self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Some(heartbeat);
        }

        Ok(listener_addr)
    }

    fn advertise_host(&self, ip: IpAddr) -> String {
        if let Some(host) = &self.config.advertise_host {
            return host.clone();
        }
        match ip {
            IpAddr::V4(ip) if ip.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
            IpAddr::V6(ip) if ip.is_unspecified() => Ipv6Addr::LOCALHOST.to_string(),
            ip => ip.to_string(),
        }
    }

    fn handle_new_stream(&self, stream: TcpStream, peer: SocketAddr) {
        tracing::info!("accepted connection from {peer}");
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("set nodelay for {peer} failed: {e}");
        }
        self.task_supervisor.spawn_unbounded(serve_connection(
            self.table.clone(),
            Transport::new(stream),
            peer,
            self.task_supervisor.token(),
        ));
    }

    /// Stops the server.
    ///
    /// The accept loop and the heartbeat stop at once. The instance is
    /// unregistered best-effort once the heartbeat task has finished, and
    /// connection handlers get `join_timeout` to finish their current
    /// request. Calling `stop` more than once is harmless.
    ///
    /// A heartbeat request already written to the socket when the stop
    /// arrives may still reach the registry after the unregister. The
    /// registry's sweep removes that instance once it expires.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.task_supervisor.stop();

        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(heartbeat) = heartbeat
            && let Err(e) = heartbeat.await
        {
            tracing::warn!("heartbeat task failed: {e}");
        }

        if let (Some(registry), Some(instance)) = (&self.registry, self.instance()) {
            match registry.unregister(&instance).await {
                Ok(_) => tracing::info!("unregistered {instance}"),
                Err(e) => tracing::warn!("unregister {instance} failed: {e}"),
            }
        }

        if !self.join_timeout(self.config.join_timeout).await {
            tracing::warn!(
                "connection handlers still running after {:?}",
                self.config.join_timeout
            );
        }
    }

    /// Waits for every task of the server to finish. Only returns after
    /// [`stop`](Self::stop).
    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }

    pub async fn join_timeout(&self, timeout: Duration) -> bool {
        self.task_supervisor.join_timeout(timeout).await
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("config", &self.config)
            .field("table", &self.table)
            .field("instance", &self.instance())
            .finish_non_exhaustive()
    }
}

/// Serves requests on one connection until the peer closes it, a frame
/// fails to parse, or the server stops between two requests.
async fn serve_connection(
    table: Arc<ServiceTable>,
    mut transport: Transport,
    peer: SocketAddr,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = stop.cancelled() => {
                tracing::debug!("stop serving {peer}");
                break;
            }
            frame = transport.recv_frame() => frame,
        };
        let bytes = match frame {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::info!("peer {peer} closed the connection");
                break;
            }
            Err(e) => {
                tracing::error!("recv from {peer} failed: {e}");
                break;
            }
        };
        let req = match Request::decode(&bytes) {
            Ok(req) => req,
            Err(e) => {
                tracing::error!("bad request from {peer}: {e}");
                break;
            }
        };

        tracing::info!("{peer} calls {}", req.method_name);
        let reply = table.dispatch(req).await;
        let sent = match reply.encode() {
            Ok(bytes) => transport.send_frame(&bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::error!("reply to {peer} failed: {e}");
            break;
        }
    }
}

/// Registers `instance` now and every `interval` after. Gives up after
/// `max_failures` consecutive failures without touching the listener.
async fn heartbeat_loop(
    registry: RegistryClient,
    instance: InstanceMeta,
    interval: Duration,
    max_failures: u32,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut registered = false;
    let mut failures = 0u32;
    loop {
        ticker.tick().await;
        match registry.register(&instance).await {
            Ok(instance) => {
                if registered {
                    tracing::debug!("heartbeat ok: {instance}");
                } else {
                    tracing::info!("registered {instance}");
                    registered = true;
                }
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                tracing::warn!("heartbeat for {instance} failed ({failures} in a row): {e}");
                if max_failures != 0 && failures >= max_failures {
                    tracing::error!("stop heartbeating after {failures} consecutive failures");
                    return;
                }
            }
        }
    }
}
