use clap::Parser;
use minirpc::{RegistryClient, RegistryClientConfig, RpcServer, ServerConfig, ServiceTable};
use minirpc_demo::register_demo_methods;
use serde_json::{Map, Value};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address, IPv4 or IPv6.
    #[arg(default_value = "0.0.0.0:8000")]
    pub addr: std::net::SocketAddr,

    /// Registry host.
    #[arg(long, default_value = "127.0.0.1")]
    pub registry_host: String,

    /// Registry port.
    #[arg(long, default_value = "8081")]
    pub registry_port: u16,

    /// Serve without registering.
    #[arg(long, default_value_t = false)]
    pub standalone: bool,

    /// Host announced to the registry.
    #[arg(long)]
    pub advertise_host: Option<String>,
}

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut table = ServiceTable::default();
    register_demo_methods(&mut table);

    let mut parameters = Map::new();
    parameters.insert("mode".into(), Value::from("development"));
    let config = ServerConfig {
        advertise_host: args.advertise_host.clone(),
        parameters,
        ..Default::default()
    };

    let server = if args.standalone {
        RpcServer::create(table, config)
    } else {
        let registry = RegistryClient::new(RegistryClientConfig::new(
            args.registry_host.clone(),
            args.registry_port,
        ));
        RpcServer::with_registry(table, config, registry)
    };

    let addr = match server.listen(args.addr).await {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("server failed to start: {e}");
            std::process::exit(1);
        }
    };
    let mut names: Vec<_> = server.table().method_names().cloned().collect();
    names.sort();
    tracing::info!("serving {names:?} on {addr}...");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("wait for ctrl-c failed: {e}");
    }
    server.stop().await;
}
