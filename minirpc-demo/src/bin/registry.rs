use clap::Parser;
use minirpc::{Registry, RegistryConfig};
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:8081")]
    pub addr: std::net::SocketAddr,

    /// Seconds between two health sweeps.
    #[arg(long, default_value = "5")]
    pub sweep_secs: u64,

    /// Seconds without a heartbeat before an instance is evicted.
    #[arg(long, default_value = "10")]
    pub expire_secs: u64,
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

    let config = RegistryConfig {
        sweep_interval: Duration::from_secs(args.sweep_secs),
        expire_threshold: Duration::from_secs(args.expire_secs),
        ..Default::default()
    };
    let registry = match Registry::create(config) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!("invalid registry config: {e}");
            std::process::exit(2);
        }
    };
    let addr = match registry.listen(args.addr).await {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("registry failed to start: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!("registry serving on {addr}...");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("wait for ctrl-c failed: {e}");
    }
    registry.stop();
    registry.join().await;
}
