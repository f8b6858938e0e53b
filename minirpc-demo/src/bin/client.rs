use clap::Parser;
use minirpc::{ClientConfig, RegistryClient, RegistryClientConfig, RpcClient};
use serde_json::Value;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Method to call.
    #[arg(default_value = "hi")]
    pub method: String,

    /// Positional arguments, each parsed as JSON or else taken as a string.
    #[arg(default_value = "accio")]
    pub args: Vec<String>,

    /// Call this server directly instead of asking the registry.
    #[arg(long)]
    pub addr: Option<String>,

    /// Registry host.
    #[arg(long, default_value = "127.0.0.1")]
    pub registry_host: String,

    /// Registry port.
    #[arg(long, default_value = "8081")]
    pub registry_port: u16,

    /// Number of calls.
    #[arg(short, long, default_value = "1")]
    pub times: usize,

    /// Enable stress testing.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "10")]
    pub secs: u64,

    /// The number of coroutines.
    #[arg(long, default_value = "8")]
    pub coroutines: usize,
}

#[derive(Default)]
struct State {
    total: AtomicUsize,
    fails: AtomicUsize,
}

fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host.to_string(), port.parse().ok()?))
}

fn build_client(args: &Args) -> RpcClient {
    if let Some(addr) = &args.addr {
        let Some((host, port)) = split_host_port(addr) else {
            tracing::error!("invalid server address: {addr}");
            std::process::exit(2);
        };
        RpcClient::direct(host, port, ClientConfig::default())
    } else {
        let registry = RegistryClient::new(RegistryClientConfig::new(
            args.registry_host.clone(),
            args.registry_port,
        ));
        match RpcClient::with_registry(registry, ClientConfig::default()) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("invalid client config: {e}");
                std::process::exit(2);
            }
        }
    }
}

async fn stress_test(args: Args, client: Arc<RpcClient>, call_args: Vec<Value>) {
    let state = Arc::new(State::default());
    let start_time = std::time::Instant::now();
    let mut tasks = vec![];
    for _ in 0..args.coroutines {
        let state = state.clone();
        let client = client.clone();
        let method = args.method.clone();
        let call_args = call_args.clone();
        tasks.push(tokio::spawn(async move {
            while start_time.elapsed().as_secs() < args.secs {
                let result = client.call(&method, call_args.clone()).await;
                state.total.fetch_add(1, Ordering::AcqRel);
                if result.is_err() {
                    state.fails.fetch_add(1, Ordering::AcqRel);
                }
            }
        }));
    }
    tokio::select! {
        _ = async {
            for task in tasks {
                let _ = task.await;
            }
        } => {
        }
        _ = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = state.total.swap(0, Ordering::AcqRel);
                let fails = state.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s");
            }
        } => {
        }
    }
}

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let call_args: Vec<Value> = args.args.iter().map(|a| parse_arg(a)).collect();
    let client = Arc::new(build_client(&args));

    if args.stress {
        stress_test(args, client.clone(), call_args).await;
    } else {
        for _ in 0..args.times {
            match client.call(&args.method, call_args.clone()).await {
                Ok(value) => println!("{value}"),
                Err(e) => eprintln!("{} failed: {e}", args.method),
            }
        }
    }
    client.stop();
}
