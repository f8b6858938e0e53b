use clap::{Parser, Subcommand};
use minirpc::{
    Transport,
    codec::binary::{self, BinaryReply},
};
use minirpc_demo::{BINARY_SCHEMAS, binary_divide};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve `divide` over the binary encoding.
    Serve {
        #[arg(default_value = "127.0.0.1:8000")]
        addr: std::net::SocketAddr,
    },
    /// Call `divide(num1, num2)` once.
    Call {
        num1: i32,
        /// Left off the wire when absent; the server then divides by 1.
        num2: Option<i32>,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value = "8000")]
        port: u16,
    },
}

async fn serve(addr: std::net::SocketAddr) -> minirpc::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| minirpc::Error::new(minirpc::ErrorKind::TcpBindFailed, e.to_string()))?;
    tracing::info!("serving binary divide on {addr}...");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                tokio::spawn(async move {
                    let transport = Transport::new(stream);
                    match binary::serve_connection(transport, BINARY_SCHEMAS, binary_divide).await {
                        Ok(()) => tracing::info!("peer {peer} closed the connection"),
                        Err(e) => tracing::error!("serve {peer} failed: {e}"),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn call(host: &str, port: u16, num1: i32, num2: Option<i32>) -> minirpc::Result<BinaryReply> {
    let mut transport = Transport::connect(host, port, Duration::from_secs(10)).await?;
    let reply = binary::call(&mut transport, &binary::divide_request(num1, num2)).await?;
    transport.close().await?;
    Ok(reply)
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
    let result = match args.command {
        Command::Serve { addr } => serve(addr).await,
        Command::Call {
            num1,
            num2,
            host,
            port,
        } => match call(&host, port, num1, num2).await {
            Ok(BinaryReply::Ok(value)) => {
                println!("{value}");
                Ok(())
            }
            Ok(BinaryReply::Err(msg)) => {
                eprintln!("divide failed: {msg}");
                Ok(())
            }
            Err(e) => Err(e),
        },
    };
    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
