#![forbid(unsafe_code)]

mod error;
pub use error::{Error, ErrorKind, Result};

mod task_supervisor;
pub use task_supervisor::TaskSupervisor;

mod transport;
pub use transport::Transport;

pub mod codec;

mod instance;
pub use instance::{InstanceKey, InstanceMeta};

mod service;
pub use service::{Args, LIST_METHODS, Method, ServiceTable, Signature};

pub mod registry;
pub use registry::{Registry, RegistryClient, RegistryClientConfig, RegistryConfig};

mod discovery;
pub use discovery::{LoadBalance, RandomBalance, RoundRobin, ServerAddr, ServerCache};

mod client;
pub use client::{ClientConfig, RpcClient};

mod server;
pub use server::{RpcServer, ServerConfig};
