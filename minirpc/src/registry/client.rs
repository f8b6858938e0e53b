use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, header};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::net::TcpStream;

use crate::{
    error::{Error, ErrorKind, Result},
    instance::InstanceMeta,
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct RegistryClientConfig {
    #[serde_inline_default("127.0.0.1".to_string())]
    pub registry_host: String,
    #[serde_inline_default(8081)]
    pub registry_port: u16,
    /// Bound on connecting to the registry and waiting for its answer.
    #[serde_inline_default(Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl RegistryClientConfig {
    #[must_use]
    pub fn new(registry_host: impl Into<String>, registry_port: u16) -> Self {
        Self {
            registry_host: registry_host.into(),
            registry_port,
            ..Default::default()
        }
    }
}

/// HTTP client for the registry's register / unregister / find routes.
///
/// Every request uses its own HTTP/1 connection.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    config: RegistryClientConfig,
}

impl RegistryClient {
    #[must_use]
    pub fn new(config: RegistryClientConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &RegistryClientConfig {
        &self.config
    }

    /// Registers `instance`; also serves as the heartbeat.
    pub async fn register(&self, instance: &InstanceMeta) -> Result<InstanceMeta> {
        let body = serde_json::to_vec(instance)?;
        let bytes = self.request(Method::POST, "/register", body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn unregister(&self, instance: &InstanceMeta) -> Result<InstanceMeta> {
        let body = serde_json::to_vec(instance)?;
        let bytes = self.request(Method::POST, "/unregister", body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn find_instances(&self, protocol: &str) -> Result<Vec<InstanceMeta>> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("proto", protocol)
            .finish();
        let path = format!("/findAllInstances?{query}");
        let bytes = self.request(Method::GET, &path, Vec::new()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn request(&self, method: Method, path: &str, body: Vec<u8>) -> Result<Bytes> {
        let host = &self.config.registry_host;
        let port = self.config.registry_port;
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.send_request(method, path, body)).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(
                ErrorKind::Timeout,
                format!("registry {host}:{port} did not answer {path} within {timeout:?}"),
            )),
        }
    }

    async fn send_request(&self, method: Method, path: &str, body: Vec<u8>) -> Result<Bytes> {
        let host = &self.config.registry_host;
        let port = self.config.registry_port;

        // 1. establish connection.
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, format!("{host}:{port}: {e}")))?;
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("registry connection closed with error: {e}");
            }
        });

        // 2. build request.
        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, authority)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;

        // 3. send request.
        let rsp = sender.send_request(req).await?;

        // 4. collect body bytes.
        let status = rsp.status();
        let bytes = rsp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::new(ErrorKind::HttpWaitRspFailed, e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(Error::new(
                ErrorKind::HttpStatus(status.as_u16()),
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
        Ok(bytes)
    }
}
