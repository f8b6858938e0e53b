use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
};
use serde::Serialize;

use super::RegistryStore;
use crate::instance::InstanceMeta;

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut rsp = Response::new(Full::new(Bytes::from(body)));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    rsp
}

fn ok<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn error(status: StatusCode, msg: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": msg }).to_string();
    json_response(status, body.into_bytes())
}

fn proto_param(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "proto")
        .map(|(_, value)| value.into_owned())
}

async fn read_instance(req: Request<Incoming>) -> Result<InstanceMeta, Response<Full<Bytes>>> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| error(StatusCode::BAD_REQUEST, &e.to_string()))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| error(StatusCode::BAD_REQUEST, &format!("invalid instance: {e}")))
}

/// Routes one registry HTTP request. Every outcome, including a malformed
/// body or an unknown route, is a JSON response.
pub async fn handle_request(
    store: Arc<RegistryStore>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    tracing::debug!("registry request: {method} {}", req.uri());

    let rsp = match (method, path.as_str()) {
        (Method::POST, "/register") => match read_instance(req).await {
            Ok(instance) => ok(&store.register(instance)),
            Err(rsp) => rsp,
        },
        (Method::POST, "/unregister") => match read_instance(req).await {
            Ok(instance) => ok(&store.unregister(instance)),
            Err(rsp) => rsp,
        },
        (Method::GET, "/findAllInstances") => {
            let protocol = proto_param(req.uri().query());
            ok(&store.find_instances_by_protocol(protocol.as_deref()))
        }
        _ => error(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(rsp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_param() {
        assert_eq!(proto_param(Some("proto=json")).as_deref(), Some("json"));
        assert_eq!(
            proto_param(Some("x=1&proto=my%20proto")).as_deref(),
            Some("my proto")
        );
        assert_eq!(proto_param(Some("x=1")), None);
        assert_eq!(proto_param(None), None);
    }

    #[test]
    fn test_error_body() {
        let rsp = error(StatusCode::NOT_FOUND, "Not Found");
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
        assert_eq!(rsp.headers()[header::CONTENT_TYPE], "application/json");
    }
}
