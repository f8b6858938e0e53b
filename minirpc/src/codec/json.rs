use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, ErrorKind, Result};

/// A call envelope: `{"method_name", "method_args", "method_kwargs"}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Request {
    pub method_name: String,
    #[serde(default)]
    pub method_args: Vec<Value>,
    #[serde(default)]
    pub method_kwargs: Map<String, Value>,
}

/// A reply envelope: `{"res": ...}`, plus `"error"` when the call failed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Reply {
    #[serde(default)]
    pub res: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Request {
    pub fn new(method_name: impl Into<String>, method_args: Vec<Value>) -> Self {
        Self {
            method_name: method_name.into(),
            method_args,
            method_kwargs: Map::new(),
        }
    }

    #[must_use]
    pub fn with_kwargs(mut self, method_kwargs: Map<String, Value>) -> Self {
        self.method_kwargs = method_kwargs;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            Error::new(
                ErrorKind::TcpParseMsgFailed,
                format!("invalid request envelope: {e}"),
            )
        })
    }
}

impl Reply {
    #[must_use]
    pub fn ok(res: Value) -> Self {
        Self { res, error: None }
    }

    #[must_use]
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            res: Value::Null,
            error: Some(msg.into()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            Error::new(
                ErrorKind::TcpParseMsgFailed,
                format!("invalid reply envelope: {e}"),
            )
        })
    }

    /// The remote result, or a `RemoteError` carrying the remote message.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(msg) => Err(Error::new(ErrorKind::RemoteError, msg)),
            None => Ok(self.res),
        }
    }
}

impl From<Result<Value>> for Reply {
    fn from(value: Result<Value>) -> Self {
        match value {
            Ok(res) => Reply::ok(res),
            Err(err) => Reply::err(err.msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let req = Request::new("add", vec![json!(1), json!(2.5), json!("x")])
            .with_kwargs(json!({"c": 10, "nested": {"k": [1, 2]}}).as_object().unwrap().clone());
        let bytes = req.encode().unwrap();
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn test_request_wire_shape() {
        let req = Request::new("hi", vec![json!("accio")]);
        let value: Value = serde_json::from_slice(&req.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"method_name": "hi", "method_args": ["accio"], "method_kwargs": {}})
        );

        // args and kwargs may be omitted by hand-written clients.
        let req = Request::decode(br#"{"method_name": "list_methods"}"#).unwrap();
        assert!(req.method_args.is_empty());
        assert!(req.method_kwargs.is_empty());

        let err = Request::decode(br#"{"method_args": []}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TcpParseMsgFailed);
    }

    #[test]
    fn test_reply_round_trip() {
        let reply = Reply::ok(json!({"a": [1, null, true]}));
        let bytes = reply.encode().unwrap();
        assert_eq!(&bytes[..], br#"{"res":{"a":[1,null,true]}}"#);
        let back = Reply::decode(&bytes).unwrap();
        assert_eq!(back.into_result().unwrap(), json!({"a": [1, null, true]}));

        let reply = Reply::err("no such method: foo");
        let back = Reply::decode(&reply.encode().unwrap()).unwrap();
        let err = back.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::RemoteError);
        assert_eq!(err.msg, "no such method: foo");
    }

    #[test]
    fn test_reply_from_result() {
        let reply = Reply::from(Ok::<_, Error>(json!(3)));
        assert_eq!(reply, Reply::ok(json!(3)));

        let failed: Result<Value> = Err(Error::new(ErrorKind::MethodFailed, "division by zero".into()));
        let reply = Reply::from(failed);
        assert_eq!(reply.res, Value::Null);
        assert_eq!(reply.error.as_deref(), Some("division by zero"));
    }
}
