use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity of an instance: two instances with the same key are the same
/// logical instance whatever their status or parameters say.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// One network-addressable copy of a service as stored by the registry.
///
/// Equality and hashing only look at `(protocol, host, port)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceMeta {
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// `true` once registered, `false` once unregistered, `null` before.
    pub status: Option<bool>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl InstanceMeta {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: Some(protocol.into()),
            host: Some(host.into()),
            port: Some(port),
            status: None,
            parameters: Map::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            protocol: self.protocol.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Merges `parameters` into the instance's own, later keys win.
    #[must_use]
    pub fn add_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.status == Some(true)
    }

    pub fn set_status(&mut self, alive: bool) {
        self.status = Some(alive);
    }

    /// The dialable `(host, port)` pair, if both are known.
    #[must_use]
    pub fn address(&self) -> Option<(String, u16)> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        }
    }
}

impl PartialEq for InstanceMeta {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.host == other.host && self.port == other.port
    }
}

impl Eq for InstanceMeta {}

impl Hash for InstanceMeta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl std::fmt::Display for InstanceMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "InstanceMeta(protocol={:?}, host={:?}, port={:?}, status={:?}, parameters={})",
            self.protocol,
            self.host,
            self.port,
            self.status,
            Value::Object(self.parameters.clone())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_identity_ignores_status_and_parameters() {
        let a = InstanceMeta::new("json", "127.0.0.1", 9999);
        let mut b = InstanceMeta::new("json", "127.0.0.1", 9999)
            .add_parameters(json!({"mode": "development"}).as_object().unwrap().clone());
        b.set_status(true);
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);

        let c = InstanceMeta::new("json", "127.0.0.1", 9998);
        assert!(!set.contains(&c));
    }

    #[test]
    fn test_json_shape() {
        let instance = InstanceMeta::new("json", "::1", 8000);
        let value = serde_json::to_value(&instance).unwrap();
        assert_eq!(
            value,
            json!({
                "protocol": "json",
                "host": "::1",
                "port": 8000,
                "status": null,
                "parameters": {}
            })
        );

        // nulls and a missing parameters object are accepted.
        let instance: InstanceMeta =
            serde_json::from_value(json!({"protocol": null, "host": "h", "port": 1, "status": true}))
                .unwrap();
        assert!(instance.protocol.is_none());
        assert!(instance.is_alive());
        assert!(instance.parameters.is_empty());
        assert_eq!(instance.address(), Some(("h".to_string(), 1)));
    }

    #[test]
    fn test_add_parameters_merges() {
        let instance = InstanceMeta::new("json", "127.0.0.1", 1)
            .add_parameters(json!({"key": "value"}).as_object().unwrap().clone())
            .add_parameters(json!({"name": "accio", "key": "other"}).as_object().unwrap().clone());
        assert_eq!(
            Value::Object(instance.parameters),
            json!({"key": "other", "name": "accio"})
        );
    }
}
