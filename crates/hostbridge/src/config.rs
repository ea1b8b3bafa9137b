//! Bridge configuration.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::value::{Map, Value};
use crate::version::default_user_agent;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:57107/mupf/ws";
pub const DEFAULT_ROOT_NAME: &str = "window";

pub const URL_ENV: &str = "HOSTBRIDGE_URL";
pub const CLIENT_ID_ENV: &str = "HOSTBRIDGE_CLIENT_ID";
pub const USER_AGENT_ENV: &str = "HOSTBRIDGE_USER_AGENT";
pub const FEATURES_ENV: &str = "HOSTBRIDGE_FEATURES";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// WebSocket endpoint of the backend.
    pub url: String,
    /// Identifies this client to the backend; sent as the `cid` query parameter.
    pub client_id: String,
    /// Free-form environment descriptor returned by the bootstrap call.
    pub user_agent: String,
    /// Initial feature flags; the bootstrap call merges more in.
    pub features: Map,
    /// Display name of the root object (handle 0).
    pub root_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            client_id: generate_client_id(),
            user_agent: default_user_agent(),
            features: Map::new(),
            root_name: DEFAULT_ROOT_NAME.to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `HOSTBRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup(URL_ENV) {
            config.url = url;
        }
        if let Some(cid) = lookup(CLIENT_ID_ENV) {
            config.client_id = cid;
        }
        if let Some(ua) = lookup(USER_AGENT_ENV) {
            config.user_agent = ua;
        }
        if let Some(features) = lookup(FEATURES_ENV) {
            config.features = parse_features(&features);
        }
        config
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.features.insert(name.into(), value.into());
        self
    }

    pub fn with_root_name(mut self, name: impl Into<String>) -> Self {
        self.root_name = name.into();
        self
    }

    /// `url` with the client id appended as `cid`.
    pub fn connection_url(&self) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}cid={}", self.url, sep, self.client_id)
    }
}

/// Random URL-safe client id: unpadded base64 of a v4 UUID.
pub fn generate_client_id() -> String {
    URL_SAFE_NO_PAD.encode(uuid::Uuid::new_v4().as_bytes())
}

/// `"a,b,-c"` -> `{a: true, b: true, c: false}`.
fn parse_features(raw: &str) -> Map {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| match name.strip_prefix('-') {
            Some(disabled) => (disabled.to_string(), Value::Bool(false)),
            None => (name.to_string(), Value::Bool(true)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.root_name, "window");
        assert!(config.features.is_empty());
        assert!(config.user_agent.starts_with("hostbridge/"));
    }

    #[test]
    fn client_ids_are_urlsafe_and_unique() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert_eq!(a.len(), 22);
        assert!(
            a.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_ne!(a, b);
    }

    #[test]
    fn connection_url_appends_cid() {
        let config = BridgeConfig::new()
            .with_url("ws://localhost:1234/ws")
            .with_client_id("abc");
        assert_eq!(config.connection_url(), "ws://localhost:1234/ws?cid=abc");

        let config = config.with_url("ws://localhost:1234/ws?x=1");
        assert_eq!(config.connection_url(), "ws://localhost:1234/ws?x=1&cid=abc");
    }

    #[test]
    fn from_lookup_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (URL_ENV, "ws://example:1/ws"),
            (CLIENT_ID_ENV, "fixed"),
            (FEATURES_ENV, "friendly_obj_names, -tracing ,"),
        ]);
        let config = BridgeConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.url, "ws://example:1/ws");
        assert_eq!(config.client_id, "fixed");
        assert!(config.user_agent.starts_with("hostbridge/"));
        assert_eq!(config.features.get("friendly_obj_names"), Some(&Value::Bool(true)));
        assert_eq!(config.features.get("tracing"), Some(&Value::Bool(false)));
        assert_eq!(config.features.len(), 2);
    }

    #[test]
    fn builder_sets_features() {
        let config = BridgeConfig::new().with_feature("friendly_obj_names", true);
        assert_eq!(
            config.features.get("friendly_obj_names"),
            Some(&Value::Bool(true))
        );
    }
}
