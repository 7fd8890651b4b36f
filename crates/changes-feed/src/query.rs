//! Feed query parameters.
//!
//! Rebuilt from the configuration and the current cursor on every connect,
//! so a reconnect always resumes from the latest `since`.

use serde_json::{Map, Value};

use crate::change::Since;
use crate::config::{FeedConfig, FeedFilter};

/// Query parameters for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    params: Map<String, Value>,
}

impl QueryParams {
    /// Build parameters for the next request.
    ///
    /// Extra parameters from the configuration are laid down first and
    /// overwritten by recognized ones. Absent or `false` settings are
    /// omitted. A client-side filter strips `filter` and forces
    /// `include_docs`.
    #[must_use]
    pub fn from_config(config: &FeedConfig, since: &Since) -> Self {
        let mut params = config.query_params.clone();
        let client_filter = config.client_filter().is_some();

        if let Some(heartbeat) = config.heartbeat.as_duration() {
            params.insert("heartbeat".into(), Value::from(millis(heartbeat)));
        }
        params.insert("feed".into(), Value::from(config.feed.as_str()));
        if let Some(FeedFilter::Named(name)) = &config.filter {
            params.insert("filter".into(), Value::from(name.as_str()));
        }
        if config.include_docs || client_filter {
            params.insert("include_docs".into(), Value::Bool(true));
        }
        if let Some(view) = &config.view {
            params.insert("view".into(), Value::from(view.as_str()));
        }
        params.insert("style".into(), Value::from(config.style.as_str()));
        params.insert("since".into(), since.to_value());
        if let Some(timeout) = config.timeout {
            params.insert("timeout".into(), Value::from(millis(timeout)));
        }
        if let Some(limit) = config.limit {
            params.insert("limit".into(), Value::from(limit));
        }

        if client_filter {
            params.remove("filter");
        }

        Self { params }
    }

    /// Look up a parameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Whether a parameter is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// Parameters as a JSON object map.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Serialize as a URL query string.
    #[must_use]
    pub fn to_query_string(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.params {
            serializer.append_pair(key, &query_value(value));
        }
        serializer.finish()
    }
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
