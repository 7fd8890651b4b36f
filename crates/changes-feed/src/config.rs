//! Feed configuration.
//!
//! [`FeedConfig`] is assembled with builder methods or converted from the
//! serde-friendly [`FeedOptions`] (millisecond durations, every field
//! optional) so a feed can be described in a JSON or TOML document.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::change::Since;
use crate::error::{FeedError, FeedResult};
use crate::retry::ReconnectPolicy;

/// Heartbeat interval used when heartbeats are enabled without a value.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Grace added to the heartbeat interval while waiting for response headers.
pub const INITIAL_RESPONSE_MARGIN: Duration = Duration::from_secs(5);

/// Default per-request transport timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Default silence tolerated on an open response before reconnecting.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default number of undelivered records buffered for the consumer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 16;

/// Default feed endpoint, relative to the database address.
pub const DEFAULT_ENDPOINT: &str = "_changes";

/// Feed mode requested from the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    /// Keep the response open and stream every change.
    #[default]
    Continuous,
    /// Hold the request until at least one change exists.
    Longpoll,
    /// Return the current batch and close.
    Normal,
}

impl FeedMode {
    /// Wire value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::Longpoll => "longpoll",
            Self::Normal => "normal",
        }
    }
}

impl fmt::Display for FeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which revisions each record lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    /// Winning revision only.
    #[default]
    MainOnly,
    /// All leaf revisions.
    AllDocs,
}

impl Style {
    /// Wire value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MainOnly => "main_only",
            Self::AllDocs => "all_docs",
        }
    }
}

/// Heartbeat setting: an explicit interval in milliseconds or a toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Heartbeat {
    /// Explicit interval in milliseconds. `0` disables heartbeats.
    Millis(u64),
    /// `true` uses [`DEFAULT_HEARTBEAT`], `false` disables heartbeats.
    Enabled(bool),
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::Enabled(true)
    }
}

impl Heartbeat {
    /// Heartbeat from a duration.
    #[must_use]
    pub fn interval(interval: Duration) -> Self {
        Self::Millis(duration_ms(interval))
    }

    /// Effective interval, `None` when disabled.
    #[must_use]
    pub const fn as_duration(self) -> Option<Duration> {
        match self {
            Self::Millis(0) | Self::Enabled(false) => None,
            Self::Millis(ms) => Some(Duration::from_millis(ms)),
            Self::Enabled(true) => Some(DEFAULT_HEARTBEAT),
        }
    }
}

/// Caller-supplied predicate evaluated against `(doc, {"query": ...})`.
pub type ClientFilter = Arc<dyn Fn(&Value, &Value) -> anyhow::Result<bool> + Send + Sync>;

/// How records are filtered.
#[derive(Clone)]
pub enum FeedFilter {
    /// Server-side filter function, sent as `filter=<name>`.
    Named(String),
    /// Static list of document ids, sent as a POST body.
    DocIds(Vec<String>),
    /// Predicate applied locally to every record.
    Client(ClientFilter),
}

impl FeedFilter {
    /// Build a client-side filter from a closure.
    pub fn client<F>(predicate: F) -> Self
    where
        F: Fn(&Value, &Value) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::Client(Arc::new(predicate))
    }
}

impl fmt::Debug for FeedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Self::DocIds(ids) => f.debug_tuple("DocIds").field(ids).finish(),
            Self::Client(_) => f.write_str("Client(..)"),
        }
    }
}

/// Complete configuration for one feed.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Database address, always ending in `/`.
    pub address: String,
    /// Feed endpoint joined onto the address.
    pub endpoint: String,
    /// Feed mode.
    pub feed: FeedMode,
    /// Revision style.
    pub style: Style,
    /// Request full documents.
    pub include_docs: bool,
    /// Initial cursor.
    pub since: Since,
    /// Heartbeat setting.
    pub heartbeat: Heartbeat,
    /// Server-side `timeout` parameter.
    pub timeout: Option<Duration>,
    /// Transport timeout for establishing each request.
    pub request_timeout: Duration,
    /// Silence tolerated on an open response.
    pub inactivity_timeout: Duration,
    /// Reconnect backoff policy.
    pub reconnect: ReconnectPolicy,
    /// Optional filter.
    pub filter: Option<FeedFilter>,
    /// View used by the `_view` filter.
    pub view: Option<String>,
    /// Maximum number of records per response.
    pub limit: Option<u64>,
    /// Extra query parameters, overridden by recognized ones.
    pub query_params: Map<String, Value>,
    /// Force POST with the query map as the body.
    pub use_post: bool,
    /// Verify TLS certificates.
    pub verify_tls: bool,
    /// Consumer buffer capacity in records.
    pub buffer_capacity: usize,
}

impl FeedConfig {
    /// Configuration with defaults for the given database address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: normalize_address(address.into()),
            endpoint: DEFAULT_ENDPOINT.into(),
            feed: FeedMode::default(),
            style: Style::default(),
            include_docs: false,
            since: Since::default(),
            heartbeat: Heartbeat::default(),
            timeout: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            filter: None,
            view: None,
            limit: None,
            query_params: Map::new(),
            use_post: false,
            verify_tls: true,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Build from deserialized options.
    ///
    /// # Errors
    /// Returns `FeedError::Config` if the address is missing.
    pub fn from_options(options: FeedOptions) -> FeedResult<Self> {
        let address = options
            .db
            .filter(|db| !db.is_empty())
            .ok_or_else(|| FeedError::Config("a database address is required".into()))?;

        let mut config = Self::new(address);
        if let Some(endpoint) = options.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(feed) = options.feed {
            config.feed = feed;
        }
        if let Some(style) = options.style {
            config.style = style;
        }
        if let Some(since) = options.since {
            config.since = since;
        }
        if let Some(heartbeat) = options.heartbeat {
            config.heartbeat = heartbeat;
        }
        config.include_docs = options.include_docs;
        config.timeout = options.timeout.map(Duration::from_millis);
        if let Some(ms) = options.request_timeout {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = options.inactivity_ms {
            config.inactivity_timeout = Duration::from_millis(ms);
        }
        if let Some(reconnect) = options.reconnect {
            config.reconnect = reconnect;
        }
        config.filter = options.filter.map(|filter| match filter {
            FilterOption::Name(name) => FeedFilter::Named(name),
            FilterOption::DocIds(ids) => FeedFilter::DocIds(ids),
        });
        config.view = options.view;
        config.limit = options.limit;
        config.query_params = options.query_params;
        config.use_post = options.use_post;
        if let Some(strict) = options.strict_ssl {
            config.verify_tls = strict;
        }
        if let Some(capacity) = options.high_water_mark {
            config.buffer_capacity = capacity;
        }
        Ok(config)
    }

    /// Set the feed mode.
    #[must_use]
    pub const fn with_feed(mut self, feed: FeedMode) -> Self {
        self.feed = feed;
        self
    }

    /// Set the revision style.
    #[must_use]
    pub const fn with_style(mut self, style: Style) -> Self {
        self.style = style;
        self
    }

    /// Request full documents.
    #[must_use]
    pub const fn with_include_docs(mut self, include_docs: bool) -> Self {
        self.include_docs = include_docs;
        self
    }

    /// Set the starting cursor.
    #[must_use]
    pub fn with_since(mut self, since: impl Into<Since>) -> Self {
        self.since = since.into();
        self
    }

    /// Set the heartbeat.
    #[must_use]
    pub const fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the server-side `timeout` parameter.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the per-request transport timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the inactivity timeout.
    #[must_use]
    pub const fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub const fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Set a filter.
    #[must_use]
    pub fn with_filter(mut self, filter: FeedFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set the view name.
    #[must_use]
    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.view = Some(view.into());
        self
    }

    /// Set the result limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Add an extra query parameter.
    #[must_use]
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    /// Force POST requests.
    #[must_use]
    pub const fn with_use_post(mut self, use_post: bool) -> Self {
        self.use_post = use_post;
        self
    }

    /// Toggle TLS certificate verification.
    #[must_use]
    pub const fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Set the consumer buffer capacity.
    #[must_use]
    pub const fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `FeedError::Config` describing the first invalid setting.
    pub fn validate(&self) -> FeedResult<()> {
        self.changes_url()?;

        if self.buffer_capacity == 0 {
            return Err(FeedError::Config("buffer capacity must be at least 1".into()));
        }

        let policy = &self.reconnect;
        if policy.min_delay.is_zero() || policy.max_delay.is_zero() {
            return Err(FeedError::Config("reconnect delays must be non-zero".into()));
        }
        if policy.min_delay > policy.max_delay {
            return Err(FeedError::Config(format!(
                "reconnect min delay {:?} exceeds max delay {:?}",
                policy.min_delay, policy.max_delay
            )));
        }

        if let Some(heartbeat) = self.heartbeat.as_duration() {
            if heartbeat >= self.inactivity_timeout {
                return Err(FeedError::Config(format!(
                    "heartbeat {heartbeat:?} must be shorter than inactivity timeout {:?}",
                    self.inactivity_timeout
                )));
            }
        }

        Ok(())
    }

    /// Absolute feed URL without a query string.
    ///
    /// # Errors
    /// Returns `FeedError::Config` if the address or endpoint is not a valid URL.
    pub fn changes_url(&self) -> FeedResult<Url> {
        let base = Url::parse(&self.address)
            .map_err(|e| FeedError::Config(format!("invalid address {}: {e}", self.address)))?;
        base.join(&self.endpoint)
            .map_err(|e| FeedError::Config(format!("invalid endpoint {}: {e}", self.endpoint)))
    }

    /// How long to wait for response headers.
    #[must_use]
    pub fn initial_response_timeout(&self) -> Duration {
        self.heartbeat.as_duration().unwrap_or(DEFAULT_HEARTBEAT) + INITIAL_RESPONSE_MARGIN
    }

    /// Client-side predicate, if configured.
    #[must_use]
    pub fn client_filter(&self) -> Option<&ClientFilter> {
        match &self.filter {
            Some(FeedFilter::Client(predicate)) => Some(predicate),
            _ => None,
        }
    }

    /// Static document ids, if configured.
    #[must_use]
    pub fn doc_ids(&self) -> Option<&[String]> {
        match &self.filter {
            Some(FeedFilter::DocIds(ids)) => Some(ids),
            _ => None,
        }
    }

    /// Whether requests go out as POST.
    #[must_use]
    pub fn uses_post(&self) -> bool {
        self.use_post || self.doc_ids().is_some()
    }
}

fn normalize_address(mut address: String) -> String {
    if !address.is_empty() && !address.ends_with('/') {
        address.push('/');
    }
    address
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Filter as it appears in a configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterOption {
    /// Server-side filter name.
    Name(String),
    /// Static document ids.
    DocIds(Vec<String>),
}

/// Deserializable feed options. Durations are milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedOptions {
    /// Database address.
    pub db: Option<String>,
    /// Feed endpoint.
    pub endpoint: Option<String>,
    /// Feed mode.
    pub feed: Option<FeedMode>,
    /// Revision style.
    pub style: Option<Style>,
    /// Starting cursor.
    pub since: Option<Since>,
    /// Heartbeat interval or toggle.
    pub heartbeat: Option<Heartbeat>,
    /// Request full documents.
    pub include_docs: bool,
    /// Server-side timeout parameter.
    pub timeout: Option<u64>,
    /// Per-request transport timeout.
    pub request_timeout: Option<u64>,
    /// Inactivity timeout.
    pub inactivity_ms: Option<u64>,
    /// Reconnect policy.
    pub reconnect: Option<ReconnectPolicy>,
    /// Filter name or document id list.
    pub filter: Option<FilterOption>,
    /// View name.
    pub view: Option<String>,
    /// Result limit.
    pub limit: Option<u64>,
    /// Extra query parameters.
    pub query_params: Map<String, Value>,
    /// Force POST.
    pub use_post: bool,
    /// Verify TLS certificates.
    pub strict_ssl: Option<bool>,
    /// Consumer buffer capacity.
    pub high_water_mark: Option<usize>,
}

impl FeedOptions {
    /// Parse options from a JSON value.
    ///
    /// # Errors
    /// Returns `FeedError::Config` if the value does not describe valid options.
    pub fn from_json(params: &Value) -> FeedResult<Self> {
        serde_json::from_value(params.clone())
            .map_err(|e| FeedError::Config(format!("invalid feed options: {e}")))
    }
}
