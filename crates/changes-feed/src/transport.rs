//! HTTP transport seam.
//!
//! The engine only needs "send this request, give me a status and a byte
//! stream". [`HttpTransport`] provides that over `reqwest`; tests substitute
//! scripted transports.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;
use url::Url;

use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::query::QueryParams;

/// Response body as a stream of chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = FeedResult<Bytes>> + Send>>;

/// TCP keep-alive probe interval for feed connections.
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// One outbound feed request.
#[derive(Debug, Clone)]
pub struct FeedRequest {
    /// GET, or POST when a body is sent.
    pub method: Method,
    /// Target URL, including the query string for GET.
    pub url: Url,
    /// Request headers.
    pub headers: HeaderMap,
    /// JSON body for POST.
    pub body: Option<Vec<u8>>,
}

impl FeedRequest {
    /// Assemble the request for the current parameters.
    ///
    /// GET carries the parameters in the query string. A document id list
    /// is POSTed as the body while the parameters stay in the query string.
    /// Forced POST mode targets the bare endpoint with the parameter map as
    /// the body.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the body cannot be encoded.
    pub fn build(config: &FeedConfig, query: &QueryParams) -> FeedResult<Self> {
        let mut url = config.changes_url()?;
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if !config.uses_post() {
            url.set_query(Some(&query.to_query_string()));
            return Ok(Self {
                method: Method::GET,
                url,
                headers,
                body: None,
            });
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = if let Some(ids) = config.doc_ids() {
            url.set_query(Some(&query.to_query_string()));
            serde_json::to_vec(ids)?
        } else {
            serde_json::to_vec(query.as_map())?
        };

        Ok(Self {
            method: Method::POST,
            url,
            headers,
            body: Some(body),
        })
    }

    /// Body decoded as JSON, if any.
    #[must_use]
    pub fn body_json(&self) -> Option<Value> {
        self.body
            .as_deref()
            .and_then(|body| serde_json::from_slice(body).ok())
    }
}

/// Response headers have arrived; the body is still streaming.
pub struct FeedResponse {
    /// HTTP status code.
    pub status: u16,
    /// Body chunks.
    pub body: ByteStream,
}

impl FeedResponse {
    /// Wrap a status and a body stream.
    pub fn new<S>(status: u16, body: S) -> Self
    where
        S: Stream<Item = FeedResult<Bytes>> + Send + 'static,
    {
        Self {
            status,
            body: Box::pin(body),
        }
    }
}

impl fmt::Debug for FeedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Capability that issues feed requests.
///
/// Dropping the returned response (or the pending future) must abort the
/// underlying request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and resolve once response headers are available.
    async fn send(&self, request: FeedRequest) -> FeedResult<FeedResponse>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a client honoring the configuration's timeout and TLS settings.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &FeedConfig) -> FeedResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .tcp_keepalive(TCP_KEEPALIVE)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;
        Ok(Self { client })
    }

    /// Reuse an existing client and its connection pool.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: FeedRequest) -> FeedResult<FeedResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FeedError::from));
        Ok(FeedResponse::new(status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Since;
    use crate::config::FeedFilter;
    use serde_json::json;

    #[test]
    fn get_request_carries_query() {
        let config = FeedConfig::new("http://db/mydb").with_include_docs(true);
        let query = QueryParams::from_config(&config, &Since::Number(3));
        let request = FeedRequest::build(&config, &query).unwrap();

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url.path(), "/mydb/_changes");
        let pairs: Vec<(String, String)> = request.url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("since".into(), "3".into())));
        assert!(pairs.contains(&("include_docs".into(), "true".into())));
        assert_eq!(request.headers[ACCEPT], "application/json");
        assert!(request.headers.get(CONTENT_TYPE).is_none());
        assert!(request.body.is_none());
    }

    #[test]
    fn doc_ids_post_the_id_list() {
        let config = FeedConfig::new("http://db/mydb/")
            .with_filter(FeedFilter::DocIds(vec!["a".into(), "b".into()]))
            .with_use_post(true);
        let query = QueryParams::from_config(&config, &Since::Number(5));
        let request = FeedRequest::build(&config, &query).unwrap();

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
        assert_eq!(request.body_json(), Some(json!(["a", "b"])));

        let pairs: Vec<(String, String)> = request.url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("since".into(), "5".into())));
        assert!(pairs.contains(&("feed".into(), "continuous".into())));
        assert!(pairs.contains(&("heartbeat".into(), "30000".into())));
        assert!(!pairs.iter().any(|(key, _)| key == "filter"));
    }

    #[test]
    fn forced_post_sends_query_as_body() {
        let config = FeedConfig::new("http://db/mydb/").with_use_post(true);
        let query = QueryParams::from_config(&config, &Since::Number(9));
        let request = FeedRequest::build(&config, &query).unwrap();

        assert_eq!(request.method, Method::POST);
        let body = request.body_json().unwrap();
        assert_eq!(body["since"], json!(9));
        assert_eq!(body["feed"], json!("continuous"));
    }

    #[test]
    fn http_transport_builds_from_config() {
        let config = FeedConfig::new("https://db/mydb/").with_verify_tls(false);
        assert!(HttpTransport::new(&config).is_ok());
    }
}
