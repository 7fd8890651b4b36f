//! Shared fixtures for feed integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use changes_feed::{
    FeedConfig, FeedError, FeedRequest, FeedResponse, FeedResult, FeedSignal, Heartbeat,
    ReconnectPolicy, Transport,
};
use futures_util::stream;
use tokio::sync::{broadcast, mpsc};

/// What the transport does for one request.
pub enum Step {
    /// Respond with a status and a body that ends after these chunks.
    Body(u16, Vec<&'static str>),
    /// Respond 200 with these chunks, then keep the body open forever.
    Open(Vec<&'static str>),
    /// Respond 200 with a body fed by the test.
    Channel(mpsc::UnboundedReceiver<FeedResult<Bytes>>),
    /// Fail before any response.
    Refuse(&'static str),
    /// Never answer.
    Hang,
}

/// Transport that plays back a script and records every request.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Step>>>,
    requests: Arc<Mutex<Vec<FeedRequest>>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into())),
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<FeedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// `since` sent with the n-th request.
    pub fn since_of(&self, n: usize) -> Option<String> {
        self.requests()[n]
            .url
            .query_pairs()
            .find(|(key, _)| key == "since")
            .map(|(_, value)| value.into_owned())
    }
}

fn chunks(parts: Vec<&'static str>) -> Vec<FeedResult<Bytes>> {
    parts
        .into_iter()
        .map(|part| Ok(Bytes::from_static(part.as_bytes())))
        .collect()
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: FeedRequest) -> FeedResult<FeedResponse> {
        self.requests.lock().unwrap().push(request);
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Hang);

        match step {
            Step::Body(status, parts) => Ok(FeedResponse::new(status, stream::iter(chunks(parts)))),
            Step::Open(parts) => Ok(FeedResponse::new(
                200,
                stream::StreamExt::chain(stream::iter(chunks(parts)), stream::pending()),
            )),
            Step::Channel(rx) => Ok(FeedResponse::new(
                200,
                stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }),
            )),
            Step::Refuse(reason) => Err(FeedError::ConnectionFailed(reason.into())),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Test config: fast backoff without jitter, one-second heartbeat.
pub fn config() -> FeedConfig {
    FeedConfig::new("http://db.test/mydb/")
        .with_heartbeat(Heartbeat::Millis(1_000))
        .with_inactivity_timeout(Duration::from_secs(10))
        .with_reconnect(
            ReconnectPolicy::new()
                .with_min_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(5))
                .with_retries(5)
                .with_jitter_enabled(false),
        )
}

/// Drain every signal currently buffered.
pub fn drain(signals: &mut broadcast::Receiver<FeedSignal>) -> Vec<FeedSignal> {
    let mut out = Vec::new();
    while let Ok(signal) = signals.try_recv() {
        out.push(signal);
    }
    out
}

/// Retry signals only.
pub fn retries(signals: &[FeedSignal]) -> Vec<(u32, Duration, String)> {
    signals
        .iter()
        .filter_map(|signal| match signal {
            FeedSignal::Retry {
                attempt,
                delay,
                reason,
            } => Some((*attempt, *delay, reason.clone())),
            _ => None,
        })
        .collect()
}
