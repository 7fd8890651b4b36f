//! Reconnecting change feed.
//!
//! [`ChangesFeed::start`] spawns one engine task per feed. The task owns the
//! single in-flight request, decodes its body, hands records to a bounded
//! channel and, whenever the connection fails, tears it down and reconnects
//! from the latest cursor with exponential backoff.
//!
//! Backpressure is the channel itself: when the consumer's buffer is full
//! the engine stops polling the response body (so nothing more is read off
//! the socket) until a slot frees up.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{Stream, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::change::{Change, Since};
use crate::config::FeedConfig;
use crate::decoder::{Line, LineDecoder};
use crate::dispatch::{Dispatch, Dispatcher};
use crate::error::{FeedError, FeedResult};
use crate::query::QueryParams;
use crate::retry::RetryState;
use crate::transport::{ByteStream, FeedRequest, HttpTransport, Transport};

/// Buffered notifications per subscriber before the oldest are dropped.
const SIGNAL_CAPACITY: usize = 64;

/// Stand-in deadline for timeouts too large to represent as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Out-of-band notifications about the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    /// Server heartbeat received.
    Heartbeat,
    /// Connection failed; reconnecting after `delay`.
    Retry {
        /// Retry number within the current failure episode, from 1.
        attempt: u32,
        /// Backoff before the new request.
        delay: Duration,
        /// What went wrong.
        reason: String,
    },
    /// Consumer buffer full; transport paused.
    Pause,
    /// Consumer caught up; transport resumed.
    Resume,
    /// No further records will be produced.
    End,
}

/// Lifecycle of the engine's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started.
    Idle,
    /// Request sent, waiting for headers.
    Connecting,
    /// Reading the response body.
    Streaming,
    /// Tearing down a failed connection.
    Closing,
    /// Stopped for good.
    Terminated,
}

/// A configured feed, not yet connected.
pub struct ChangesFeed {
    config: FeedConfig,
    transport: Arc<dyn Transport>,
    signals: broadcast::Sender<FeedSignal>,
}

impl ChangesFeed {
    /// Create a feed using the HTTP transport.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: FeedConfig) -> FeedResult<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::with_transport(config, transport)
    }

    /// Create a feed over a caller-supplied transport.
    ///
    /// # Errors
    /// Returns `FeedError::Config` if the configuration is invalid.
    pub fn with_transport(config: FeedConfig, transport: Arc<dyn Transport>) -> FeedResult<Self> {
        config.validate()?;
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Ok(Self {
            config,
            transport,
            signals,
        })
    }

    /// Subscribe to notifications. Subscribe before [`start`](Self::start)
    /// to observe the first connection.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FeedSignal> {
        self.signals.subscribe()
    }

    /// Spawn the engine and return the record stream.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(self) -> ChangesStream {
        let (changes_tx, changes_rx) = mpsc::channel(self.config.buffer_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cursor_tx, cursor_rx) = watch::channel(self.config.since.clone());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let engine = Engine {
            dispatcher: Dispatcher::new(
                self.config.since.clone(),
                self.config.client_filter().cloned(),
            ),
            retry: RetryState::new(),
            transport: self.transport,
            changes: changes_tx,
            signals: self.signals.clone(),
            shutdown: shutdown_rx,
            cursor: cursor_tx,
            state: state_tx,
            config: self.config,
        };
        let task = tokio::spawn(engine.run());

        ChangesStream {
            changes: changes_rx,
            shutdown: shutdown_tx,
            cursor: cursor_rx,
            state: state_rx,
            signals: self.signals,
            task,
            destroyed: false,
        }
    }
}

/// Running feed. Yields records in server order; a terminal error, if
/// any, is the last item before the stream ends.
///
/// Dropping the stream destroys the feed.
pub struct ChangesStream {
    changes: mpsc::Receiver<FeedResult<Change>>,
    shutdown: watch::Sender<bool>,
    cursor: watch::Receiver<Since>,
    state: watch::Receiver<ConnectionState>,
    signals: broadcast::Sender<FeedSignal>,
    task: JoinHandle<()>,
    destroyed: bool,
}

impl ChangesStream {
    /// Subscribe to notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FeedSignal> {
        self.signals.subscribe()
    }

    /// Latest cursor reported by the server.
    ///
    /// Numeric cursors only move forward. Opaque tokens carry no order, so
    /// any token the server reports that differs from the current one
    /// replaces it, as does a switch between numeric and token form.
    #[must_use]
    pub fn since(&self) -> Since {
        self.cursor.borrow().clone()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether [`destroy`](Self::destroy) was called.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Stop the feed. Aborts the in-flight request, cancels any pending
    /// retry and ends the stream. Calling it again does nothing.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        debug!("Destroying change feed");
        self.destroyed = true;
        self.shutdown.send_replace(true);
        self.changes.close();
    }

    /// Wait until the engine has stopped.
    pub async fn terminated(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Terminated)
            .await;
    }

    /// Whether the engine task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Stream for ChangesStream {
    type Item = FeedResult<Change>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.destroyed {
            return Poll::Ready(None);
        }
        self.changes.poll_recv(cx)
    }
}

impl Drop for ChangesStream {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// How one connection ended.
enum Outcome {
    /// A final-sequence record was delivered.
    Completed,
    /// `destroy` was called.
    Destroyed,
    /// The consumer dropped the record channel.
    ConsumerGone,
    /// The connection failed.
    Failed(FeedError),
}

struct Engine {
    config: FeedConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    retry: RetryState,
    changes: mpsc::Sender<FeedResult<Change>>,
    signals: broadcast::Sender<FeedSignal>,
    shutdown: watch::Receiver<bool>,
    cursor: watch::Sender<Since>,
    state: watch::Sender<ConnectionState>,
}

impl Engine {
    async fn run(mut self) {
        loop {
            match self.connect_and_stream().await {
                Outcome::Failed(err) if err.is_retryable() => {
                    let Some(delay) = self.retry.record_failure(&self.config.reconnect) else {
                        warn!(
                            attempts = self.retry.attempts(),
                            error = %err,
                            "Reconnect budget exhausted"
                        );
                        let attempts = self.retry.attempts();
                        self.fail(FeedError::ReconnectLimitExceeded {
                            attempts,
                            last: Box::new(err),
                        })
                        .await;
                        break;
                    };

                    let attempt = self.retry.attempts();
                    info!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        since = %self.dispatcher.since(),
                        error = %err,
                        "Reconnecting to feed"
                    );
                    self.signal(FeedSignal::Retry {
                        attempt,
                        delay,
                        reason: err.to_string(),
                    });
                    if !self.backoff(delay).await {
                        break;
                    }
                }
                Outcome::Failed(err) => {
                    warn!(error = %err, "Feed failed");
                    self.fail(err).await;
                    break;
                }
                Outcome::Completed => {
                    info!(since = %self.dispatcher.since(), "Feed completed");
                    break;
                }
                Outcome::Destroyed => {
                    debug!("Feed destroyed");
                    break;
                }
                Outcome::ConsumerGone => {
                    debug!("Consumer dropped, stopping feed");
                    break;
                }
            }
        }

        self.set_state(ConnectionState::Terminated);
        self.signal(FeedSignal::End);
    }

    async fn connect_and_stream(&mut self) -> Outcome {
        self.set_state(ConnectionState::Connecting);

        let query = QueryParams::from_config(&self.config, self.dispatcher.since());
        let request = match FeedRequest::build(&self.config, &query) {
            Ok(request) => request,
            Err(err) => return Outcome::Failed(err),
        };
        debug!(method = %request.method, url = %request.url, "Requesting feed");

        let initial = self.config.initial_response_timeout();
        let transport = Arc::clone(&self.transport);
        let response = tokio::select! {
            biased;
            () = cancelled(&mut self.shutdown) => return Outcome::Destroyed,
            response = tokio::time::timeout(initial, transport.send(request)) => response,
        };

        let response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Outcome::Failed(err),
            Err(_) => return Outcome::Failed(FeedError::Timeout(initial)),
        };
        if response.status != 200 {
            return Outcome::Failed(FeedError::Status {
                status: response.status,
            });
        }

        self.dispatcher.set_query(&query);
        self.retry.reset();
        self.set_state(ConnectionState::Streaming);
        info!(since = %self.dispatcher.since(), "Streaming changes");

        self.stream_body(response.body).await
    }

    async fn stream_body(&mut self, mut body: ByteStream) -> Outcome {
        let inactivity = self.config.inactivity_timeout;
        let mut decoder = LineDecoder::new();
        let idle = tokio::time::sleep_until(deadline(inactivity));
        tokio::pin!(idle);

        let failure = loop {
            let chunk = tokio::select! {
                biased;
                () = cancelled(&mut self.shutdown) => return Outcome::Destroyed,
                () = &mut idle => break FeedError::Inactive(inactivity),
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for line in decoder.push(&bytes) {
                        if let Some(outcome) = self.handle(line).await {
                            return outcome;
                        }
                        idle.as_mut().reset(deadline(inactivity));
                    }
                }
                Some(Err(err)) => break err,
                None => break FeedError::Disconnected,
            }
        };

        self.set_state(ConnectionState::Closing);
        drop(body);
        warn!(error = %failure, "Feed connection lost");

        if let Some(value) = decoder.finish() {
            debug!("Salvaged unterminated trailing record");
            if let Some(outcome) = self.handle(Line::Value(value)).await {
                return outcome;
            }
        }

        Outcome::Failed(failure)
    }

    async fn handle(&mut self, line: Line) -> Option<Outcome> {
        let dispatch = match self.dispatcher.dispatch(line) {
            Ok(dispatch) => dispatch,
            Err(err) => return Some(Outcome::Failed(err)),
        };

        let since = self.dispatcher.since();
        self.cursor.send_if_modified(|current| {
            if current == since {
                false
            } else {
                current.clone_from(since);
                true
            }
        });

        match dispatch {
            Dispatch::Heartbeat => {
                debug!("Heartbeat");
                self.signal(FeedSignal::Heartbeat);
                None
            }
            Dispatch::Skip { last } => last.then_some(Outcome::Completed),
            Dispatch::Deliver(change) => {
                let last = change.is_final();
                if let Some(outcome) = self.deliver(change).await {
                    return Some(outcome);
                }
                last.then_some(Outcome::Completed)
            }
        }
    }

    async fn deliver(&mut self, change: Change) -> Option<Outcome> {
        let item = match self.changes.try_send(Ok(change)) {
            Ok(()) => return None,
            Err(TrySendError::Closed(_)) => return Some(Outcome::ConsumerGone),
            Err(TrySendError::Full(item)) => item,
        };

        debug!("Consumer buffer full, pausing feed");
        self.signal(FeedSignal::Pause);

        let permit = tokio::select! {
            biased;
            () = cancelled(&mut self.shutdown) => return Some(Outcome::Destroyed),
            permit = self.changes.reserve() => permit,
        };
        let Ok(permit) = permit else {
            return Some(Outcome::ConsumerGone);
        };

        debug!("Consumer ready, resuming feed");
        self.signal(FeedSignal::Resume);
        permit.send(item);
        None
    }

    async fn fail(&mut self, err: FeedError) {
        tokio::select! {
            biased;
            () = cancelled(&mut self.shutdown) => {}
            _ = self.changes.send(Err(err)) => {}
        }
    }

    async fn backoff(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            () = cancelled(&mut self.shutdown) => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Feed state changed");
        }
    }

    fn signal(&self, signal: FeedSignal) {
        let _ = self.signals.send(signal);
    }
}

/// `after` from now, saturating at a far-future instant.
fn deadline(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Resolves once the feed is destroyed or its handle dropped.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|destroyed| *destroyed).await;
}
