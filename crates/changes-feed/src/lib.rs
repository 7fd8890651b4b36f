//! Changes Feed
//!
//! A long-lived client for a database's continuous `_changes` feed over
//! HTTP. Records arrive as a backpressure-aware [`futures_util::Stream`];
//! dropped connections, stalled responses and server restarts are absorbed
//! by reconnecting from the last seen `since` cursor with exponential
//! backoff.
//!
//! ```no_run
//! use changes_feed::{ChangesFeed, FeedConfig};
//! use futures_util::StreamExt;
//!
//! # async fn run() -> changes_feed::FeedResult<()> {
//! let config = FeedConfig::new("http://localhost:5984/mydb").with_include_docs(true);
//! let mut changes = ChangesFeed::new(config)?.start();
//! while let Some(change) = changes.next().await {
//!     let change = change?;
//!     println!("{:?} {:?}", change.seq(), change.id());
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod change;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod query;
pub mod retry;
pub mod stream;
pub mod transport;

pub use change::{Change, Since};
pub use config::{FeedConfig, FeedFilter, FeedMode, FeedOptions, Heartbeat, Style};
pub use error::{FeedError, FeedResult};
pub use retry::{ReconnectPolicy, RetryState};
pub use stream::{ChangesFeed, ChangesStream, ConnectionState, FeedSignal};
pub use transport::{ByteStream, FeedRequest, FeedResponse, HttpTransport, Transport};
