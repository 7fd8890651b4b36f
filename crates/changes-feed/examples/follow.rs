//! Follow a database's change feed and print each record.
//!
//! ```text
//! COUCH_URL=http://localhost:5984/mydb RUST_LOG=changes_feed=debug \
//!     cargo run --example follow -- 10
//! ```

#![forbid(unsafe_code)]

use changes_feed::{ChangesFeed, FeedConfig, FeedSignal, Since};
use futures_util::StreamExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let address = std::env::var("COUCH_URL").unwrap_or_else(|_| "http://localhost:5984/db".into());
    let limit: usize = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(usize::MAX);

    let config = FeedConfig::new(address)
        .with_include_docs(true)
        .with_since(Since::now());
    let feed = ChangesFeed::new(config)?;

    let mut signals = feed.subscribe();
    tokio::spawn(async move {
        while let Ok(signal) = signals.recv().await {
            if let FeedSignal::Retry { attempt, delay, reason } = signal {
                eprintln!("retry #{attempt} in {delay:?}: {reason}");
            }
        }
    });

    let mut changes = feed.start();
    let mut seen = 0;
    while let Some(change) = changes.next().await {
        let change = change?;
        println!("{}", serde_json::to_string(change.as_value())?);
        seen += 1;
        if seen >= limit {
            changes.destroy();
        }
    }

    eprintln!("stopped at {}", changes.since());
    Ok(())
}
