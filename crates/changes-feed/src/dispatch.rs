//! Interpretation of decoded lines.
//!
//! The dispatcher owns the resumable cursor and the client-side filter.
//! It decides what each line means; delivering the result and reacting to
//! consumer backpressure is left to the connection loop.

use serde_json::{Value, json};
use tracing::debug;

use crate::change::{Change, Since};
use crate::config::ClientFilter;
use crate::decoder::Line;
use crate::error::{FeedError, FeedResult};
use crate::query::QueryParams;

/// What to do with one decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Keep-alive; nothing to deliver.
    Heartbeat,
    /// Record for the consumer.
    Deliver(Change),
    /// Record rejected by the client filter.
    Skip {
        /// Whether the rejected record closed the feed.
        last: bool,
    },
}

/// Turns decoded lines into deliveries while tracking the cursor.
pub struct Dispatcher {
    since: Since,
    filter: Option<ClientFilter>,
    query: Value,
}

impl Dispatcher {
    /// Create a dispatcher starting at `since`.
    #[must_use]
    pub fn new(since: Since, filter: Option<ClientFilter>) -> Self {
        Self {
            since,
            filter,
            query: Value::Object(serde_json::Map::new()),
        }
    }

    /// Latest cursor.
    #[must_use]
    pub const fn since(&self) -> &Since {
        &self.since
    }

    /// Remember the parameters of the request now streaming, for the filter.
    pub fn set_query(&mut self, query: &QueryParams) {
        self.query = Value::Object(query.as_map().clone());
    }

    /// Interpret one line.
    ///
    /// # Errors
    /// Returns `FeedError::Filter` if the client filter fails.
    pub fn dispatch(&mut self, line: Line) -> FeedResult<Dispatch> {
        let value = match line {
            Line::Empty => return Ok(Dispatch::Heartbeat),
            Line::Value(Value::String(s)) if s.is_empty() => return Ok(Dispatch::Heartbeat),
            Line::Value(value) => value,
        };

        let change = Change::new(value);
        self.advance(&change);

        if let Some(filter) = &self.filter {
            let doc = change.doc().cloned().unwrap_or(Value::Null);
            let context = json!({ "query": self.query });
            let keep = filter(&doc, &context).map_err(|e| FeedError::Filter(format!("{e:#}")))?;
            if !keep {
                debug!(id = ?change.id(), "Client filter rejected change");
                return Ok(Dispatch::Skip {
                    last: change.is_final(),
                });
            }
        }

        Ok(Dispatch::Deliver(change))
    }

    fn advance(&mut self, change: &Change) {
        if let Some(next) = change.cursor() {
            if self.since.is_superseded_by(&next) {
                self.since = next;
            } else {
                debug!(current = %self.since, reported = %next, "Ignoring stale cursor");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{FeedConfig, FeedFilter};
    use serde_json::json;

    fn record(value: Value) -> Line {
        Line::Value(value)
    }

    #[test]
    fn blank_line_is_heartbeat() {
        let mut dispatcher = Dispatcher::new(Since::Number(3), None);
        assert_eq!(dispatcher.dispatch(Line::Empty).unwrap(), Dispatch::Heartbeat);
        assert_eq!(
            dispatcher.dispatch(record(json!(""))).unwrap(),
            Dispatch::Heartbeat
        );
        assert_eq!(dispatcher.since(), &Since::Number(3));
    }

    #[test]
    fn records_advance_cursor() {
        let mut dispatcher = Dispatcher::new(Since::default(), None);
        dispatcher.dispatch(record(json!({"seq": 1}))).unwrap();
        dispatcher.dispatch(record(json!({"seq": 2}))).unwrap();
        assert_eq!(dispatcher.since(), &Since::Number(2));

        let out = dispatcher
            .dispatch(record(json!({"last_seq": 5})))
            .unwrap();
        assert!(matches!(out, Dispatch::Deliver(c) if c.is_final()));
        assert_eq!(dispatcher.since(), &Since::Number(5));
    }

    #[test]
    fn cursor_never_moves_back() {
        let mut dispatcher = Dispatcher::new(Since::Number(10), None);
        dispatcher.dispatch(record(json!({"seq": 4}))).unwrap();
        assert_eq!(dispatcher.since(), &Since::Number(10));
    }

    #[test]
    fn filter_sees_doc_and_query() {
        let filter: ClientFilter = Arc::new(|doc: &Value, context: &Value| -> anyhow::Result<bool> {
            assert_eq!(context["query"]["include_docs"], json!(true));
            Ok(doc["keep"].as_bool().unwrap_or(false))
        });
        let config =
            FeedConfig::new("http://db/x").with_filter(FeedFilter::client(|_, _| Ok(true)));
        let mut dispatcher = Dispatcher::new(Since::default(), Some(filter));
        dispatcher.set_query(&QueryParams::from_config(&config, &config.since));

        let kept = dispatcher
            .dispatch(record(json!({"seq": 1, "doc": {"keep": true}})))
            .unwrap();
        assert!(matches!(kept, Dispatch::Deliver(_)));

        let dropped = dispatcher
            .dispatch(record(json!({"seq": 2, "doc": {"keep": false}})))
            .unwrap();
        assert_eq!(dropped, Dispatch::Skip { last: false });
        assert_eq!(dispatcher.since(), &Since::Number(2));
    }

    #[test]
    fn filter_error_is_reported() {
        let filter: ClientFilter = Arc::new(|_: &Value, _: &Value| -> anyhow::Result<bool> {
            anyhow::bail!("bad predicate")
        });
        let mut dispatcher = Dispatcher::new(Since::default(), Some(filter));
        let err = dispatcher
            .dispatch(record(json!({"seq": 1, "doc": {}})))
            .unwrap_err();
        assert!(matches!(err, FeedError::Filter(msg) if msg == "bad predicate"));
    }
}
