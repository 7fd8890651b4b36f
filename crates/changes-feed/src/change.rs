//! Change records and the resumable `since` cursor.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Position in the feed, as reported by the server.
///
/// Older servers report plain integers, clustered ones an opaque token.
/// Integers are compared numerically; tokens cannot be ordered by the
/// client, so any server-supplied token is taken as the newer position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Since {
    /// Integer sequence number.
    Number(u64),
    /// Opaque server token (also used for the `now` keyword).
    Token(String),
}

impl Default for Since {
    fn default() -> Self {
        Self::Number(0)
    }
}

impl Since {
    /// Start from the current end of the feed.
    #[must_use]
    pub fn now() -> Self {
        Self::Token("now".into())
    }

    /// Read a cursor from a record field. `null` carries no position.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Number(n) => n
                .as_u64()
                .map_or_else(|| Some(Self::Token(n.to_string())), |n| Some(Self::Number(n))),
            Value::String(s) => Some(Self::Token(s.clone())),
            other => Some(Self::Token(other.to_string())),
        }
    }

    /// Whether `candidate` may replace `self` without moving backwards.
    #[must_use]
    pub fn is_superseded_by(&self, candidate: &Self) -> bool {
        match (self, candidate) {
            (Self::Number(current), Self::Number(next)) => next > current,
            (Self::Token(current), Self::Token(next)) => current != next,
            _ => true,
        }
    }

    /// JSON form used in query maps and POST bodies.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::Token(t) => Value::from(t.as_str()),
        }
    }
}

impl fmt::Display for Since {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Token(t) => f.write_str(t),
        }
    }
}

impl From<u64> for Since {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for Since {
    fn from(token: &str) -> Self {
        Self::Token(token.to_owned())
    }
}

/// One record from the feed.
///
/// The server's JSON object is kept verbatim; accessors cover the fields
/// the engine itself relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Change {
    raw: Value,
}

impl Change {
    /// Wrap a decoded feed line.
    #[must_use]
    pub const fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// Sequence of this record.
    #[must_use]
    pub fn seq(&self) -> Option<Since> {
        self.raw.get("seq").and_then(Since::from_value)
    }

    /// Final sequence, present only on the record that closes the feed.
    #[must_use]
    pub fn last_seq(&self) -> Option<Since> {
        self.raw.get("last_seq").and_then(Since::from_value)
    }

    /// Cursor this record moves the feed to: `seq`, else `last_seq`.
    #[must_use]
    pub fn cursor(&self) -> Option<Since> {
        self.seq().or_else(|| self.last_seq())
    }

    /// Whether the record marks the logical end of the feed.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.last_seq().is_some()
    }

    /// Document id.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.raw.get("id").and_then(Value::as_str)
    }

    /// Full document body, when `include_docs` was requested.
    #[must_use]
    pub fn doc(&self) -> Option<&Value> {
        self.raw.get("doc").filter(|doc| !doc.is_null())
    }

    /// Whether the change is a deletion.
    #[must_use]
    pub fn deleted(&self) -> bool {
        self.raw
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Raw JSON.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.raw
    }

    /// Consume into raw JSON.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.raw
    }

    /// Deserialize the record into a caller type.
    ///
    /// # Errors
    /// Returns a JSON error if the record does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.raw)
    }
}
