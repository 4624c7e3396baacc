//! Identifier types shared across the fabric.
//!
//! Validated newtypes prevent raw strings and integers from leaking through
//! the cluster surfaces: a [`Uid`] names a user, an [`Ident`] names a
//! location process, a [`ChannelName`] names a pub/sub channel and a
//! [`ConnectionId`] names one open client transport on one front-end.

use std::fmt;

use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Process-local handle of an open client connection.
///
/// Allocated from a per-process counter on accept; never reused while the
/// process lives. Only meaningful on the front-end that allocated it.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ConnectionId(u64);

/// Stable name of a location process.
#[nutype(
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        Into
    )
)]
pub struct Ident(String);

/// Name of a pub/sub channel.
///
/// A channel has no central registry; it exists while at least one
/// connection anywhere in the cluster is subscribed to it.
#[nutype(
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        Into
    )
)]
pub struct ChannelName(String);

/// Application-supplied opaque user identifier.
///
/// The application's sign-in handler decides what a uid looks like; the
/// fabric only requires it to be an integer or a UTF-8 string and to be
/// unique per front-end (cluster-wide uniqueness is the application's
/// responsibility).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Uid {
    /// Integer identifier.
    Int(i64),
    /// String identifier.
    Str(String),
}

impl Uid {
    /// Parses the textual form used in topic strings.
    ///
    /// Integers win: `"42"` parses as `Uid::Int(42)`. This mirrors the
    /// topic grammar, which cannot distinguish the two shapes.
    pub fn parse(text: &str) -> Self {
        match text.parse::<i64>() {
            Ok(n) => Self::Int(n),
            Err(_) => Self::Str(text.to_owned()),
        }
    }

    /// Extracts a uid from a kwargs value, if it has a uid shape.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(Self::Int),
            serde_json::Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Uid {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}
