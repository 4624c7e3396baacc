//! The message envelope exchanged across every fabric surface.
//!
//! An envelope is a mapping `{path, kwargs}` - the dotted handler path and
//! the payload - serialized as MessagePack on the wire. Envelopes forwarded
//! from a front-end into a location process additionally carry the `sign`
//! (authority) of the originating dispatch; client-facing frames never do.

use serde::{Deserialize, Serialize};

use crate::dispatch::Sign;

/// Payload of an envelope: a string-keyed map of arbitrary values.
pub type Kwargs = serde_json::Map<String, serde_json::Value>;

/// A routable message: dotted handler path plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Dotted chain of handler names, e.g. `"channels.publish"`.
    pub path: String,
    /// Keyword payload delivered to the terminal handler.
    #[serde(default)]
    pub kwargs: Kwargs,
    /// Authority of the originating dispatch; only present on envelopes
    /// flowing between cluster processes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<Sign>,
}

impl Envelope {
    /// Builds an envelope with no sign.
    pub fn new(path: impl Into<String>, kwargs: Kwargs) -> Self {
        Self {
            path: path.into(),
            kwargs,
            sign: None,
        }
    }

    /// Builds the `error` envelope sent to a client, e.g.
    /// `{path: "error", kwargs: {msg: "sign_error"}}`.
    pub fn error(code: &str) -> Self {
        let mut kwargs = Kwargs::new();
        kwargs.insert("msg".to_owned(), serde_json::Value::String(code.to_owned()));
        Self::new("error", kwargs)
    }

    /// Prepends a dotted prefix to the path.
    pub fn prefix_path(&mut self, prefix: &str) {
        if !prefix.is_empty() {
            self.path = format!("{prefix}.{}", self.path);
        }
    }

    /// Serializes to the wire form: a MessagePack map with string keys.
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Deserializes from the wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Builds a [`Kwargs`] map from `name = value` pairs; values go through
/// [`serde_json::json!`].
#[macro_export]
macro_rules! kwargs {
    () => { $crate::envelope::Kwargs::new() };
    ($($key:ident = $value:expr),+ $(,)?) => {{
        let mut map = $crate::envelope::Kwargs::new();
        $( map.insert(stringify!($key).to_owned(), ::serde_json::json!($value)); )+
        map
    }};
}
