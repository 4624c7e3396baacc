//! The routed message-dispatch engine.
//!
//! Every inbound envelope is a dotted path of handler names walked over a
//! tree of [`Node`]s rooted at the application root. Each path segment
//! resolves to a registered handler that is either a *router* (continues
//! dispatch on a sub-node) or a *receiver* (terminates it), and carries the
//! authority the caller must hold. Authority, topology and existence are
//! enforced uniformly by the engine, never per handler.

mod engine;
mod loopback;

pub use engine::{Next, Node, Proxy, dispatch, dispatch_with_loopback};
pub use loopback::Loopback;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authority actually held by a dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sign {
    /// No authority: an unauthenticated client.
    #[default]
    None,
    /// A signed-in client.
    User,
    /// The fabric itself (loopback, location traffic).
    Internal,
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::User => "user",
            Self::Internal => "internal",
        })
    }
}

/// Authority a handler requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Anyone, including unauthenticated clients.
    Open,
    /// Signed-in clients only.
    User,
    /// The fabric only.
    Internal,
    /// Signed-in clients or the fabric.
    UserOrInternal,
}

impl Access {
    /// The single admissibility table of the engine.
    pub const fn admits(self, sign: Sign) -> bool {
        matches!(
            (self, sign),
            (Self::Open, _)
                | (Self::User, Sign::User)
                | (Self::Internal, Sign::Internal)
                | (Self::UserOrInternal, Sign::User | Sign::Internal)
        )
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "no sign",
            Self::User => "user sign",
            Self::Internal => "internal sign",
            Self::UserOrInternal => "internal or user sign",
        })
    }
}

/// Whether a handler continues or terminates a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Continues dispatch on a sub-node; must not be the last segment.
    Router,
    /// Terminates dispatch; must be the last segment.
    Receiver,
}

/// What a node has registered under a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// A dispatchable handler.
    Handler(HandlerKind, Access),
    /// The name exists on the node but is not a handler.
    Forbidden,
    /// Nothing under that name.
    Unknown,
}

/// A dotted dispatch path, split into segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// Splits a dotted string. Never fails; empty or odd segments simply
    /// will not resolve to a handler.
    pub fn parse(dotted: &str) -> Self {
        Self {
            segments: dotted.split('.').map(str::to_owned).collect(),
        }
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True when the path has no segments. Cannot happen via [`parse`].
    ///
    /// [`parse`]: Self::parse
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segment at `index`.
    pub fn segment(&self, index: usize) -> &str {
        &self.segments[index]
    }

    /// The sub-path from `index` to the end.
    pub fn suffix(&self, index: usize) -> Self {
        Self {
            segments: self.segments[index..].to_vec(),
        }
    }

    /// Renders the path with the failing segment highlighted, e.g.
    /// `meth_a.meth_a.|meth_b|.meth_b`.
    pub fn annotate(&self, index: usize) -> String {
        let mut rendered = Vec::with_capacity(self.segments.len());
        for (i, segment) in self.segments.iter().enumerate() {
            if i == index {
                rendered.push(format!("|{segment}|"));
            } else {
                rendered.push(segment.clone());
            }
        }
        rendered.join(".")
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// A dispatch failure.
///
/// Every variant names the full path with the failing segment highlighted.
/// Client-originated failures are answered with an `error` envelope;
/// internal ones are logged and swallowed.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler under the segment name and the node is not a proxy.
    #[error("{node} has no handler '{name}' (path: {path})")]
    NoSuchMember {
        /// Name of the node that was walked.
        node: &'static str,
        /// The missing segment.
        name: String,
        /// Annotated path.
        path: String,
    },
    /// The name exists on the node but is not dispatchable.
    #[error("handler '{name}' of {node} is forbidden (path: {path})")]
    Forbidden {
        /// Name of the node that was walked.
        node: &'static str,
        /// The refused segment.
        name: String,
        /// Annotated path.
        path: String,
    },
    /// A receiver sat in the middle of the path.
    #[error("got receiver '{name}' of {node}, expected router (path: {path})")]
    ExpectedRouter {
        /// Name of the node that was walked.
        node: &'static str,
        /// The offending segment.
        name: String,
        /// Annotated path.
        path: String,
    },
    /// A router sat at the end of the path.
    #[error("got router '{name}' of {node}, expected receiver (path: {path})")]
    ExpectedReceiver {
        /// Name of the node that was walked.
        node: &'static str,
        /// The offending segment.
        name: String,
        /// Annotated path.
        path: String,
    },
    /// The caller's sign does not satisfy the handler's access.
    #[error("need {required} (path: {path})")]
    SignDenied {
        /// Access the handler requires.
        required: Access,
        /// Annotated path.
        path: String,
    },
    /// A handler failed for an application reason.
    #[error("handler failed (path: {path}): {source}")]
    Handler {
        /// Annotated path, filled in by the engine.
        path: String,
        /// The application error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl DispatchError {
    /// Wraps an application error raised inside a handler. The engine fills
    /// in the path position.
    pub fn handler(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Handler {
            path: String::new(),
            source: source.into(),
        }
    }

    pub(crate) fn locate(self, annotated: &str) -> Self {
        match self {
            Self::Handler { path, source } if path.is_empty() => Self::Handler {
                path: annotated.to_owned(),
                source,
            },
            other => other,
        }
    }
}
