//! Cluster transport endpoints.
//!
//! The original deployment vocabulary of the fabric - pub/sub with prefix
//! subscriptions, push/pull pipes, one-shot request/reply - re-expressed as
//! small tokio TCP endpoints sharing the 10-byte-header frame codec. A
//! cluster frame body is a MessagePack array of binary parts (a multipart
//! message); part one is usually an ASCII topic or command.
//!
//! All endpoints are best-effort: connects retry forever with a fixed
//! backoff, sends while a peer is unreachable are dropped, and a slow
//! subscriber loses frames instead of stalling the publisher.

mod pubsub;
mod pushpull;
mod reqrep;

pub use pubsub::{PubEndpoint, PubHandle, SubEndpoint};
pub use pushpull::{PullEndpoint, PushEndpoint};
pub use reqrep::{RepEndpoint, RepRequest, request};

use std::time::Duration;

use bytes::Bytes;
use serde_bytes::ByteBuf;
use thiserror::Error;

use crate::codec::CodecError;

/// Delay between reconnect attempts of connecting endpoints.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_millis(200);

/// Queue depth per subscriber / push link before frames are dropped.
pub(crate) const SEND_QUEUE: usize = 1024;

/// A transport failure.
#[derive(Debug, Error)]
pub enum NetError {
    /// Socket-level failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    /// Framing failure.
    #[error("framing error: {0}")]
    Codec(#[from] CodecError),
    /// Multipart encode failure.
    #[error("multipart encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// Multipart decode failure.
    #[error("multipart decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    /// A frame decoded but did not have the expected shape.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Encodes a multipart message into one frame body.
pub fn encode_parts(parts: &[&[u8]]) -> Result<Bytes, NetError> {
    let wrapped: Vec<&serde_bytes::Bytes> =
        parts.iter().map(|part| serde_bytes::Bytes::new(part)).collect();
    Ok(Bytes::from(rmp_serde::to_vec(&wrapped)?))
}

/// Decodes a frame body into its multipart form.
pub fn decode_parts(frame: &[u8]) -> Result<Vec<ByteBuf>, NetError> {
    Ok(rmp_serde::from_slice(frame)?)
}

/// Reads part `index` as UTF-8.
pub fn part_str(parts: &[ByteBuf], index: usize) -> Result<&str, NetError> {
    let part = parts.get(index).ok_or(NetError::Malformed("missing part"))?;
    std::str::from_utf8(part).map_err(|_| NetError::Malformed("part is not UTF-8"))
}

/// Encodes a `[topic, body]` pub/sub frame.
pub fn encode_topic_frame(topic: &str, body: &[u8]) -> Result<Bytes, NetError> {
    encode_parts(&[topic.as_bytes(), body])
}

/// Decodes a `[topic, body]` pub/sub frame.
pub fn decode_topic_frame(frame: &[u8]) -> Result<(String, Bytes), NetError> {
    let mut parts = decode_parts(frame)?;
    if parts.len() != 2 {
        return Err(NetError::Malformed("expected [topic, body]"));
    }
    let body = parts.pop().expect("len checked").into_vec();
    let topic = part_str(&parts, 0)?.to_owned();
    Ok((topic, Bytes::from(body)))
}

/// Decodes a broker ingress frame: `[topic, body]` with an optional
/// trailing origin tag for echo suppression.
pub fn decode_published_frame(frame: &[u8]) -> Result<(String, Bytes, Option<String>), NetError> {
    let mut parts = decode_parts(frame)?;
    let origin = match parts.len() {
        2 => None,
        3 => {
            let origin = part_str(&parts, 2)?.to_owned();
            parts.pop();
            Some(origin)
        }
        _ => return Err(NetError::Malformed("expected [topic, body, origin?]")),
    };
    let body = parts.pop().expect("len checked").into_vec();
    let topic = part_str(&parts, 0)?.to_owned();
    Ok((topic, Bytes::from(body), origin))
}
