//! Length-prefixed frame codec shared by every TCP surface of the fabric.
//!
//! A frame is a fixed 10-byte ASCII header holding the decimal byte length
//! of the body, left-padded with `'0'`, followed by the body. The body is
//! MessagePack: a `{path, kwargs}` envelope on the client surface, a
//! multipart array on the cluster surfaces.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the ASCII length header.
pub const HEADER_LEN: usize = 10;

/// Default cap on a single frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// A framing failure. Any of these closes the offending connection.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The 10 header bytes were not a decimal length.
    #[error("invalid frame header: {header:?}")]
    BadHeader {
        /// The raw header bytes.
        header: Vec<u8>,
    },
    /// A frame body exceeded the configured cap.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared body length.
        len: usize,
        /// Configured cap.
        max: usize,
    },
    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec for the 10-byte-header framing.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    /// Codec with the default frame cap.
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Codec with a custom frame cap.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = &src[..HEADER_LEN];
        let len = std::str::from_utf8(header)
            .ok()
            .and_then(|text| text.parse::<usize>().ok())
            .ok_or_else(|| CodecError::BadHeader {
                header: header.to_vec(),
            })?;
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        if body.len() > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_len,
            });
        }
        dst.reserve(HEADER_LEN + body.len());
        dst.extend_from_slice(format!("{:010}", body.len()).as_bytes());
        dst.extend_from_slice(&body);
        Ok(())
    }
}
