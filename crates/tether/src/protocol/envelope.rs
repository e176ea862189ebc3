//! Self-describing envelope wrapped around every serialized message.
//!
//! Layout (big-endian):
//!
//! ```text
//! [version:1][kind_len:2][kind:kind_len][sequence:8][payload:rest]
//! ```
//!
//! The payload runs to the end of the buffer; the transport delivers each
//! envelope as one whole frame, so no payload length is stored.

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::SerializationError;

pub const ENVELOPE_VERSION: u8 = 1;

/// Longest discriminator that fits the length field.
pub const MAX_KIND_LEN: usize = u16::MAX as usize;

/// Bytes preceding the kind: version + kind length.
const PREFIX_LEN: usize = 1 + 2;
const SEQUENCE_LEN: usize = 8;

/// Envelope: discriminator, sender-assigned sequence number and opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: String,
    pub sequence: i64,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, sequence: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.into(),
            sequence,
            payload: payload.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        PREFIX_LEN + self.kind.len() + SEQUENCE_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes, SerializationError> {
        if self.kind.is_empty() {
            return Err(SerializationError::malformed("empty message kind"));
        }
        if self.kind.len() > MAX_KIND_LEN {
            return Err(SerializationError::malformed(format!(
                "message kind is {} bytes (max {MAX_KIND_LEN})",
                self.kind.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_u16(self.kind.len() as u16);
        buf.put_slice(self.kind.as_bytes());
        buf.put_i64(self.sequence);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse an envelope. The payload is a zero-copy slice of `bytes`.
    pub fn decode(mut bytes: Bytes) -> Result<Self, SerializationError> {
        if bytes.len() < PREFIX_LEN {
            return Err(SerializationError::malformed(format!(
                "need at least {PREFIX_LEN} header bytes, have {}",
                bytes.len()
            )));
        }

        let version = bytes.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(SerializationError::malformed(format!(
                "unsupported envelope version {version}"
            )));
        }

        let kind_len = bytes.get_u16() as usize;
        if kind_len == 0 {
            return Err(SerializationError::malformed("empty message kind"));
        }
        if bytes.len() < kind_len + SEQUENCE_LEN {
            return Err(SerializationError::malformed(format!(
                "truncated envelope: need {} bytes after header, have {}",
                kind_len + SEQUENCE_LEN,
                bytes.len()
            )));
        }

        let kind_bytes = bytes.split_to(kind_len);
        let kind = std::str::from_utf8(&kind_bytes)
            .map_err(|e| SerializationError::malformed(format!("message kind is not UTF-8: {e}")))?
            .to_owned();
        let sequence = bytes.get_i64();

        Ok(Self {
            kind,
            sequence,
            payload: bytes,
        })
    }
}
