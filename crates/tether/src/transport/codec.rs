//! Framed codecs for remote links.
//!
//! Every frame is a 4-byte big-endian length followed by the frame body
//! (`LengthDelimitedCodec`). The first frame on a dialed connection is a JSON
//! [`LinkHello`]; all later frames are opaque application bytes.

use std::io;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::endpoint::Endpoint;

pub const LINK_VERSION: u16 = 1;

/// Length-prefixed framing shared by every link.
pub fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Sent by the dialing side so the acceptor knows which listening endpoint the
/// connection belongs to (the socket's source port is ephemeral).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHello {
    pub version: u16,
    pub endpoint: Endpoint,
}

impl LinkHello {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            version: LINK_VERSION,
            endpoint,
        }
    }
}

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> JsonCodec<T> {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inner: frame_codec(max_frame_length),
            _phantom: PhantomData,
        }
    }

    /// Underlying framing, for switching a `Framed*` to raw frames.
    pub fn into_inner(self) -> LengthDelimitedCodec {
        self.inner
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding control frame");
        self.inner.encode(Bytes::from(json), dst)
    }
}
