//! Byte transport beneath the remote manager.
//!
//! - **network**: listen/accept/connect provider (TCP by default)
//! - **codec**: length-prefixed framing and the link handshake frame

pub mod codec;
pub mod network;

pub use codec::{JsonCodec, LinkHello, frame_codec};
pub use network::{Listener, NetworkProvider, TokioListener, TokioNetwork};
