//! tether: typed, ordered message transport between processes over TCP.
//!
//! Two layers:
//! - [`RemoteManager`] moves opaque byte frames between endpoints and hands
//!   inbound frames to per-peer observers.
//! - [`ProtocolSerializer`] turns typed messages into self-describing frames
//!   (kind + sequence + payload) and routes decoded frames by type.

pub mod config;
pub mod endpoint;
pub mod error;
mod logging;
pub mod observer;
pub mod protocol;
pub mod remote;
pub mod transport;

pub use config::{RemoteConfig, TcpPortRange};
pub use endpoint::{ConnectionId, Endpoint, EndpointParseError};
pub use error::{BoxError, RegistrationError, RemoteError, Result, SerializationError};
pub use logging::init_tracing;
pub use observer::{FnObserver, Observer, observer_fn};
pub use protocol::{
    DecodedMessage, Envelope, JsonPayload, Message, MessageInstance, MessageRouter,
    PayloadCodec, ProtocolSerializer, ProtocolSerializerBuilder, SchemaRegistry,
    SchemaRegistryBuilder,
};
pub use remote::{RemoteManager, RemoteSender};
pub use transport::{NetworkProvider, TokioNetwork};

/// Frames are reference-counted byte buffers.
pub use tokio_util::bytes::Bytes;
