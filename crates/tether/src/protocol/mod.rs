//! Typed message protocol carried over the byte transport.
//!
//! - **envelope**: self-describing frame (kind + sequence + payload)
//! - **registry**: explicit kind -> codec table
//! - **serializer**: typed write/read and per-type routing

pub mod envelope;
pub mod registry;
pub mod serializer;

pub use envelope::Envelope;
pub use registry::{JsonPayload, Message, PayloadCodec, SchemaRegistry, SchemaRegistryBuilder};
pub use serializer::{
    DecodedMessage, MessageInstance, MessageRouter, ProtocolSerializer, ProtocolSerializerBuilder,
};
