//! Type-directed message codec on top of the envelope and schema registry.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use tokio_util::bytes::Bytes;

use super::envelope::Envelope;
use super::registry::{Message, PayloadCodec, SchemaRegistry, SchemaRegistryBuilder};
use crate::error::SerializationError;
use crate::observer::Observer;

/// A decoded message together with its sender-assigned sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInstance<T> {
    sequence: i64,
    message: T,
}

impl<T> MessageInstance<T> {
    pub fn new(sequence: i64, message: T) -> Self {
        Self { sequence, message }
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn into_parts(self) -> (i64, T) {
        (self.sequence, self.message)
    }
}

/// Output of [`ProtocolSerializer::decode`]: a message whose concrete type is
/// only known through its registered kind.
pub struct DecodedMessage {
    kind: String,
    sequence: i64,
    type_id: TypeId,
    message: Box<dyn Any + Send>,
}

impl DecodedMessage {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Recover the typed instance; gives `self` back if the type is wrong.
    pub fn downcast<T: 'static>(self) -> Result<MessageInstance<T>, Self> {
        if !self.is::<T>() {
            return Err(self);
        }
        match self.message.downcast::<T>() {
            Ok(message) => Ok(MessageInstance::new(self.sequence, *message)),
            Err(message) => Err(Self { message, ..self }),
        }
    }
}

impl fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("kind", &self.kind)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

type Route = Box<dyn Fn(i64, Box<dyn Any + Send>) + Send + Sync>;

/// Per-type subscribers for [`ProtocolSerializer::read`].
///
/// Each registered message type can have one observer; a later `subscribe`
/// for the same type replaces the earlier one.
#[derive(Default)]
pub struct MessageRouter {
    routes: HashMap<TypeId, Route>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<T, O>(mut self, observer: O) -> Self
    where
        T: Send + 'static,
        O: Observer<MessageInstance<T>> + 'static,
    {
        let route: Route = Box::new(move |sequence: i64, message: Box<dyn Any + Send>| {
            match message.downcast::<T>() {
                Ok(message) => observer.on_next(MessageInstance::new(sequence, *message)),
                Err(_) => tracing::error!(
                    type_name = std::any::type_name::<T>(),
                    "Routed message has the wrong type"
                ),
            }
        });
        self.routes.insert(TypeId::of::<T>(), route);
        self
    }

    pub fn handles<T: 'static>(&self) -> bool {
        self.routes.contains_key(&TypeId::of::<T>())
    }

    /// Deliver to the observer for the message's type.
    pub fn route(&self, decoded: DecodedMessage) -> Result<(), SerializationError> {
        let route = self
            .routes
            .get(&decoded.type_id)
            .ok_or(SerializationError::NoSubscriber {
                kind: decoded.kind,
            })?;
        route(decoded.sequence, decoded.message);
        Ok(())
    }
}

/// Encodes typed messages into envelopes and decodes them back, for the fixed
/// set of kinds in its [`SchemaRegistry`].
///
/// Immutable after construction; share it behind an `Arc`.
#[derive(Debug)]
pub struct ProtocolSerializer {
    registry: SchemaRegistry,
}

impl ProtocolSerializer {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    pub fn builder() -> ProtocolSerializerBuilder {
        ProtocolSerializerBuilder {
            registry: SchemaRegistryBuilder::new(),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Serialize `message` into envelope bytes tagged with `sequence`.
    pub fn write<T: 'static>(
        &self,
        message: &T,
        sequence: i64,
    ) -> Result<Bytes, SerializationError> {
        let entry = self.registry.by_type(TypeId::of::<T>()).ok_or(
            SerializationError::Unregistered {
                type_name: std::any::type_name::<T>(),
            },
        )?;

        let payload = entry.encode(message)?;
        let envelope = Envelope::new(entry.kind(), sequence, payload);
        let bytes = envelope.encode()?;

        tracing::trace!(
            kind = entry.kind(),
            sequence,
            envelope_bytes = bytes.len(),
            "Encoded message"
        );
        Ok(bytes)
    }

    /// Parse envelope bytes and decode the payload with the registered codec.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedMessage, SerializationError> {
        let envelope = Envelope::decode(Bytes::copy_from_slice(bytes))?;

        let entry =
            self.registry
                .by_kind(&envelope.kind)
                .ok_or_else(|| SerializationError::UnknownKind {
                    kind: envelope.kind.clone(),
                })?;
        let message = entry.decode(&envelope.payload)?;

        Ok(DecodedMessage {
            kind: envelope.kind,
            sequence: envelope.sequence,
            type_id: entry.type_id(),
            message,
        })
    }

    /// Decode `bytes` and hand the result to the router's observer for its type.
    ///
    /// Nothing is delivered unless decoding succeeds.
    pub fn read(&self, bytes: &[u8], router: &MessageRouter) -> Result<(), SerializationError> {
        let decoded = self.decode(bytes)?;
        tracing::trace!(
            kind = decoded.kind(),
            sequence = decoded.sequence(),
            "Routing decoded message"
        );
        router.route(decoded)
    }

    /// Decode `bytes` expecting exactly `T`.
    pub fn read_as<T: 'static>(
        &self,
        bytes: &[u8],
    ) -> Result<MessageInstance<T>, SerializationError> {
        self.decode(bytes)?
            .downcast::<T>()
            .map_err(|decoded| SerializationError::TypeMismatch {
                kind: decoded.kind,
                expected: std::any::type_name::<T>(),
            })
    }
}

/// Builder mirroring [`SchemaRegistryBuilder`] that yields a serializer.
pub struct ProtocolSerializerBuilder {
    registry: SchemaRegistryBuilder,
}

impl ProtocolSerializerBuilder {
    pub fn register<T: Message>(mut self) -> Self {
        self.registry = self.registry.register::<T>();
        self
    }

    pub fn register_with<T, C>(mut self, kind: impl Into<String>, codec: C) -> Self
    where
        T: Send + 'static,
        C: PayloadCodec<T>,
    {
        self.registry = self.registry.register_with::<T, C>(kind, codec);
        self
    }

    pub fn build(self) -> Result<ProtocolSerializer, SerializationError> {
        Ok(ProtocolSerializer::new(self.registry.build()?))
    }
}
