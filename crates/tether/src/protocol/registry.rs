//! Schema registry: message kind discriminator -> (encode, decode).
//!
//! Every kind a serializer can handle is registered explicitly when the
//! registry is built. Lookups afterwards are read-only.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{BoxError, SerializationError};

/// A message kind with a stable wire discriminator.
///
/// `KIND` is what goes on the wire, so it must not change once peers depend on
/// it. Namespaced names (`"jobs.heartbeat"`) keep kinds from different
/// components apart.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;
}

/// Turns one message type into payload bytes and back.
pub trait PayloadCodec<T>: Send + Sync + 'static {
    fn encode(&self, message: &T) -> Result<Vec<u8>, BoxError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, BoxError>;
}

/// Default payload codec: serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayload;

impl<T: Serialize + DeserializeOwned> PayloadCodec<T> for JsonPayload {
    fn encode(&self, message: &T) -> Result<Vec<u8>, BoxError> {
        Ok(serde_json::to_vec(message)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, BoxError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

type ErasedEncode = Box<dyn Fn(&dyn Any) -> Result<Vec<u8>, BoxError> + Send + Sync>;
type ErasedDecode = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, BoxError> + Send + Sync>;

pub(crate) struct SchemaEntry {
    kind: String,
    type_id: TypeId,
    type_name: &'static str,
    encode: ErasedEncode,
    decode: ErasedDecode,
}

impl SchemaEntry {
    fn new<T, C>(kind: String, codec: C) -> Self
    where
        T: Send + 'static,
        C: PayloadCodec<T>,
    {
        let codec = Arc::new(codec);
        let encoder = Arc::clone(&codec);

        Self {
            kind,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            encode: Box::new(move |message: &dyn Any| -> Result<Vec<u8>, BoxError> {
                let message = message
                    .downcast_ref::<T>()
                    .ok_or("message does not match the registered type")?;
                encoder.encode(message)
            }),
            decode: Box::new(move |bytes: &[u8]| -> Result<Box<dyn Any + Send>, BoxError> {
                codec
                    .decode(bytes)
                    .map(|message| Box::new(message) as Box<dyn Any + Send>)
            }),
        }
    }

    pub(crate) fn kind(&self) -> &str {
        &self.kind
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub(crate) fn encode(&self, message: &dyn Any) -> Result<Vec<u8>, SerializationError> {
        (self.encode)(message).map_err(|source| SerializationError::Payload {
            kind: self.kind.clone(),
            source,
        })
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send>, SerializationError> {
        (self.decode)(bytes).map_err(|source| SerializationError::Payload {
            kind: self.kind.clone(),
            source,
        })
    }
}

/// Collects message kinds; [`build`](Self::build) validates them.
#[derive(Default)]
pub struct SchemaRegistryBuilder {
    entries: Vec<SchemaEntry>,
}

impl SchemaRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `T::KIND` with the JSON payload codec.
    pub fn register<T: Message>(self) -> Self {
        self.register_with::<T, _>(T::KIND, JsonPayload)
    }

    /// Register `T` under an explicit discriminator with a custom codec.
    pub fn register_with<T, C>(mut self, kind: impl Into<String>, codec: C) -> Self
    where
        T: Send + 'static,
        C: PayloadCodec<T>,
    {
        self.entries.push(SchemaEntry::new::<T, C>(kind.into(), codec));
        self
    }

    pub fn build(self) -> Result<SchemaRegistry, SerializationError> {
        let mut by_kind = HashMap::with_capacity(self.entries.len());
        let mut by_type = HashMap::with_capacity(self.entries.len());

        for (index, entry) in self.entries.iter().enumerate() {
            if entry.kind.is_empty() || entry.kind.len() > super::envelope::MAX_KIND_LEN {
                return Err(SerializationError::malformed(format!(
                    "invalid message kind for {}: length {}",
                    entry.type_name,
                    entry.kind.len()
                )));
            }
            if by_kind.insert(entry.kind.clone(), index).is_some() {
                return Err(SerializationError::DuplicateKind {
                    kind: entry.kind.clone(),
                });
            }
            if by_type.insert(entry.type_id, index).is_some() {
                return Err(SerializationError::DuplicateType {
                    type_name: entry.type_name,
                });
            }
        }

        tracing::debug!(kinds = self.entries.len(), "Built schema registry");

        Ok(SchemaRegistry {
            entries: self.entries,
            by_kind,
            by_type,
        })
    }
}

/// Immutable discriminator table owned by a protocol serializer.
pub struct SchemaRegistry {
    entries: Vec<SchemaEntry>,
    by_kind: HashMap<String, usize>,
    by_type: HashMap<TypeId, usize>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::new()
    }

    pub(crate) fn by_kind(&self, kind: &str) -> Option<&SchemaEntry> {
        self.by_kind.get(kind).map(|&i| &self.entries[i])
    }

    pub(crate) fn by_type(&self, type_id: TypeId) -> Option<&SchemaEntry> {
        self.by_type.get(&type_id).map(|&i| &self.entries[i])
    }

    pub fn contains_kind(&self, kind: &str) -> bool {
        self.by_kind.contains_key(kind)
    }

    /// Discriminator `T` is registered under, if any.
    pub fn kind_of<T: 'static>(&self) -> Option<&str> {
        self.by_type(TypeId::of::<T>()).map(SchemaEntry::kind)
    }

    /// Registered discriminators in registration order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(SchemaEntry::kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("kinds", &self.kinds().collect::<Vec<_>>())
            .finish()
    }
}
