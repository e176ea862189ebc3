//! Error taxonomy shared by the transport and the protocol codec.

use std::io;

use crate::endpoint::Endpoint;

/// Boxed error returned by payload codecs.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = RemoteError> = std::result::Result<T, E>;

/// Errors surfaced by [`RemoteManager`](crate::RemoteManager) and its send handles.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The local address could not be bound.
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    /// Peer unreachable, connection reset, or a write failed part-way.
    #[error("connection to {endpoint} failed: {source}")]
    Connection {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    /// A payload larger than the configured frame limit was handed to `send`.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The manager has been closed.
    #[error("remote manager is closed")]
    Closed,

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

impl RemoteError {
    pub(crate) fn connection(endpoint: &Endpoint, source: io::Error) -> Self {
        Self::Connection {
            endpoint: endpoint.clone(),
            source,
        }
    }

    /// Connection failures are transient; everything else is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Errors from the envelope codec, the schema registry and the protocol serializer.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    /// `write` was called with a type that has no schema entry.
    #[error("message type {type_name} is not registered")]
    Unregistered { type_name: &'static str },

    /// An envelope named a discriminator this registry does not know.
    #[error("unknown message kind '{kind}'")]
    UnknownKind { kind: String },

    /// The envelope itself could not be parsed.
    #[error("malformed envelope: {reason}")]
    Malformed { reason: String },

    /// The payload codec failed for a known kind.
    #[error("payload codec failed for '{kind}': {source}")]
    Payload {
        kind: String,
        #[source]
        source: BoxError,
    },

    #[error("message kind '{kind}' registered more than once")]
    DuplicateKind { kind: String },

    #[error("message type {type_name} registered under more than one kind")]
    DuplicateType { type_name: &'static str },

    /// Decoding succeeded but the router has nobody for this kind.
    #[error("no subscriber for message kind '{kind}'")]
    NoSubscriber { kind: String },

    /// `read_as::<T>` decoded a message of some other registered type.
    #[error("expected {expected} but decoded message kind '{kind}'")]
    TypeMismatch {
        kind: String,
        expected: &'static str,
    },
}

impl SerializationError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Conflicting or invalid observer registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("an observer is already registered for {0}")]
    AlreadyRegistered(Endpoint),
}
