//! Error taxonomy for session persistence.

use std::fmt;

use thiserror::Error;

/// Payload encoding/decoding error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("corrupt session payload: {0}")]
    CorruptPayload(String),
    #[error("unknown attribute type tag {0:#04x}")]
    UnknownAttributeType(u8),
    #[error("unsupported attribute type: {0}")]
    UnsupportedAttributeType(String),
}

/// Error reported by a document collection driver.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("collection already exists: {0}")]
    AlreadyExists(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// Mutating store operation, used as error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Save,
    Remove,
    Clear,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Save => "save",
            Self::Remove => "remove",
            Self::Clear => "clear",
        })
    }
}

/// Session store error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or refused the request.
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    /// The document exists but carries no payload.
    #[error("Session {0} has no payload")]
    MissingPayload(String),
    #[error("Session {id} could not be decoded: {source}")]
    Codec {
        id: String,
        #[source]
        source: CodecError,
    },
    /// A save, remove or clear failed at the transport layer. `id` is `*` for
    /// a clear.
    #[error("Unable to {operation} session(s) [{id}]: {source}")]
    Mutation {
        operation: StoreOperation,
        id: String,
        #[source]
        source: CollectionError,
    },
}

impl StoreError {
    /// Whether the error means a stored document is unusable, as opposed to
    /// the store itself being unavailable.
    #[must_use]
    pub const fn is_payload_error(&self) -> bool {
        matches!(self, Self::MissingPayload(_) | Self::Codec { .. })
    }

    /// Whether the error is the recoverable "no such session" case.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}
