//! Core abstractions for externally persisted sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `Session` - In-memory session state and attribute values
//! - `codec` - Opaque payload encoding of a session
//! - `mapper` - Session to document projection
//! - `SessionStore` and `DocumentCollection` traits
//! - Configuration and error types

pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod mapper;
pub mod session;
pub mod traits;

pub use config::{ConnectionSettings, ManagerConfig, ServerAddress};
pub use document::{Document, FieldValue, Filter, Sort};
pub use error::{CodecError, CollectionError, ConfigError, StoreError, StoreOperation};
pub use session::{AttributeValue, Session};
pub use traits::{
    DocumentCollection, DocumentDriver, SessionFactory, SessionIdGenerator, SessionStore,
    StandardIdGenerator, StandardSessionFactory,
};
