//! Core traits for session storage and document drivers.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    Session,
    config::ConnectionSettings,
    document::{Document, Filter, Sort},
    error::{CollectionError, StoreError},
};

/// Factory for blank sessions bound to the owning manager's defaults.
pub trait SessionFactory: Send + Sync {
    /// Create an empty session to be populated by the codec.
    fn create_empty_session(&self) -> Session;
}

/// Session factory that only applies a default idle timeout.
#[derive(Debug, Clone, Copy)]
pub struct StandardSessionFactory {
    max_inactive_interval: i32,
}

impl StandardSessionFactory {
    #[must_use]
    pub const fn new(max_inactive_interval: i32) -> Self {
        Self {
            max_inactive_interval,
        }
    }
}

impl SessionFactory for StandardSessionFactory {
    fn create_empty_session(&self) -> Session {
        Session::empty(self.max_inactive_interval)
    }
}

/// Pluggable session id generator.
pub trait SessionIdGenerator: Send + Sync {
    fn generate_session_id(&self) -> String;
}

/// Generates 32 upper-case hex characters from 128 random bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardIdGenerator;

impl SessionIdGenerator for StandardIdGenerator {
    fn generate_session_id(&self) -> String {
        Uuid::new_v4().simple().to_string().to_uppercase()
    }
}

/// Capability interface of a session store.
///
/// The manager only talks to persistence through this trait, so any backend
/// can be selected at configuration time.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Diagnostic name of the store implementation.
    fn store_name(&self) -> &str;

    /// Ensure the backing collection exists. Idempotent.
    async fn provision(&self) -> Result<(), StoreError>;

    /// Number of persisted sessions, expired or not.
    async fn size(&self) -> Result<usize, StoreError>;

    /// All persisted ids, ascending.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Persisted ids whose store-side expiration time has passed, ascending.
    async fn expired_keys(&self) -> Result<Vec<String>, StoreError>;

    /// Load and decode a session.
    async fn load(&self, id: &str) -> Result<Session, StoreError>;

    /// Insert or fully replace the document for this session.
    async fn save(&self, session: &Session) -> Result<(), StoreError>;

    /// Delete the document for `id`. Absent ids are not an error.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Delete every persisted session.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<(), StoreError>;
}

/// Handle to one collection in a document database.
///
/// This is the whole surface a driver has to provide.
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    /// `database.collection`, for diagnostics.
    fn namespace(&self) -> String;

    /// Create the collection. Must report [`CollectionError::AlreadyExists`]
    /// if it is already there.
    async fn create_collection(&self) -> Result<(), CollectionError>;

    async fn find(&self, filter: &Filter, sort: Sort) -> Result<Vec<Document>, CollectionError>;

    /// Replace the document with this id, inserting it if absent.
    async fn replace_one_upsert(&self, id: &str, document: Document)
    -> Result<(), CollectionError>;

    /// Delete every matching document, returning how many were removed.
    async fn delete_many(&self, filter: &Filter) -> Result<u64, CollectionError>;

    async fn count(&self) -> Result<u64, CollectionError>;

    async fn close(&self) -> Result<(), CollectionError> {
        Ok(())
    }
}

/// Opens collection handles from connection settings.
#[async_trait]
pub trait DocumentDriver: Send + Sync {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        database: &str,
        collection: &str,
    ) -> Result<Arc<dyn DocumentCollection>, CollectionError>;
}
