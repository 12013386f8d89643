//! Session store backed by a document collection.

use std::sync::Arc;

use async_trait::async_trait;
use sessionvault_core::{
    DocumentCollection, Filter, Session, SessionFactory, SessionStore, Sort, StoreError,
    StoreOperation, codec,
    error::CollectionError,
    mapper,
    session::now,
};
use tracing::{debug, error, info};

/// Persists each session as one document in a single collection.
pub struct DocumentSessionStore {
    collection: Arc<dyn DocumentCollection>,
    factory: Arc<dyn SessionFactory>,
}

impl DocumentSessionStore {
    /// Create a store over `collection`, rebuilding loaded sessions from
    /// blanks handed out by `factory`.
    #[must_use]
    pub fn new(collection: Arc<dyn DocumentCollection>, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            collection,
            factory,
        }
    }

    /// The underlying collection handle.
    #[must_use]
    pub fn collection(&self) -> &Arc<dyn DocumentCollection> {
        &self.collection
    }

    async fn ids(&self, filter: Filter) -> Result<Vec<String>, StoreError> {
        let documents = self
            .collection
            .find(&filter, Sort::IdAscending)
            .await
            .map_err(connection)?;
        Ok(documents
            .iter()
            .filter_map(|doc| doc.id().map(str::to_string))
            .collect())
    }

    fn mutation_failed(
        &self,
        operation: StoreOperation,
        id: &str,
        source: CollectionError,
    ) -> StoreError {
        error!(
            %operation,
            session_id = %id,
            namespace = %self.collection.namespace(),
            error = %source,
            "Unable to {operation} session(s) in document store"
        );
        StoreError::Mutation {
            operation,
            id: id.to_string(),
            source,
        }
    }
}

fn connection(e: CollectionError) -> StoreError {
    StoreError::Connection(e.to_string())
}

#[async_trait]
impl SessionStore for DocumentSessionStore {
    fn store_name(&self) -> &str {
        "DocumentSessionStore"
    }

    async fn provision(&self) -> Result<(), StoreError> {
        match self.collection.create_collection().await {
            Ok(()) => {
                info!(namespace = %self.collection.namespace(), "Created session collection");
                Ok(())
            }
            Err(CollectionError::AlreadyExists(_)) => {
                info!(namespace = %self.collection.namespace(), "Collection already exists");
                Ok(())
            }
            Err(e) => Err(connection(e)),
        }
    }

    async fn size(&self) -> Result<usize, StoreError> {
        let count = self.collection.count().await.map_err(connection)?;
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.ids(Filter::All).await
    }

    async fn expired_keys(&self) -> Result<Vec<String>, StoreError> {
        self.ids(Filter::ExpiresBefore(now().timestamp_millis())).await
    }

    async fn load(&self, id: &str) -> Result<Session, StoreError> {
        let documents = self
            .collection
            .find(&Filter::IdEquals(id.to_string()), Sort::Natural)
            .await
            .map_err(connection)?;
        let document = documents
            .first()
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;

        let payload = mapper::payload_from_document(document)?;
        let session = codec::deserialize(payload, self.factory.as_ref()).map_err(|source| {
            StoreError::Codec {
                id: id.to_string(),
                source,
            }
        })?;

        debug!(session_id = %id, bytes = payload.len(), "Loaded session");
        Ok(session)
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let payload = codec::serialize(session).map_err(|source| StoreError::Codec {
            id: session.id().to_string(),
            source,
        })?;
        let document = mapper::to_document(session, payload, now());

        self.collection
            .replace_one_upsert(session.id(), document)
            .await
            .map_err(|e| self.mutation_failed(StoreOperation::Save, session.id(), e))?;

        debug!(session_id = %session.id(), "Saved session");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let removed = self
            .collection
            .delete_many(&Filter::IdEquals(id.to_string()))
            .await
            .map_err(|e| self.mutation_failed(StoreOperation::Remove, id, e))?;

        debug!(session_id = %id, removed, "Removed session");
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let removed = self
            .collection
            .delete_many(&Filter::All)
            .await
            .map_err(|e| self.mutation_failed(StoreOperation::Clear, "*", e))?;

        info!(namespace = %self.collection.namespace(), removed, "Cleared session store");
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.collection.close().await.map_err(connection)
    }
}
