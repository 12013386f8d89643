//! In-memory document collection.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use sessionvault_core::{
    ConnectionSettings, Document, DocumentCollection, DocumentDriver, Filter, Sort,
    error::CollectionError,
};

#[derive(Default)]
struct CollectionState {
    created: AtomicBool,
    unavailable: AtomicBool,
    documents: RwLock<HashMap<String, Document>>,
}

/// In-process stand-in for a document database server.
///
/// Every handle to the same database/collection pair shares one set of
/// documents, so several managers can be pointed at one collection.
/// Useful for development and tests. Data is lost on restart.
#[derive(Default)]
pub struct MemoryServer {
    collections: RwLock<HashMap<(String, String), Arc<CollectionState>>>,
}

impl MemoryServer {
    /// Create a new, empty server.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a handle to a collection. The collection is not created until
    /// [`DocumentCollection::create_collection`] is called on some handle.
    #[must_use]
    pub fn collection(&self, database: &str, collection: &str) -> Arc<MemoryCollection> {
        let key = (database.to_string(), collection.to_string());
        let state = {
            let mut collections = self
                .collections
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(collections.entry(key).or_default())
        };
        Arc::new(MemoryCollection {
            namespace: format!("{database}.{collection}"),
            state,
            closed: AtomicBool::new(false),
        })
    }

    /// Names of the collections created in a database, sorted.
    #[must_use]
    pub fn collection_names(&self, database: &str) -> Vec<String> {
        let collections = self
            .collections
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut names: Vec<String> = collections
            .iter()
            .filter(|((db, _), state)| db == database && state.created.load(Ordering::SeqCst))
            .map(|((_, name), _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl DocumentDriver for MemoryServer {
    async fn connect(
        &self,
        _settings: &ConnectionSettings,
        database: &str,
        collection: &str,
    ) -> Result<Arc<dyn DocumentCollection>, CollectionError> {
        Ok(self.collection(database, collection))
    }
}

/// Handle to one collection of a [`MemoryServer`].
pub struct MemoryCollection {
    namespace: String,
    state: Arc<CollectionState>,
    closed: AtomicBool,
}

impl MemoryCollection {
    /// Simulate the backing service going away (or coming back) for every
    /// handle to this collection.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Whether this handle has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Insert or replace a raw document, bypassing the session codec.
    ///
    /// # Errors
    /// Returns error if the document has no id or the collection is unusable.
    pub fn put_raw(&self, document: Document) -> Result<(), CollectionError> {
        self.check()?;
        let id = document
            .id()
            .ok_or_else(|| CollectionError::Backend("document has no _id".to_string()))?
            .to_string();
        self.write()?.insert(id, document);
        Ok(())
    }

    /// Fetch a raw document by id.
    ///
    /// # Errors
    /// Returns error if the collection is unusable.
    pub fn get_raw(&self, id: &str) -> Result<Option<Document>, CollectionError> {
        self.check()?;
        Ok(self.read()?.get(id).cloned())
    }

    fn check(&self) -> Result<(), CollectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CollectionError::Backend(format!(
                "connection to {} is closed",
                self.namespace
            )));
        }
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(CollectionError::Backend(format!(
                "{} is unavailable",
                self.namespace
            )));
        }
        Ok(())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Document>>, CollectionError> {
        self.state
            .documents
            .read()
            .map_err(|e| CollectionError::Backend(e.to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Document>>, CollectionError> {
        self.state
            .documents
            .write()
            .map_err(|e| CollectionError::Backend(e.to_string()))
    }
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    async fn create_collection(&self) -> Result<(), CollectionError> {
        self.check()?;
        if self.state.created.swap(true, Ordering::SeqCst) {
            return Err(CollectionError::AlreadyExists(self.namespace.clone()));
        }
        Ok(())
    }

    async fn find(&self, filter: &Filter, sort: Sort) -> Result<Vec<Document>, CollectionError> {
        self.check()?;
        let mut result: Vec<Document> = self
            .read()?
            .values()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect();

        if sort == Sort::IdAscending {
            result.sort_by(|a, b| a.id().cmp(&b.id()));
        }

        Ok(result)
    }

    async fn replace_one_upsert(
        &self,
        id: &str,
        document: Document,
    ) -> Result<(), CollectionError> {
        self.check()?;
        self.write()?.insert(id.to_string(), document);
        Ok(())
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64, CollectionError> {
        self.check()?;
        let mut documents = self.write()?;
        let before = documents.len();
        documents.retain(|_, doc| !filter.matches(doc));
        Ok((before - documents.len()) as u64)
    }

    async fn count(&self) -> Result<u64, CollectionError> {
        self.check()?;
        Ok(self.read()?.len() as u64)
    }

    async fn close(&self) -> Result<(), CollectionError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
