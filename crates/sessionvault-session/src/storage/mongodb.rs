//! MongoDB collection driver (feature-gated).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use futures::TryStreamExt;
use mongodb::{
    Client, Collection,
    bson::{self, Bson, doc, spec::BinarySubtype},
    error::{Error as MongoError, ErrorKind},
    options::{ClientOptions, Credential, ServerAddress as MongoAddress},
};
use sessionvault_core::{
    ConnectionSettings, Document, DocumentCollection, DocumentDriver, FieldValue, Filter, Sort,
    document::fields, error::CollectionError,
};

/// Server error code for "namespace already exists".
const NAMESPACE_EXISTS: i32 = 48;

/// Opens [`MongoCollection`] handles from connection settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoDriver;

#[async_trait]
impl DocumentDriver for MongoDriver {
    async fn connect(
        &self,
        settings: &ConnectionSettings,
        database: &str,
        collection: &str,
    ) -> Result<Arc<dyn DocumentCollection>, CollectionError> {
        let hosts = settings
            .hosts
            .iter()
            .map(|addr| MongoAddress::Tcp {
                host: addr.host.clone(),
                port: Some(addr.port),
            })
            .collect();
        let credential = Credential::builder()
            .username(settings.username.clone())
            .password(settings.password.clone())
            .source(settings.admin_database.clone())
            .build();
        let options = ClientOptions::builder()
            .hosts(hosts)
            .credential(credential)
            .build();
        let client = Client::with_options(options).map_err(backend)?;
        Ok(Arc::new(MongoCollection::new(client, database, collection)))
    }
}

/// A MongoDB collection of session documents.
pub struct MongoCollection {
    client: Client,
    database: String,
    name: String,
    collection: Collection<bson::Document>,
}

impl MongoCollection {
    /// Wrap a collection of an existing client.
    #[must_use]
    pub fn new(client: Client, database: &str, collection: &str) -> Self {
        let handle = client.database(database).collection(collection);
        Self {
            client,
            database: database.to_string(),
            name: collection.to_string(),
            collection: handle,
        }
    }
}

fn backend(e: MongoError) -> CollectionError {
    CollectionError::Backend(e.to_string())
}

fn filter_to_bson(filter: &Filter) -> bson::Document {
    match filter {
        Filter::All => doc! {},
        Filter::IdEquals(id) => by_id(id),
        Filter::ExpiresBefore(millis) => {
            let mut query = bson::Document::new();
            query.insert(fields::EXPIRATION_TIME, doc! { "$lt": *millis });
            query
        }
    }
}

fn by_id(id: &str) -> bson::Document {
    let mut query = bson::Document::new();
    query.insert(fields::ID, id);
    query
}

fn to_bson(document: Document) -> bson::Document {
    let mut out = bson::Document::new();
    for (key, value) in document.iter() {
        let value = match value {
            FieldValue::String(s) => Bson::String(s.clone()),
            FieldValue::Int(i) => Bson::Int64(*i),
            FieldValue::DateTime(at) => {
                Bson::DateTime(bson::DateTime::from_millis(at.timestamp_millis()))
            }
            FieldValue::Binary(bytes) => Bson::Binary(bson::Binary {
                subtype: BinarySubtype::Generic,
                bytes: bytes.clone(),
            }),
        };
        out.insert(key, value);
    }
    out
}

fn from_bson(raw: bson::Document) -> Document {
    let mut out = Document::new();
    for (key, value) in raw {
        let value = match value {
            Bson::String(s) => FieldValue::String(s),
            Bson::Int64(i) => FieldValue::Int(i),
            Bson::Int32(i) => FieldValue::Int(i64::from(i)),
            Bson::DateTime(at) => match DateTime::from_timestamp_millis(at.timestamp_millis()) {
                Some(at) => FieldValue::DateTime(at),
                None => continue,
            },
            Bson::Binary(binary) => FieldValue::Binary(binary.bytes),
            _ => continue,
        };
        out.insert(key, value);
    }
    out
}

#[async_trait]
impl DocumentCollection for MongoCollection {
    fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }

    async fn create_collection(&self) -> Result<(), CollectionError> {
        match self
            .client
            .database(&self.database)
            .create_collection(&self.name)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => match *e.kind {
                ErrorKind::Command(ref command) if command.code == NAMESPACE_EXISTS => {
                    Err(CollectionError::AlreadyExists(self.namespace()))
                }
                _ => Err(backend(e)),
            },
        }
    }

    async fn find(&self, filter: &Filter, sort: Sort) -> Result<Vec<Document>, CollectionError> {
        let mut query = self.collection.find(filter_to_bson(filter));
        if sort == Sort::IdAscending {
            let mut order = bson::Document::new();
            order.insert(fields::ID, 1);
            query = query.sort(order);
        }
        let cursor = query.await.map_err(backend)?;
        let raw: Vec<bson::Document> = cursor.try_collect().await.map_err(backend)?;
        Ok(raw.into_iter().map(from_bson).collect())
    }

    async fn replace_one_upsert(
        &self,
        id: &str,
        document: Document,
    ) -> Result<(), CollectionError> {
        self.collection
            .replace_one(by_id(id), to_bson(document))
            .upsert(true)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn delete_many(&self, filter: &Filter) -> Result<u64, CollectionError> {
        let result = self
            .collection
            .delete_many(filter_to_bson(filter))
            .await
            .map_err(backend)?;
        Ok(result.deleted_count)
    }

    async fn count(&self) -> Result<u64, CollectionError> {
        self.collection
            .count_documents(doc! {})
            .await
            .map_err(backend)
    }

    async fn close(&self) -> Result<(), CollectionError> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}
