//! Generic key/value document representation used by collection drivers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Field names of a persisted session document.
pub mod fields {
    pub const ID: &str = "_id";
    pub const PRINCIPAL_NAME: &str = "principalName";
    pub const CREATION_TIME: &str = "creationTime";
    pub const EXPIRATION_TIME: &str = "expirationTime";
    pub const DATA: &str = "data";
    pub const LAST_MODIFIED: &str = "lastModified";
}

/// A single document field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    String(String),
    Int(i64),
    DateTime(DateTime<Utc>),
    Binary(Vec<u8>),
}

/// A schema-flexible record.
///
/// Fields are kept ordered by name, so two documents with the same fields are
/// equal no matter the order they were inserted in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    fields: BTreeMap<String, FieldValue>,
}

impl Document {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.fields.insert(key.into(), value)
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(FieldValue::String(s)) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.fields.get(key) {
            Some(FieldValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_binary(&self, key: &str) -> Option<&[u8]> {
        match self.fields.get(key) {
            Some(FieldValue::Binary(b)) => Some(b),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.fields.remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The document's primary key.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.get_str(fields::ID)
    }
}

/// Query filter understood by every collection driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    IdEquals(String),
    /// Documents whose `expirationTime` is strictly before the given epoch millis.
    ExpiresBefore(i64),
}

impl Filter {
    /// Evaluate the filter against a document.
    #[must_use]
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Self::All => true,
            Self::IdEquals(id) => document.id() == Some(id.as_str()),
            Self::ExpiresBefore(millis) => document
                .get_i64(fields::EXPIRATION_TIME)
                .is_some_and(|expires| expires < *millis),
        }
    }
}

/// Result ordering for `find`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sort {
    #[default]
    Natural,
    IdAscending,
}
