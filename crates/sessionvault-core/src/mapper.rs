//! Mapping between sessions and their persisted documents.

use chrono::{DateTime, Utc};

use crate::{
    Session,
    document::{Document, FieldValue, fields},
    error::StoreError,
};

/// Store-side expiration instant in epoch millis.
///
/// Derived from the last access plus the idle timeout. A non-positive timeout
/// never expires and maps to `i64::MAX`.
#[must_use]
pub fn expiration_millis(session: &Session) -> i64 {
    if session.max_inactive_interval() <= 0 {
        return i64::MAX;
    }
    session
        .last_accessed_time()
        .timestamp_millis()
        .saturating_add(i64::from(session.max_inactive_interval()) * 1000)
}

/// Build the full document for a session and its encoded payload.
#[must_use]
pub fn to_document(session: &Session, payload: Vec<u8>, modified_at: DateTime<Utc>) -> Document {
    Document::new()
        .with(fields::ID, FieldValue::String(session.id().to_string()))
        .with(
            fields::PRINCIPAL_NAME,
            FieldValue::String(session.principal_name().to_string()),
        )
        .with(
            fields::CREATION_TIME,
            FieldValue::Int(session.creation_time().timestamp_millis()),
        )
        .with(
            fields::EXPIRATION_TIME,
            FieldValue::Int(expiration_millis(session)),
        )
        .with(fields::DATA, FieldValue::Binary(payload))
        .with(fields::LAST_MODIFIED, FieldValue::DateTime(modified_at))
}

/// Extract the opaque payload from a document.
///
/// # Errors
/// Returns [`StoreError::MissingPayload`] if `data` is absent, empty or not
/// binary.
pub fn payload_from_document(document: &Document) -> Result<&[u8], StoreError> {
    match document.get_binary(fields::DATA) {
        Some(bytes) if !bytes.is_empty() => Ok(bytes),
        _ => Err(StoreError::MissingPayload(
            document.id().unwrap_or_default().to_string(),
        )),
    }
}
