//! In-memory session state.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;

use crate::error::CodecError;

/// Principal name recorded for sessions without an authenticated principal.
pub const UNKNOWN_PRINCIPAL: &str = "unknownPrincipal";

/// Default idle timeout for new sessions (seconds).
pub const DEFAULT_MAX_INACTIVE_INTERVAL: i32 = 1800;

/// Deepest document nesting an attribute may have. A top-level value is at
/// depth 0.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Current instant, truncated to the millisecond resolution the store keeps.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A session attribute value.
///
/// Attributes are restricted to the shapes the payload codec can encode, so an
/// unsupported value is rejected when it is set rather than when it is saved.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Document(BTreeMap<String, AttributeValue>),
    Binary(Vec<u8>),
}

impl AttributeValue {
    /// Get the value as a string slice, if it is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as an integer, if it is one.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get the value as a boolean, if it is one.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Name of the variant, used in diagnostics.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Document(_) => "document",
            Self::Binary(_) => "binary",
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<BTreeMap<String, Self>> for AttributeValue {
    fn from(value: BTreeMap<String, Self>) -> Self {
        Self::Document(value)
    }
}

impl TryFrom<Value> for AttributeValue {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_json(value, 0)
    }
}

impl AttributeValue {
    fn from_json(value: Value, depth: usize) -> Result<Self, CodecError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(CodecError::UnsupportedAttributeType(format!(
                "object nested deeper than {MAX_NESTING_DEPTH} levels"
            )));
        }
        match value {
            Value::String(s) => Ok(Self::String(s)),
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .ok_or_else(|| CodecError::UnsupportedAttributeType(format!("number {n}"))),
            Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| Self::from_json(v, depth + 1).map(|v| (k, v)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Self::Document),
            Value::Null => Err(CodecError::UnsupportedAttributeType("null".to_string())),
            Value::Array(_) => Err(CodecError::UnsupportedAttributeType("array".to_string())),
        }
    }
}

/// A server-side user session.
///
/// Identity and timestamps are read through accessors; the application only
/// mutates attributes and the principal. Access bookkeeping is driven by the
/// manager through [`Session::access`] and [`Session::end_access`].
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub(crate) id: String,
    pub(crate) principal: Option<String>,
    pub(crate) creation_time: DateTime<Utc>,
    pub(crate) last_accessed_time: DateTime<Utc>,
    pub(crate) this_accessed_time: DateTime<Utc>,
    pub(crate) max_inactive_interval: i32,
    pub(crate) is_new: bool,
    pub(crate) is_valid: bool,
    pub(crate) attributes: HashMap<String, AttributeValue>,
}

impl Session {
    /// Create a new, valid session created now.
    #[must_use]
    pub fn new(id: impl Into<String>, max_inactive_interval: i32) -> Self {
        let created = now();
        Self {
            id: id.into(),
            principal: None,
            creation_time: created,
            last_accessed_time: created,
            this_accessed_time: created,
            max_inactive_interval,
            is_new: true,
            is_valid: true,
            attributes: HashMap::new(),
        }
    }

    /// Blank session with no id, as handed out by a [`SessionFactory`].
    ///
    /// [`SessionFactory`]: crate::traits::SessionFactory
    #[must_use]
    pub fn empty(max_inactive_interval: i32) -> Self {
        let mut session = Self::new(String::new(), max_inactive_interval);
        session.is_valid = false;
        session
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Principal name as recorded in the session document.
    #[must_use]
    pub fn principal_name(&self) -> &str {
        self.principal.as_deref().unwrap_or(UNKNOWN_PRINCIPAL)
    }

    pub fn set_principal(&mut self, principal: Option<String>) {
        self.principal = principal;
    }

    #[must_use]
    pub const fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    #[must_use]
    pub const fn last_accessed_time(&self) -> DateTime<Utc> {
        self.last_accessed_time
    }

    #[must_use]
    pub const fn this_accessed_time(&self) -> DateTime<Utc> {
        self.this_accessed_time
    }

    /// Reset both access instants, e.g. when restoring a session's clock.
    pub fn set_last_accessed_time(&mut self, at: DateTime<Utc>) {
        self.last_accessed_time = at;
        self.this_accessed_time = at;
    }

    #[must_use]
    pub const fn max_inactive_interval(&self) -> i32 {
        self.max_inactive_interval
    }

    /// Set the idle timeout in seconds. Non-positive means never expire.
    pub fn set_max_inactive_interval(&mut self, seconds: i32) {
        self.max_inactive_interval = seconds;
    }

    #[must_use]
    pub const fn is_new(&self) -> bool {
        self.is_new
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.is_valid
    }

    /// Mark the session invalid. Invalid sessions are never swapped back in.
    pub fn invalidate(&mut self) {
        self.is_valid = false;
    }

    /// Record the start of a request using this session.
    pub fn access(&mut self) {
        let at = now();
        if at > self.this_accessed_time {
            self.this_accessed_time = at;
        }
    }

    /// Record the end of a request using this session.
    pub fn end_access(&mut self) {
        self.is_new = false;
        let at = now().max(self.this_accessed_time);
        self.last_accessed_time = at;
        self.this_accessed_time = at;
    }

    /// Whole seconds since the session was last touched.
    #[must_use]
    pub fn idle_seconds(&self, at: DateTime<Utc>) -> i64 {
        (at - self.this_accessed_time).num_seconds().max(0)
    }

    /// Whether the session's own idle timeout has elapsed at `at`.
    #[must_use]
    pub fn has_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.max_inactive_interval > 0
            && self.idle_seconds(at) >= i64::from(self.max_inactive_interval)
    }

    /// Get an attribute by key.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Set an attribute, returning the previous value.
    pub fn set_attribute(
        &mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Option<AttributeValue> {
        self.attributes.insert(key.into(), value.into())
    }

    /// Set an attribute from an arbitrary JSON value.
    ///
    /// # Errors
    /// Returns [`CodecError::UnsupportedAttributeType`] for `null` and arrays.
    pub fn set_json_attribute(
        &mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<Option<AttributeValue>, CodecError> {
        let value = AttributeValue::try_from(value)?;
        Ok(self.attributes.insert(key.into(), value))
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<AttributeValue> {
        self.attributes.remove(key)
    }

    #[must_use]
    pub const fn attributes(&self) -> &HashMap<String, AttributeValue> {
        &self.attributes
    }
}
