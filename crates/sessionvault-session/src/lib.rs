//! Session persistence and management over a document database.
//!
//! Provides:
//! - `SessionManager` - In-memory working set with swap, backup and expiry
//! - `DocumentSessionStore` - One document per session in a single collection
//! - Collection drivers (memory, MongoDB)

pub mod manager;
pub mod storage;
pub mod store;

pub use manager::{ConnectionSource, ManagerError, SessionManager, SessionManagerBuilder};
pub use store::DocumentSessionStore;
