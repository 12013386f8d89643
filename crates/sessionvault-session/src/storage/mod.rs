//! Document collection drivers.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "mongodb")]
pub mod mongodb;

#[cfg(feature = "memory")]
pub use memory::{MemoryCollection, MemoryServer};

#[cfg(feature = "mongodb")]
pub use self::mongodb::{MongoCollection, MongoDriver};
