//! Storage module for persistent data storage
//!
//! SQLite holds the metadata tables, the durable queues and the vector
//! tables in one database file; blobs live in an object store.

mod blobs;
mod chunks;
mod database;
mod queue;
mod tasks;
mod vectors;

pub use blobs::{LocalObjectStore, ObjectStore};
pub use chunks::KeywordHit;
pub use database::MetadataDb;
pub use queue::{DurableQueue, SqliteQueue};
pub use vectors::{VectorIndex, VectorItem, VectorMatch, VectorSpace};

#[cfg(test)]
pub(crate) use chunks::tests::{seed_document, text_chunk};
