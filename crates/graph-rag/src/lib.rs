//! graph-rag: knowledge-base ingestion and hybrid retrieval
//!
//! Documents are parsed into a graph of linked chunks by supervised worker
//! processes fed from durable queues, then embedded and indexed per
//! knowledge base. Queries mix full-text and vector candidates and expand
//! them into passages that fit a caller-supplied token budget.

pub mod chunking;
pub mod config;
pub mod error;
pub mod ingestion;
pub mod processing;
pub mod providers;
pub mod retrieval;
pub mod service;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::RagConfig;
pub use error::{Error, Result};
pub use service::{RagService, WorkerMode};
pub use types::{
    Chunk, ChunkLink, Document, DocumentPassages, KnowledgeBase, ParserMethod, SearchRequest, SearchScope,
    Task, TaskStatus, TaskStatusView,
};
