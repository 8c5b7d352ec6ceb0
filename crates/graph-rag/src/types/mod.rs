//! Core types of the document graph, task scheduler and retrieval engine

pub mod chunk;
pub mod document;
pub mod query;
pub mod task;

pub use chunk::{
    BigType, Chunk, ChunkAttr, ChunkLink, ChunkType, LinkJump, LinkModel, LinkScope, LinkType,
    Structure,
};
pub use document::{
    Document, DocumentStatus, ExportStatus, FileType, KnowledgeBase, ParserMethod,
};
pub use query::{DocumentPassages, SearchRequest, SearchScope, TaskStatusView};
pub use task::{QueueName, Task, TaskAction, TaskStatus, TaskStatusReport, TaskType};
