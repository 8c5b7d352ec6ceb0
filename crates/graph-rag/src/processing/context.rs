//! Shared handles of the stores and providers used by tasks

use std::sync::Arc;
use uuid::Uuid;

use super::transfer;
use crate::config::RagConfig;
use crate::error::Result;
use crate::ingestion::DocumentParser;
use crate::providers::{EmbeddingProvider, LlmProvider, OcrProvider};
use crate::storage::{DurableQueue, MetadataDb, ObjectStore, VectorIndex, VectorSpace};
use crate::types::{Document, DocumentStatus, Task, TaskStatusReport, TaskType};

/// Everything a task needs to run or to be rolled back
#[derive(Clone)]
pub struct TaskContext {
    pub config: RagConfig,
    pub db: Arc<MetadataDb>,
    pub queue: Arc<dyn DurableQueue>,
    pub vectors: Arc<VectorIndex>,
    pub blobs: Arc<dyn ObjectStore>,
    pub parser: Arc<DocumentParser>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub ocr: Arc<dyn OcrProvider>,
}

impl TaskContext {
    /// Vector table of a document
    pub fn vector_space(doc: &Document) -> VectorSpace {
        match doc.kb_id {
            Some(kb_id) => VectorSpace::KnowledgeBase(kb_id),
            None => VectorSpace::Temporary,
        }
    }

    /// Append a status report; a failing report never fails the task
    pub fn report(&self, task_id: Uuid, message: impl Into<String>, stage: u32, stage_count: u32) {
        let report = TaskStatusReport::new(task_id, message, stage, stage_count);
        tracing::info!("[{}] {}/{} {}", task_id, stage, stage_count, report.message);
        if let Err(e) = self.db.add_status_report(&report) {
            tracing::warn!("[{}] Failed to record status report: {}", task_id, e);
        }
    }

    /// Remove everything parsing produced for a document: chunks, links,
    /// vectors and extracted image blobs. The document row and its input
    /// blob stay.
    pub async fn purge_document_content(&self, doc: &Document) -> Result<usize> {
        let images = self.db.image_blob_ids(doc.id)?;
        let removed = self.db.delete_chunks(doc.id)?;
        self.vectors.delete_document(Self::vector_space(doc), doc.id)?;
        for blob_id in images {
            self.blobs.delete(blob_id).await?;
        }
        Ok(removed)
    }

    /// Undo a partial parse and mark the document idle again
    pub async fn rollback_document(&self, doc_id: Uuid) -> Result<()> {
        let Some(doc) = self.db.get_document(doc_id)? else {
            return Ok(());
        };
        let removed = self.purge_document_content(&doc).await?;
        self.db.set_document_status(doc_id, DocumentStatus::Pending)?;
        if removed > 0 {
            tracing::info!("Rolled back {} chunks of document {}", removed, doc_id);
        }
        Ok(())
    }

    /// Undo the partial side effects of a task. `terminal` also removes
    /// external blobs owned by import/export tasks.
    pub async fn rollback_task(&self, task: &Task, terminal: bool) -> Result<()> {
        match task.task_type {
            TaskType::ParseDocument | TaskType::ParseTemporaryDocument => {
                self.rollback_document(task.operation_id).await
            }
            TaskType::ImportKb => transfer::rollback_import(self, task, terminal).await,
            TaskType::ExportKb => transfer::rollback_export(self, task).await,
        }
    }

    /// Delete a document and everything derived from it
    pub async fn delete_document(&self, doc_id: Uuid) -> Result<bool> {
        let Some(doc) = self.db.get_document(doc_id)? else {
            return Ok(false);
        };
        self.db.mark_document_deleted(doc_id)?;
        self.purge_document_content(&doc).await?;
        self.blobs.delete(doc.blob_id).await?;
        self.db.delete_document(doc_id)
    }

    /// Delete every document of a knowledge base, its vector table and,
    /// when `drop_base` is set, the knowledge base itself
    pub async fn clear_knowledge_base(&self, kb_id: Uuid, drop_base: bool) -> Result<usize> {
        let docs = self.db.list_documents(kb_id)?;
        for doc in &docs {
            self.delete_document(doc.id).await?;
        }
        self.vectors.drop_space(VectorSpace::KnowledgeBase(kb_id))?;
        if drop_base {
            self.db.delete_knowledge_base(kb_id)?;
        }
        Ok(docs.len())
    }
}
