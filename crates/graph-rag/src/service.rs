//! Service facade over ingestion, scheduling and retrieval
//!
//! This is the surface collaborators use: knowledge base and document
//! management, task submission and status, operator actions and search.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::RagConfig;
use crate::error::{Error, Result};
use crate::ingestion::{content_hash, DocumentParser};
use crate::processing::{
    ExportPayload, ImportPayload, InProcessLauncher, ProcessLauncher, Scheduler, TaskContext, TaskRunner,
    WorkerLauncher,
};
use crate::providers::{OllamaClient, OllamaEmbedder, OllamaLlm, TesseractOcr};
use crate::retrieval::{LlmClassifier, RetrievalEngine};
use crate::storage::{LocalObjectStore, MetadataDb, SqliteQueue, VectorIndex, VectorSpace};
use crate::types::{
    Document, DocumentPassages, KnowledgeBase, ParserMethod, QueueName, SearchRequest, Task, TaskStatus,
    TaskStatusView, TaskType,
};

/// How the scheduler runs tasks
#[derive(Debug, Clone)]
pub enum WorkerMode {
    /// One `worker` process per task
    Process { config_path: Option<PathBuf> },
    /// Tasks run on the scheduler's own runtime
    InProcess,
}

pub struct RagService {
    ctx: Arc<TaskContext>,
    scheduler: Scheduler,
    retrieval: RetrievalEngine,
}

impl RagService {
    /// Open the stores under the configured data directory and connect the
    /// Ollama and tesseract backends
    pub fn open(config: RagConfig, mode: WorkerMode) -> Result<Self> {
        tracing::info!("Opening graph-rag data in {}", config.storage.data_dir.display());

        let db = Arc::new(MetadataDb::new(&config.storage.database_path())?);
        let ollama = Arc::new(OllamaClient::new(&config.llm)?);
        let ctx = TaskContext {
            queue: Arc::new(SqliteQueue::new(db.connection())),
            vectors: Arc::new(VectorIndex::new(db.connection())),
            blobs: Arc::new(LocalObjectStore::new(config.storage.blob_dir())?),
            parser: Arc::new(DocumentParser::new(&config.parser)?),
            embedder: Arc::new(OllamaEmbedder::new(Arc::clone(&ollama), &config.embeddings)),
            llm: Arc::new(OllamaLlm::new(ollama, &config.llm)),
            ocr: Arc::new(TesseractOcr::new(&config.ocr)),
            db,
            config,
        };
        Self::with_context(Arc::new(ctx), mode)
    }

    /// Build the service over an existing context
    pub fn with_context(ctx: Arc<TaskContext>, mode: WorkerMode) -> Result<Self> {
        let launcher: Arc<dyn WorkerLauncher> = match mode {
            WorkerMode::Process { config_path } => Arc::new(ProcessLauncher::new(
                ctx.config.scheduler.worker_program.clone(),
                config_path,
            )?),
            WorkerMode::InProcess => Arc::new(InProcessLauncher::new(Arc::new(TaskRunner::new(Arc::clone(&ctx))))),
        };

        let mut retrieval = RetrievalEngine::new(
            Arc::clone(&ctx.db),
            Arc::clone(&ctx.vectors),
            Arc::clone(&ctx.embedder),
            ctx.config.retrieval.clone(),
        );
        if ctx.config.retrieval.arbitration_enabled {
            retrieval = retrieval.with_classifier(Arc::new(LlmClassifier::new(
                Arc::clone(&ctx.llm),
                ctx.config.retrieval.llm_timeout(),
            )));
        }

        Ok(Self {
            scheduler: Scheduler::new(Arc::clone(&ctx), launcher),
            retrieval,
            ctx,
        })
    }

    pub fn context(&self) -> &Arc<TaskContext> {
        &self.ctx
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run the scheduler loops until `shutdown` flips to true
    pub async fn serve(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.scheduler.run(shutdown).await
    }

    /// Create a knowledge base; its vector dimension is fixed from here on
    pub fn create_knowledge_base(&self, name: &str, dimension: Option<usize>) -> Result<KnowledgeBase> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Config("Knowledge base name must not be empty".into()));
        }
        let dimension = dimension.unwrap_or(self.ctx.config.embeddings.dimensions);
        let kb = KnowledgeBase::new(name, self.ctx.embedder.model(), dimension);
        self.ctx.db.insert_knowledge_base(&kb)?;
        self.ctx.vectors.ensure_space(VectorSpace::KnowledgeBase(kb.id), dimension)?;
        tracing::info!("Created knowledge base '{}' ({}, dimension {})", kb.name, kb.id, dimension);
        Ok(kb)
    }

    pub fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>> {
        self.ctx.db.list_knowledge_bases()
    }

    pub fn list_documents(&self, kb_id: Uuid) -> Result<Vec<Document>> {
        self.ctx.db.list_documents(kb_id)
    }

    /// Delete a knowledge base, stopping its tasks and removing every document
    pub async fn delete_knowledge_base(&self, kb_id: Uuid) -> Result<usize> {
        self.ctx.db.require_knowledge_base(kb_id)?;
        for task in self.ctx.db.active_tasks_for(kb_id)? {
            self.scheduler.delete_task(task.id).await?;
        }
        for doc in self.ctx.db.list_documents(kb_id)? {
            for task in self.ctx.db.active_tasks_for(doc.id)? {
                self.scheduler.delete_task(task.id).await?;
            }
        }
        self.ctx.clear_knowledge_base(kb_id, true).await
    }

    /// Store a file as a new pending document of a knowledge base (or a
    /// temporary document when `kb_id` is `None`)
    pub async fn add_document(
        &self,
        kb_id: Option<Uuid>,
        path: &Path,
        method: ParserMethod,
        chunk_token_budget: Option<usize>,
    ) -> Result<Document> {
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::Config(format!("Not a file path: {}", path.display())))?;
        self.add_document_bytes(kb_id, &name, &data, method, chunk_token_budget).await
    }

    /// Same as [`add_document`](Self::add_document) for in-memory content.
    /// Identical content already in the same scope returns the existing document.
    pub async fn add_document_bytes(
        &self,
        kb_id: Option<Uuid>,
        name: &str,
        data: &[u8],
        method: ParserMethod,
        chunk_token_budget: Option<usize>,
    ) -> Result<Document> {
        if let Some(kb_id) = kb_id {
            self.ctx.db.require_knowledge_base(kb_id)?;
        }
        let hash = content_hash(data);
        if let Some(existing) = self.ctx.db.find_document_by_hash(kb_id, &hash)? {
            tracing::info!("Document '{}' already stored as {}", name, existing.id);
            return Ok(existing);
        }

        let blob_id = self.ctx.blobs.put_new(data).await?;
        let budget = chunk_token_budget.unwrap_or(self.ctx.config.chunking.chunk_token_budget);
        let doc = Document::new(kb_id, name, method, budget, blob_id, hash);
        self.ctx.db.insert_document(&doc)?;
        tracing::info!("Added document '{}' ({}, {} bytes)", doc.name, doc.id, data.len());
        Ok(doc)
    }

    /// Enqueue a parse of a document and return immediately. A document with
    /// a pending or running parse returns that task instead.
    pub fn submit_parse_task(&self, document_id: Uuid) -> Result<Uuid> {
        let doc = self.ctx.db.require_document(document_id)?;
        if let Some(active) = self.ctx.db.active_tasks_for(doc.id)?.into_iter().next() {
            tracing::info!("[{}] Document {} already has an active task", active.id, doc.id);
            return Ok(active.id);
        }
        let task_type = if doc.is_temporary() {
            TaskType::ParseTemporaryDocument
        } else {
            TaskType::ParseDocument
        };
        self.enqueue(Task::new(doc.id, task_type))
    }

    /// Enqueue an export; returns the task id and the blob the export is
    /// written to
    pub fn submit_export(&self, kb_id: Uuid) -> Result<(Uuid, Uuid)> {
        self.ctx.db.require_knowledge_base(kb_id)?;
        let payload = ExportPayload {
            export_blob_id: Uuid::new_v4(),
        };
        let task = Task::new(kb_id, TaskType::ExportKb).with_payload(serde_json::to_value(&payload)?);
        Ok((self.enqueue(task)?, payload.export_blob_id))
    }

    /// Store an export blob and enqueue its import; returns the task id and
    /// the id of the knowledge base it creates
    pub async fn submit_import(&self, export: &[u8], name: Option<String>) -> Result<(Uuid, Uuid)> {
        let payload = ImportPayload {
            source_blob_id: self.ctx.blobs.put_new(export).await?,
            name,
        };
        let kb_id = Uuid::new_v4();
        let task = Task::new(kb_id, TaskType::ImportKb).with_payload(serde_json::to_value(&payload)?);
        Ok((self.enqueue(task)?, kb_id))
    }

    /// Read a blob, e.g. a finished export
    pub async fn read_blob(&self, blob_id: Uuid) -> Result<Vec<u8>> {
        self.ctx.blobs.get(blob_id).await
    }

    pub fn get_status(&self, task_id: Uuid) -> Result<TaskStatusView> {
        let task = self.ctx.db.require_task(task_id)?;
        Ok(TaskStatusView {
            status: task.status,
            retry: task.retry,
            reports: self.ctx.db.status_reports(task_id)?,
        })
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> Result<TaskStatus> {
        self.scheduler.cancel_task(task_id).await
    }

    pub async fn delete_task(&self, task_id: Uuid) -> Result<TaskStatus> {
        self.scheduler.delete_task(task_id).await
    }

    /// Enable or disable a document for retrieval
    pub fn set_document_enabled(&self, document_id: Uuid, enabled: bool) -> Result<()> {
        let doc = self.ctx.db.require_document(document_id)?;
        self.ctx.db.set_document_enabled(doc.id, enabled)?;
        self.ctx
            .vectors
            .set_document_enabled(TaskContext::vector_space(&doc), doc.id, enabled)
    }

    /// Delete a document, its active tasks and everything derived from it
    pub async fn delete_document(&self, document_id: Uuid) -> Result<bool> {
        for task in self.ctx.db.active_tasks_for(document_id)? {
            self.scheduler.delete_task(task.id).await?;
        }
        self.ctx.delete_document(document_id).await
    }

    /// Hybrid search returning per-document passages within the token budget
    pub async fn get_similar_chunks(&self, request: &SearchRequest) -> Result<Vec<DocumentPassages>> {
        self.retrieval.search(request).await
    }

    fn enqueue(&self, task: Task) -> Result<Uuid> {
        self.ctx.db.insert_task(&task)?;
        self.ctx.queue.enqueue(QueueName::Pending, task.id)?;
        tracing::info!("[{}] Submitted {} for {}", task.id, task.task_type.as_str(), task.operation_id);
        Ok(task.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, STUB_DIMENSIONS};
    use crate::types::{DocumentStatus, SearchScope};
    use std::time::Duration;

    fn service() -> (RagService, tempfile::TempDir) {
        let (ctx, dir) = context();
        (RagService::with_context(ctx, WorkerMode::InProcess).unwrap(), dir)
    }

    async fn drain(service: &RagService) {
        let scheduler = service.scheduler();
        for _ in 0..200 {
            scheduler.monitor_once().await.unwrap();
            scheduler.poll_once().await.unwrap();
            let idle = scheduler.supervisor().active_count() == 0
                && service.context().queue.len(QueueName::Pending).unwrap() == 0;
            if idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tasks did not finish");
    }

    #[tokio::test]
    async fn test_ingest_then_search() {
        let (service, dir) = service();
        let kb = service.create_knowledge_base("docs", Some(STUB_DIMENSIONS)).unwrap();
        let path = dir.path().join("guide.md");
        std::fs::write(
            &path,
            "# Guide\n\n## Scheduling\n\nThe poll loop starts pending tasks.\n\n## Retrieval\n\nSearch mixes keywords and vectors.\n",
        )
        .unwrap();

        let doc = service.add_document(Some(kb.id), &path, ParserMethod::General, None).await.unwrap();
        let task_id = service.submit_parse_task(doc.id).unwrap();
        assert_eq!(service.submit_parse_task(doc.id).unwrap(), task_id);
        drain(&service).await;

        let status = service.get_status(task_id).unwrap();
        assert_eq!(status.status, TaskStatus::Success);
        assert_eq!(status.retry, 0);
        assert_eq!(status.reports.last().unwrap().message, "done");

        let request = SearchRequest::new("poll loop", SearchScope::KnowledgeBase(kb.id), 2, 200);
        let result = service.get_similar_chunks(&request).await.unwrap();
        assert_eq!(result.len(), 1);
        assert!(result[0].passages.iter().any(|p| p.contains("poll loop")));
    }

    #[tokio::test]
    async fn test_duplicate_content_returns_existing_document() {
        let (service, _dir) = service();
        let kb = service.create_knowledge_base("docs", None).unwrap();
        let first = service
            .add_document_bytes(Some(kb.id), "a.txt", b"same", ParserMethod::General, None)
            .await
            .unwrap();
        let second = service
            .add_document_bytes(Some(kb.id), "b.txt", b"same", ParserMethod::General, None)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_disabled_document_is_hidden() {
        let (service, _dir) = service();
        let kb = service.create_knowledge_base("docs", Some(STUB_DIMENSIONS)).unwrap();
        let doc = service
            .add_document_bytes(Some(kb.id), "a.txt", b"hidden treasure map", ParserMethod::General, None)
            .await
            .unwrap();
        service.submit_parse_task(doc.id).unwrap();
        drain(&service).await;

        let request = SearchRequest::new("treasure", SearchScope::KnowledgeBase(kb.id), 2, 100);
        assert_eq!(service.get_similar_chunks(&request).await.unwrap().len(), 1);
        service.set_document_enabled(doc.id, false).unwrap();
        assert!(service.get_similar_chunks(&request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_document_cascades() {
        let (service, _dir) = service();
        let kb = service.create_knowledge_base("docs", Some(STUB_DIMENSIONS)).unwrap();
        let doc = service
            .add_document_bytes(Some(kb.id), "a.txt", b"content to delete", ParserMethod::General, None)
            .await
            .unwrap();
        service.submit_parse_task(doc.id).unwrap();
        drain(&service).await;
        assert_eq!(service.context().db.require_document(doc.id).unwrap().status, DocumentStatus::Pending);

        assert!(service.delete_document(doc.id).await.unwrap());
        let ctx = service.context();
        assert!(ctx.db.get_document(doc.id).unwrap().is_none());
        assert_eq!(ctx.db.count_chunks(doc.id).unwrap(), 0);
        assert!(!ctx.blobs.exists(doc.blob_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let (service, _dir) = service();
        let doc = service
            .add_document_bytes(None, "tmp.txt", b"temporary", ParserMethod::General, None)
            .await
            .unwrap();
        let task_id = service.submit_parse_task(doc.id).unwrap();
        assert_eq!(service.cancel_task(task_id).await.unwrap(), TaskStatus::Canceled);
        assert_eq!(service.context().queue.len(QueueName::Pending).unwrap(), 0);
        assert_eq!(service.delete_task(task_id).await.unwrap(), TaskStatus::Deleted);
    }

    #[tokio::test]
    async fn test_empty_name_is_rejected() {
        let (service, _dir) = service();
        assert!(matches!(service.create_knowledge_base("  ", None), Err(Error::Config(_))));
    }
}
