//! Task runner executed inside a worker process
//!
//! A run reports every stage to the status log and finishes by routing the
//! task id to the `success`, `restart` or `silent-error` queue. The scheduler
//! owns every status transition after that.

use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use super::context::TaskContext;
use super::transfer;
use crate::chunking::tokens::count_tokens;
use crate::chunking::{ChunkBuilder, ChunkGraph, ExtractedImage, MergePolicy};
use crate::error::{Error, Result};
use crate::storage::VectorItem;
use crate::types::{Chunk, DocumentStatus, ParserMethod, QueueName, Task, TaskStatus, TaskType};

/// Runs one task to completion
pub struct TaskRunner {
    ctx: Arc<TaskContext>,
}

impl TaskRunner {
    pub fn new(ctx: Arc<TaskContext>) -> Self {
        Self { ctx }
    }

    /// Run a task and route its outcome.
    ///
    /// Returns `Err` only when the outcome could not be recorded; a failed
    /// task whose failure was routed is `Ok`.
    pub async fn run(&self, task_id: Uuid) -> Result<()> {
        let task = self.ctx.db.require_task(task_id)?;
        if task.status.is_terminal() {
            tracing::info!("[{}] Task is already {}, nothing to do", task_id, task.status.as_str());
            return Ok(());
        }
        self.ctx.db.set_task_status(task_id, TaskStatus::Running)?;

        let stage_count = task.task_type.stage_count();
        let outcome = self.execute(&task).await;

        // Cleared by an operator while running
        let current = self.ctx.db.require_task(task_id)?;
        if current.status.is_terminal() {
            tracing::warn!("[{}] Task became {} while running, discarding", task_id, current.status.as_str());
            return self.ctx.rollback_task(&current, true).await;
        }

        match outcome {
            Ok(()) => {
                self.ctx.db.set_task_status(task_id, TaskStatus::Success)?;
                if is_parse(task.task_type) {
                    self.ctx.db.set_document_status(task.operation_id, DocumentStatus::Pending)?;
                }
                self.ctx.report(task_id, "done", stage_count, stage_count);
                self.ctx.queue.enqueue(QueueName::Success, task_id)?;
            }
            Err(e) => {
                let queue = if e.is_retryable() {
                    QueueName::Restart
                } else {
                    QueueName::SilentError
                };
                tracing::error!("[{}] Task failed: {}", task_id, e);
                self.ctx.report(task_id, format!("failed: {}", e), 0, stage_count);
                self.ctx.queue.enqueue(queue, task_id)?;
            }
        }
        Ok(())
    }

    async fn execute(&self, task: &Task) -> Result<()> {
        match task.task_type {
            TaskType::ParseDocument | TaskType::ParseTemporaryDocument => self.parse_document(task).await,
            TaskType::ImportKb => transfer::import_knowledge_base(&self.ctx, task).await,
            TaskType::ExportKb => transfer::export_knowledge_base(&self.ctx, task).await,
        }
    }

    /// open → parse → chunk → ocr → embed → persist
    async fn parse_document(&self, task: &Task) -> Result<()> {
        let ctx = &self.ctx;
        let stages = task.task_type.stage_count();
        let doc = ctx.db.require_document(task.operation_id)?;
        if (task.task_type == TaskType::ParseTemporaryDocument) != doc.is_temporary() {
            return Err(Error::Config(format!(
                "{} task cannot parse document {}",
                task.task_type.as_str(),
                doc.id
            )));
        }

        ctx.db.set_document_status(doc.id, DocumentStatus::Running)?;
        let stale = ctx.purge_document_content(&doc).await?;
        if stale > 0 {
            tracing::info!("[{}] Removed {} chunks of a previous attempt", task.id, stale);
        }

        ctx.report(task.id, format!("open {}", doc.name), 1, stages);
        let data = ctx.blobs.get(doc.blob_id).await?;

        ctx.report(task.id, format!("parse {} bytes", data.len()), 2, stages);
        let parsed = ctx.parser.parse_bytes(Path::new(&doc.name), &data, None).await?;

        let budget = if doc.chunk_token_budget > 0 {
            doc.chunk_token_budget
        } else {
            ctx.config.chunking.chunk_token_budget
        };
        let policy = MergePolicy::new(budget, ctx.config.chunking.merge_similarity_threshold);
        let mut graph = ChunkBuilder::new(doc.id, doc.parser_method, policy).build(parsed);
        ctx.report(
            task.id,
            format!("chunk: {} chunks, {} links", graph.chunks.len(), graph.links.len()),
            3,
            stages,
        );

        let recognised = self.recognise_images(&mut graph, doc.parser_method).await;
        ctx.report(task.id, format!("ocr: {} images", recognised), 4, stages);

        let space = TaskContext::vector_space(&doc);
        let dimension = match doc.kb_id {
            Some(kb_id) => ctx.db.require_knowledge_base(kb_id)?.dimension,
            None => ctx.config.embeddings.dimensions,
        };
        let vectors = embed_chunks(ctx, &graph.chunks, dimension).await?;
        ctx.report(task.id, format!("embed: {} vectors", vectors.len()), 5, stages);

        ctx.db.insert_chunk_graph(&graph.chunks, &graph.links)?;
        for image in &graph.images {
            ctx.blobs.put(image.blob_id, &image.data).await?;
        }
        ctx.vectors.ensure_space(space, dimension)?;
        ctx.vectors.upsert(space, &vectors)?;
        ctx.report(task.id, "persist", 6, stages);
        Ok(())
    }

    /// Fill the text of image chunks from OCR, refined by the LLM for the
    /// enhanced method. A failed recognition leaves the chunk empty.
    async fn recognise_images(&self, graph: &mut ChunkGraph, method: ParserMethod) -> usize {
        let pending: Vec<ExtractedImage> = graph.image_chunks().cloned().collect();
        if pending.is_empty() {
            return 0;
        }

        let concurrency = self.ctx.config.chunking.ocr_concurrency.max(1);
        let results: Vec<(Uuid, String)> = stream::iter(pending)
            .map(|image| async move {
                let text = self.describe_image(&image, method).await;
                (image.chunk_id, text)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut filled = 0;
        for (chunk_id, text) in results {
            if let Some(chunk) = graph.chunks.iter_mut().find(|c| c.id == chunk_id) {
                chunk.token_count = count_tokens(&text);
                chunk.text = text;
                filled += 1;
            }
        }
        filled
    }

    async fn describe_image(&self, image: &ExtractedImage, method: ParserMethod) -> String {
        let recognised = match self.ctx.ocr.recognize(&image.data).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("OCR failed for image chunk {}: {}", image.chunk_id, e);
                String::new()
            }
        };
        if method != ParserMethod::Enhanced {
            return recognised;
        }

        let context = [image.context_before.as_deref(), Some(recognised.as_str()), image.context_after.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        match self.ctx.llm.summarize_image(&image.data, &context).await {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            Ok(_) => recognised,
            Err(e) => {
                tracing::warn!("Image summary failed for chunk {}: {}", image.chunk_id, e);
                recognised
            }
        }
    }
}

fn is_parse(task_type: TaskType) -> bool {
    matches!(task_type, TaskType::ParseDocument | TaskType::ParseTemporaryDocument)
}

/// Embed the non-empty chunks in batches. Any embedding failure fails the
/// task, since an unembedded chunk is invisible to vector search.
pub(crate) async fn embed_chunks(ctx: &TaskContext, chunks: &[Chunk], dimension: usize) -> Result<Vec<VectorItem>> {
    if ctx.embedder.dimensions() != dimension {
        return Err(Error::Config(format!(
            "Embedding model {} has dimension {}, the vector table expects {}",
            ctx.embedder.model(),
            ctx.embedder.dimensions(),
            dimension
        )));
    }

    let embeddable: Vec<&Chunk> = chunks.iter().filter(|c| !c.text.trim().is_empty()).collect();
    let mut items = Vec::with_capacity(embeddable.len());
    for batch in embeddable.chunks(ctx.config.chunking.embed_batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let embeddings = ctx.embedder.embed_batch(&texts).await?;
        if embeddings.len() != batch.len() {
            return Err(Error::embedding(format!(
                "Expected {} embeddings, got {}",
                batch.len(),
                embeddings.len()
            )));
        }
        for (chunk, embedding) in batch.iter().zip(embeddings) {
            let mut item = VectorItem::new(chunk.id, chunk.document_id, embedding);
            item.enabled = chunk.enabled;
            items.push(item);
        }
    }
    Ok(items)
}
