//! Knowledge base export and import
//!
//! An export is one JSON blob holding the knowledge base, its documents
//! (with their input bytes), chunks, links and extracted images. Import
//! recreates everything under fresh ids and re-embeds the chunks.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::context::TaskContext;
use super::worker::embed_chunks;
use crate::error::{Error, Result};
use crate::storage::VectorSpace;
use crate::types::{Chunk, ChunkLink, Document, DocumentStatus, ExportStatus, KnowledgeBase, Task};

const EXPORT_VERSION: u32 = 1;

/// Payload of an `export_kb` task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportPayload {
    /// Object store id the export is written to
    pub export_blob_id: Uuid,
}

/// Payload of an `import_kb` task; the task's operation id is the new KB id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportPayload {
    /// Object store id of the export to read
    pub source_blob_id: Uuid,
    /// Name of the created knowledge base (defaults to the exported name)
    #[serde(default)]
    pub name: Option<String>,
}

fn payload<T: for<'de> Deserialize<'de>>(task: &Task) -> Result<T> {
    let value = task
        .payload
        .clone()
        .ok_or_else(|| Error::Config(format!("Task {} has no payload", task.id)))?;
    serde_json::from_value(value)
        .map_err(|e| Error::Config(format!("Task {} has an invalid payload: {}", task.id, e)))
}

impl ExportPayload {
    pub fn from_task(task: &Task) -> Result<Self> {
        payload(task)
    }
}

impl ImportPayload {
    pub fn from_task(task: &Task) -> Result<Self> {
        payload(task)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KnowledgeBaseExport {
    version: u32,
    knowledge_base: KnowledgeBase,
    documents: Vec<DocumentExport>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DocumentExport {
    document: Document,
    /// Base64 input bytes
    source: String,
    chunks: Vec<Chunk>,
    links: Vec<ChunkLink>,
    /// Base64 image blobs keyed by their exported id
    images: BTreeMap<Uuid, String>,
}

fn encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn decode(raw: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|e| Error::Config(format!("Corrupt export blob data: {}", e)))
}

/// collect → write → finish
pub async fn export_knowledge_base(ctx: &TaskContext, task: &Task) -> Result<()> {
    let stages = task.task_type.stage_count();
    let payload = ExportPayload::from_task(task)?;
    let kb = ctx.db.require_knowledge_base(task.operation_id)?;
    ctx.db.set_export_status(kb.id, ExportStatus::Exporting, None)?;

    let docs = ctx.db.list_documents(kb.id)?;
    ctx.report(task.id, format!("collect {} documents", docs.len()), 1, stages);

    let mut documents = Vec::with_capacity(docs.len());
    for document in docs {
        let source = encode(&ctx.blobs.get(document.blob_id).await?);
        let chunks = ctx.db.document_chunks(document.id)?;
        let links = ctx.db.document_links(document.id)?;
        let mut images = BTreeMap::new();
        for &blob_id in chunks.iter().flat_map(|c| &c.image_blob_ids) {
            images.insert(blob_id, encode(&ctx.blobs.get(blob_id).await?));
        }
        documents.push(DocumentExport {
            document,
            source,
            chunks,
            links,
            images,
        });
    }

    let export = KnowledgeBaseExport {
        version: EXPORT_VERSION,
        knowledge_base: kb.clone(),
        documents,
    };
    let bytes = serde_json::to_vec(&export)?;
    ctx.blobs.put(payload.export_blob_id, &bytes).await?;
    ctx.report(task.id, format!("write {} bytes", bytes.len()), 2, stages);

    ctx.db.set_export_status(kb.id, ExportStatus::Idle, Some(payload.export_blob_id))?;
    ctx.report(task.id, "finish", 3, stages);
    Ok(())
}

/// read → recreate → embed → persist
pub async fn import_knowledge_base(ctx: &TaskContext, task: &Task) -> Result<()> {
    let stages = task.task_type.stage_count();
    let payload = ImportPayload::from_task(task)?;

    let raw = ctx.blobs.get(payload.source_blob_id).await?;
    let export: KnowledgeBaseExport = serde_json::from_slice(&raw)
        .map_err(|e| Error::Config(format!("Not a knowledge base export: {}", e)))?;
    if export.version != EXPORT_VERSION {
        return Err(Error::Config(format!("Unsupported export version {}", export.version)));
    }
    ctx.report(task.id, format!("read {} documents", export.documents.len()), 1, stages);

    // A retried import starts from a clean base
    if ctx.db.get_knowledge_base(task.operation_id)?.is_some() {
        ctx.clear_knowledge_base(task.operation_id, true).await?;
    }

    let mut kb = export.knowledge_base.clone();
    kb.id = task.operation_id;
    kb.name = payload.name.clone().unwrap_or(kb.name);
    kb.export_status = ExportStatus::Idle;
    kb.export_blob_id = None;
    kb.created_at = chrono::Utc::now();
    ctx.db.insert_knowledge_base(&kb)?;

    let mut graphs = Vec::with_capacity(export.documents.len());
    for exported in export.documents {
        graphs.push(recreate_document(ctx, &kb, exported).await?);
    }
    ctx.report(task.id, format!("recreate {} documents", graphs.len()), 2, stages);

    let space = VectorSpace::KnowledgeBase(kb.id);
    ctx.vectors.ensure_space(space, kb.dimension)?;
    let mut embedded = 0;
    for (doc, chunks, links) in &graphs {
        let vectors = embed_chunks(ctx, chunks, kb.dimension).await?;
        ctx.db.insert_chunk_graph(chunks, links)?;
        ctx.vectors.upsert(space, &vectors)?;
        ctx.db.set_document_status(doc.id, DocumentStatus::Pending)?;
        embedded += vectors.len();
    }
    ctx.report(task.id, format!("embed {} chunks", embedded), 3, stages);
    ctx.report(task.id, "persist", 4, stages);
    Ok(())
}

/// Store a document under fresh ids; its chunks are returned for embedding
async fn recreate_document(
    ctx: &TaskContext,
    kb: &KnowledgeBase,
    exported: DocumentExport,
) -> Result<(Document, Vec<Chunk>, Vec<ChunkLink>)> {
    let mut doc = exported.document;
    doc.id = Uuid::new_v4();
    doc.kb_id = Some(kb.id);
    doc.blob_id = ctx.blobs.put_new(&decode(&exported.source)?).await?;
    // Hidden from retrieval until its chunks are embedded
    doc.status = DocumentStatus::Running;
    doc.deleted = false;
    ctx.db.insert_document(&doc)?;

    let mut blob_ids = HashMap::new();
    for (old, data) in &exported.images {
        blob_ids.insert(*old, ctx.blobs.put_new(&decode(data)?).await?);
    }

    let chunk_ids: HashMap<Uuid, Uuid> = exported
        .chunks
        .iter()
        .map(|c| (c.id, Uuid::new_v4()))
        .collect();

    let chunks = exported
        .chunks
        .into_iter()
        .map(|mut chunk| {
            chunk.id = chunk_ids[&chunk.id];
            chunk.document_id = doc.id;
            chunk.link_to = chunk.link_to.and_then(|parent| chunk_ids.get(&parent).copied());
            chunk.image_blob_ids = chunk
                .image_blob_ids
                .iter()
                .filter_map(|blob| blob_ids.get(blob).copied())
                .collect();
            chunk
        })
        .collect();

    let links = exported
        .links
        .into_iter()
        .filter_map(|link| {
            Some(ChunkLink {
                id: Uuid::new_v4(),
                chunk_a: *chunk_ids.get(&link.chunk_a)?,
                chunk_b: *chunk_ids.get(&link.chunk_b)?,
                link_type: link.link_type,
            })
        })
        .collect();

    Ok((doc, chunks, links))
}

/// Undo a partial export; the blob is always removed since a restarted
/// export rewrites it
pub async fn rollback_export(ctx: &TaskContext, task: &Task) -> Result<()> {
    if ctx.db.get_knowledge_base(task.operation_id)?.is_some() {
        ctx.db.set_export_status(task.operation_id, ExportStatus::Idle, None)?;
    }
    if let Ok(payload) = ExportPayload::from_task(task) {
        ctx.blobs.delete(payload.export_blob_id).await?;
        if let Some(kb) = ctx.db.get_knowledge_base(task.operation_id)? {
            if kb.export_blob_id == Some(payload.export_blob_id) {
                ctx.db.clear_export_blob(kb.id)?;
            }
        }
    }
    Ok(())
}

/// Undo a partial import. The source blob is deleted only when the task is
/// cleared for good.
pub async fn rollback_import(ctx: &TaskContext, task: &Task, terminal: bool) -> Result<()> {
    if ctx.db.get_knowledge_base(task.operation_id)?.is_some() {
        let removed = ctx.clear_knowledge_base(task.operation_id, true).await?;
        tracing::info!("[{}] Removed partially imported knowledge base ({} documents)", task.id, removed);
    }
    if terminal {
        if let Ok(payload) = ImportPayload::from_task(task) {
            ctx.blobs.delete(payload.source_blob_id).await?;
        }
    }
    Ok(())
}
