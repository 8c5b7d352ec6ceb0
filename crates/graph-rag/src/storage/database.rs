//! SQLite metadata store for knowledge bases, documents, chunks and tasks
//!
//! One database file is shared by the scheduler and every worker process, so
//! the connection runs in WAL mode with a busy timeout.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Document, DocumentStatus, ExportStatus, FileType, KnowledgeBase, ParserMethod};

/// Metadata database
pub struct MetadataDb {
    conn: Arc<Mutex<Connection>>,
}

impl MetadataDb {
    /// Open or create the database at the given path
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::storage(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;

        tracing::info!("Metadata database initialized at {:?}", path);
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::storage(format!("Failed to open in-memory database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Shared connection handle for the queue and vector stores
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.busy_timeout(Duration::from_secs(10))
            .map_err(|e| Error::storage(format!("Failed to set busy timeout: {}", e)))?;

        // journal_mode returns a row, so it cannot go through execute_batch
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| Error::storage(format!("Failed to enable WAL: {}", e)))?;

        conn.execute_batch(
            r#"
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = OFF;

            CREATE TABLE IF NOT EXISTS knowledge_bases (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                export_status TEXT NOT NULL DEFAULT 'idle',
                export_blob_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                kb_id TEXT,
                name TEXT NOT NULL,
                file_type TEXT NOT NULL,
                parser_method TEXT NOT NULL,
                chunk_token_budget INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                blob_id TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_documents_kb ON documents(kb_id);
            CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(content_hash);

            CREATE TABLE IF NOT EXISTS chunks (
                seq INTEGER PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                document_id TEXT NOT NULL,
                text TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                chunk_type TEXT NOT NULL,
                global_offset INTEGER NOT NULL,
                local_offset INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                link_to TEXT,
                image_blob_ids TEXT NOT NULL DEFAULT '[]',
                UNIQUE(document_id, global_offset)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id, global_offset);

            CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                text,
                content='chunks',
                content_rowid='seq',
                tokenize='unicode61'
            );

            CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                INSERT INTO chunks_fts(rowid, text) VALUES (NEW.seq, NEW.text);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', OLD.seq, OLD.text);
            END;

            CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE OF text ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', OLD.seq, OLD.text);
                INSERT INTO chunks_fts(rowid, text) VALUES (NEW.seq, NEW.text);
            END;

            CREATE TABLE IF NOT EXISTS chunk_links (
                id TEXT PRIMARY KEY,
                chunk_a TEXT NOT NULL,
                chunk_b TEXT NOT NULL,
                link_type TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunk_links_a ON chunk_links(chunk_a);
            CREATE INDEX IF NOT EXISTS idx_chunk_links_b ON chunk_links(chunk_b);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                operation_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL,
                retry INTEGER NOT NULL DEFAULT 0,
                payload TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_operation ON tasks(operation_id);

            CREATE TABLE IF NOT EXISTS task_status_reports (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                message TEXT NOT NULL,
                current_stage INTEGER NOT NULL,
                stage_count INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_reports_task ON task_status_reports(task_id);

            CREATE TABLE IF NOT EXISTS queue_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                task_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_entries ON queue_entries(queue, seq);

            CREATE TABLE IF NOT EXISTS vector_tables (
                registry_key TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                dimension INTEGER NOT NULL
            );
        "#,
        )
        .map_err(|e| Error::storage(format!("Failed to run migrations: {}", e)))?;

        tracing::debug!("Database migrations complete");
        Ok(())
    }

    // ==================== Knowledge Bases ====================

    pub fn insert_knowledge_base(&self, kb: &KnowledgeBase) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO knowledge_bases (id, name, embedding_model, dimension, export_status, export_blob_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                kb.id.to_string(),
                kb.name,
                kb.embedding_model,
                kb.dimension as i64,
                kb.export_status.as_str(),
                kb.export_blob_id.map(|id| id.to_string()),
                kb.created_at,
            ],
        )
        .map_err(|e| Error::storage(format!("Failed to insert knowledge base: {}", e)))?;
        Ok(())
    }

    pub fn get_knowledge_base(&self, id: Uuid) -> Result<Option<KnowledgeBase>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, embedding_model, dimension, export_status, export_blob_id, created_at
             FROM knowledge_bases WHERE id = ?1",
            params![id.to_string()],
            row_to_knowledge_base,
        )
        .optional()
        .map_err(|e| Error::storage(format!("Failed to get knowledge base: {}", e)))
    }

    /// Fetch a knowledge base or fail with `NotFound`
    pub fn require_knowledge_base(&self, id: Uuid) -> Result<KnowledgeBase> {
        self.get_knowledge_base(id)?
            .ok_or_else(|| Error::not_found("knowledge base", id))
    }

    pub fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, embedding_model, dimension, export_status, export_blob_id, created_at
                 FROM knowledge_bases ORDER BY created_at",
            )
            .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;

        let kbs = stmt
            .query_map([], row_to_knowledge_base)
            .map_err(|e| Error::storage(format!("Failed to list knowledge bases: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(format!("Failed to read knowledge base: {}", e)))?;
        Ok(kbs)
    }

    /// Set the export state, keeping the previous blob id when `blob_id` is `None`
    pub fn set_export_status(&self, id: Uuid, status: ExportStatus, blob_id: Option<Uuid>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE knowledge_bases
             SET export_status = ?2, export_blob_id = COALESCE(?3, export_blob_id)
             WHERE id = ?1",
            params![id.to_string(), status.as_str(), blob_id.map(|b| b.to_string())],
        )
        .map_err(|e| Error::storage(format!("Failed to update export status: {}", e)))?;
        Ok(())
    }

    /// Forget the export blob (after it has been deleted from the object store)
    pub fn clear_export_blob(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE knowledge_bases SET export_blob_id = NULL WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(|e| Error::storage(format!("Failed to clear export blob: {}", e)))?;
        Ok(())
    }

    pub fn delete_knowledge_base(&self, id: Uuid) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute("DELETE FROM knowledge_bases WHERE id = ?1", params![id.to_string()])
            .map_err(|e| Error::storage(format!("Failed to delete knowledge base: {}", e)))?;
        Ok(count > 0)
    }

    // ==================== Documents ====================

    pub fn insert_document(&self, doc: &Document) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO documents (
                id, kb_id, name, file_type, parser_method, chunk_token_budget,
                status, blob_id, content_hash, enabled, deleted, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                doc.id.to_string(),
                doc.kb_id.map(|id| id.to_string()),
                doc.name,
                doc.file_type.extension(),
                doc.parser_method.as_str(),
                doc.chunk_token_budget as i64,
                doc.status.as_str(),
                doc.blob_id.to_string(),
                doc.content_hash,
                doc.enabled,
                doc.deleted,
                doc.created_at,
            ],
        )
        .map_err(|e| Error::storage(format!("Failed to insert document: {}", e)))?;
        Ok(())
    }

    pub fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
            params![id.to_string()],
            row_to_document,
        )
        .optional()
        .map_err(|e| Error::storage(format!("Failed to get document: {}", e)))
    }

    /// Fetch a live (not soft-deleted) document or fail with `NotFound`
    pub fn require_document(&self, id: Uuid) -> Result<Document> {
        match self.get_document(id)? {
            Some(doc) if !doc.deleted => Ok(doc),
            _ => Err(Error::not_found("document", id)),
        }
    }

    /// Live documents of a knowledge base in upload order
    pub fn list_documents(&self, kb_id: Uuid) -> Result<Vec<Document>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM documents WHERE kb_id = ?1 AND deleted = 0 ORDER BY created_at, id",
                DOCUMENT_COLUMNS
            ))
            .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;

        let docs = stmt
            .query_map(params![kb_id.to_string()], row_to_document)
            .map_err(|e| Error::storage(format!("Failed to list documents: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(format!("Failed to read document: {}", e)))?;
        Ok(docs)
    }

    /// A live document of the same knowledge base with identical content
    pub fn find_document_by_hash(&self, kb_id: Option<Uuid>, content_hash: &str) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM documents
                 WHERE content_hash = ?1 AND kb_id IS ?2 AND deleted = 0
                 ORDER BY created_at LIMIT 1",
                DOCUMENT_COLUMNS
            ),
            params![content_hash, kb_id.map(|id| id.to_string())],
            row_to_document,
        )
        .optional()
        .map_err(|e| Error::storage(format!("Failed to look up document hash: {}", e)))
    }

    pub fn set_document_status(&self, id: Uuid, status: DocumentStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE documents SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.as_str()],
        )
        .map_err(|e| Error::storage(format!("Failed to update document status: {}", e)))?;
        Ok(())
    }

    pub fn set_document_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE documents SET enabled = ?2 WHERE id = ?1",
            params![id.to_string(), enabled],
        )
        .map_err(|e| Error::storage(format!("Failed to update document: {}", e)))?;
        Ok(())
    }

    /// Hide a document from retrieval ahead of its physical deletion
    pub fn mark_document_deleted(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE documents SET deleted = 1 WHERE id = ?1",
            params![id.to_string()],
        )
        .map_err(|e| Error::storage(format!("Failed to mark document deleted: {}", e)))?;
        Ok(())
    }

    /// Remove the document row together with its chunks and links
    pub fn delete_document(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::storage(format!("Failed to begin transaction: {}", e)))?;

        delete_chunk_rows(&tx, id)?;
        let count = tx
            .execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])
            .map_err(|e| Error::storage(format!("Failed to delete document: {}", e)))?;

        tx.commit()
            .map_err(|e| Error::storage(format!("Failed to commit deletion: {}", e)))?;
        Ok(count > 0)
    }
}

pub(crate) const DOCUMENT_COLUMNS: &str = "id, kb_id, name, file_type, parser_method, chunk_token_budget, \
     status, blob_id, content_hash, enabled, deleted, created_at";

/// Delete the chunks of a document and every link touching them
pub(crate) fn delete_chunk_rows(conn: &Connection, document_id: Uuid) -> Result<usize> {
    let doc = document_id.to_string();
    conn.execute(
        "DELETE FROM chunk_links
         WHERE chunk_a IN (SELECT id FROM chunks WHERE document_id = ?1)
            OR chunk_b IN (SELECT id FROM chunks WHERE document_id = ?1)",
        params![doc],
    )
    .map_err(|e| Error::storage(format!("Failed to delete chunk links: {}", e)))?;

    conn.execute("DELETE FROM chunks WHERE document_id = ?1", params![doc])
        .map_err(|e| Error::storage(format!("Failed to delete chunks: {}", e)))
}

// ==================== Row Conversions ====================

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

pub(crate) fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, format!("bad uuid '{}': {}", raw, e)))
}

pub(crate) fn opt_uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, format!("bad uuid '{}': {}", raw, e)))
    })
    .transpose()
}

/// Decode a text column through a `FromStr`-like parser
pub(crate) fn parsed_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unexpected value '{}'", raw)))
}

fn row_to_knowledge_base(row: &Row<'_>) -> rusqlite::Result<KnowledgeBase> {
    let status: String = row.get(4)?;
    Ok(KnowledgeBase {
        id: uuid_column(row, 0)?,
        name: row.get(1)?,
        embedding_model: row.get(2)?,
        dimension: row.get::<_, i64>(3)? as usize,
        export_status: ExportStatus::parse(&status),
        export_blob_id: opt_uuid_column(row, 5)?,
        created_at: row.get::<_, DateTime<Utc>>(6)?,
    })
}

pub(crate) fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    let file_type: String = row.get(3)?;
    let status: String = row.get(6)?;
    Ok(Document {
        id: uuid_column(row, 0)?,
        kb_id: opt_uuid_column(row, 1)?,
        name: row.get(2)?,
        file_type: FileType::from_extension(&file_type),
        parser_method: parsed_column(row, 4, ParserMethod::parse)?,
        chunk_token_budget: row.get::<_, i64>(5)? as usize,
        status: DocumentStatus::parse(&status),
        blob_id: uuid_column(row, 7)?,
        content_hash: row.get(8)?,
        enabled: row.get(9)?,
        deleted: row.get(10)?,
        created_at: row.get::<_, DateTime<Utc>>(11)?,
    })
}
