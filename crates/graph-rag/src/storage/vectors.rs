//! Per-knowledge-base vector tables
//!
//! Every knowledge base owns one `vectors_<id>` table whose dimension is
//! fixed when the table is first created. Temporary documents share a single
//! `vectors_temporary` table. The registry of tables lives in
//! `vector_tables`; lookups are an exact cosine scan over the table.

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Which vector table an item lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorSpace {
    KnowledgeBase(Uuid),
    Temporary,
}

impl VectorSpace {
    fn registry_key(&self) -> String {
        match self {
            Self::KnowledgeBase(id) => id.to_string(),
            Self::Temporary => "temporary".to_string(),
        }
    }

    fn table_name(&self) -> String {
        match self {
            Self::KnowledgeBase(id) => format!("vectors_{}", id.simple()),
            Self::Temporary => "vectors_temporary".to_string(),
        }
    }
}

/// Embedding of one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct VectorItem {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub embedding: Vec<f32>,
    pub enabled: bool,
}

impl VectorItem {
    pub fn new(chunk_id: Uuid, document_id: Uuid, embedding: Vec<f32>) -> Self {
        Self {
            chunk_id,
            document_id,
            embedding,
            enabled: true,
        }
    }
}

/// A vector hit; higher similarity is closer
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub similarity: f32,
}

/// Registry of vector tables keyed by vector space
pub struct VectorIndex {
    conn: Arc<Mutex<Connection>>,
}

impl VectorIndex {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Create the table of a space if needed and return its dimension.
    ///
    /// An existing table keeps the dimension it was created with.
    pub fn ensure_space(&self, space: VectorSpace, dimension: usize) -> Result<usize> {
        let conn = self.conn.lock();
        ensure_table(&conn, space, dimension)
    }

    /// Dimension of a space, if its table exists
    pub fn dimension(&self, space: VectorSpace) -> Result<Option<usize>> {
        let conn = self.conn.lock();
        registered_dimension(&conn, space)
    }

    /// Insert or replace items, creating the table lazily from the first
    /// item's dimension
    pub fn upsert(&self, space: VectorSpace, items: &[VectorItem]) -> Result<usize> {
        let Some(first) = items.first() else {
            return Ok(0);
        };

        let mut conn = self.conn.lock();
        let dimension = ensure_table(&conn, space, first.embedding.len())?;
        if let Some(bad) = items.iter().find(|item| item.embedding.len() != dimension) {
            return Err(Error::storage(format!(
                "Embedding for chunk {} has dimension {}, {} expects {}",
                bad.chunk_id,
                bad.embedding.len(),
                space.table_name(),
                dimension
            )));
        }

        let tx = conn
            .transaction()
            .map_err(|e| Error::storage(format!("Failed to begin transaction: {}", e)))?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT OR REPLACE INTO {} (chunk_id, document_id, embedding, enabled) VALUES (?1, ?2, ?3, ?4)",
                    space.table_name()
                ))
                .map_err(|e| Error::storage(format!("Failed to prepare vector insert: {}", e)))?;
            for item in items {
                stmt.execute(params![
                    item.chunk_id.to_string(),
                    item.document_id.to_string(),
                    encode_embedding(&item.embedding),
                    item.enabled,
                ])
                .map_err(|e| Error::storage(format!("Failed to insert vector: {}", e)))?;
            }
        }
        tx.commit()
            .map_err(|e| Error::storage(format!("Failed to commit vectors: {}", e)))?;
        Ok(items.len())
    }

    /// Nearest enabled items by cosine similarity, optionally restricted to documents
    pub fn search(
        &self,
        space: VectorSpace,
        query: &[f32],
        top_k: usize,
        documents: Option<&[Uuid]>,
    ) -> Result<Vec<VectorMatch>> {
        let conn = self.conn.lock();
        let Some(dimension) = registered_dimension(&conn, space)? else {
            return Ok(Vec::new());
        };
        if query.len() != dimension {
            return Err(Error::embedding(format!(
                "Query embedding has dimension {}, {} expects {}",
                query.len(),
                space.table_name(),
                dimension
            )));
        }
        if top_k == 0 || matches!(documents, Some(ids) if ids.is_empty()) {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT chunk_id, document_id, embedding FROM {} WHERE enabled = 1",
            space.table_name()
        );
        let mut values = Vec::new();
        if let Some(ids) = documents {
            sql.push_str(&format!(" AND document_id IN ({})", vec!["?"; ids.len()].join(", ")));
            values.extend(ids.iter().map(|id| Value::Text(id.to_string())));
        }

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::storage(format!("Failed to prepare vector scan: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Vec<u8>>(2)?))
            })
            .map_err(|e| Error::storage(format!("Failed to scan vectors: {}", e)))?;

        let query_norm = norm(query);
        let mut matches = Vec::new();
        for row in rows {
            let (chunk_id, document_id, blob) =
                row.map_err(|e| Error::storage(format!("Failed to read vector: {}", e)))?;
            let embedding = decode_embedding(&blob);
            let similarity = cosine(query, query_norm, &embedding);
            matches.push(VectorMatch {
                chunk_id: parse_id(&chunk_id)?,
                document_id: parse_id(&document_id)?,
                similarity,
            });
        }

        matches.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    /// Embedding of a chunk, if stored
    pub fn get(&self, space: VectorSpace, chunk_id: Uuid) -> Result<Option<Vec<f32>>> {
        let conn = self.conn.lock();
        if registered_dimension(&conn, space)?.is_none() {
            return Ok(None);
        }
        let blob: Option<Vec<u8>> = conn
            .query_row(
                &format!("SELECT embedding FROM {} WHERE chunk_id = ?1", space.table_name()),
                params![chunk_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::storage(format!("Failed to get vector: {}", e)))?;
        Ok(blob.map(|b| decode_embedding(&b)))
    }

    pub fn set_document_enabled(&self, space: VectorSpace, document_id: Uuid, enabled: bool) -> Result<()> {
        let conn = self.conn.lock();
        if registered_dimension(&conn, space)?.is_none() {
            return Ok(());
        }
        conn.execute(
            &format!("UPDATE {} SET enabled = ?2 WHERE document_id = ?1", space.table_name()),
            params![document_id.to_string(), enabled],
        )
        .map_err(|e| Error::storage(format!("Failed to update vectors: {}", e)))?;
        Ok(())
    }

    pub fn delete_document(&self, space: VectorSpace, document_id: Uuid) -> Result<usize> {
        let conn = self.conn.lock();
        if registered_dimension(&conn, space)?.is_none() {
            return Ok(0);
        }
        conn.execute(
            &format!("DELETE FROM {} WHERE document_id = ?1", space.table_name()),
            params![document_id.to_string()],
        )
        .map_err(|e| Error::storage(format!("Failed to delete vectors: {}", e)))
    }

    /// Drop the table of a space and forget it
    pub fn drop_space(&self, space: VectorSpace) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", space.table_name()))
            .map_err(|e| Error::storage(format!("Failed to drop vector table: {}", e)))?;
        conn.execute(
            "DELETE FROM vector_tables WHERE registry_key = ?1",
            params![space.registry_key()],
        )
        .map_err(|e| Error::storage(format!("Failed to unregister vector table: {}", e)))?;
        Ok(())
    }
}

fn registered_dimension(conn: &Connection, space: VectorSpace) -> Result<Option<usize>> {
    let dimension: Option<i64> = conn
        .query_row(
            "SELECT dimension FROM vector_tables WHERE registry_key = ?1",
            params![space.registry_key()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::storage(format!("Failed to read vector registry: {}", e)))?;
    Ok(dimension.map(|d| d as usize))
}

fn ensure_table(conn: &Connection, space: VectorSpace, dimension: usize) -> Result<usize> {
    if let Some(existing) = registered_dimension(conn, space)? {
        return Ok(existing);
    }
    if dimension == 0 {
        return Err(Error::storage("Vector dimension must be > 0"));
    }

    let table = space.table_name();
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            embedding BLOB NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_document ON {table}(document_id);
        "#
    ))
    .map_err(|e| Error::storage(format!("Failed to create {}: {}", table, e)))?;

    conn.execute(
        "INSERT OR IGNORE INTO vector_tables (registry_key, table_name, dimension) VALUES (?1, ?2, ?3)",
        params![space.registry_key(), table, dimension as i64],
    )
    .map_err(|e| Error::storage(format!("Failed to register {}: {}", table, e)))?;

    tracing::info!("Created vector table {} with dimension {}", table, dimension);
    registered_dimension(conn, space)?
        .ok_or_else(|| Error::internal(format!("Vector table {} vanished after creation", table)))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::storage(format!("Corrupt id '{}': {}", raw, e)))
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine(query: &[f32], query_norm: f32, other: &[f32]) -> f32 {
    let other_norm = norm(other);
    if query_norm == 0.0 || other_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = query.iter().zip(other).map(|(a, b)| a * b).sum();
    dot / (query_norm * other_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MetadataDb;

    fn index() -> VectorIndex {
        VectorIndex::new(MetadataDb::in_memory().unwrap().connection())
    }

    #[test]
    fn test_lazy_creation_fixes_dimension() {
        let index = index();
        let space = VectorSpace::KnowledgeBase(Uuid::new_v4());
        assert_eq!(index.dimension(space).unwrap(), None);

        let doc = Uuid::new_v4();
        index.upsert(space, &[VectorItem::new(Uuid::new_v4(), doc, vec![1.0, 0.0, 0.0])]).unwrap();
        assert_eq!(index.dimension(space).unwrap(), Some(3));
        assert_eq!(index.ensure_space(space, 8).unwrap(), 3);

        let wrong = VectorItem::new(Uuid::new_v4(), doc, vec![1.0, 0.0]);
        assert!(index.upsert(space, &[wrong]).is_err());
    }

    #[test]
    fn test_cosine_search_order_and_filter() {
        let index = index();
        let space = VectorSpace::Temporary;
        let (doc_a, doc_b) = (Uuid::new_v4(), Uuid::new_v4());
        let close = VectorItem::new(Uuid::new_v4(), doc_a, vec![1.0, 0.1]);
        let far = VectorItem::new(Uuid::new_v4(), doc_a, vec![0.0, 1.0]);
        let other = VectorItem::new(Uuid::new_v4(), doc_b, vec![1.0, 0.0]);
        index.upsert(space, &[close.clone(), far.clone(), other.clone()]).unwrap();

        let hits = index.search(space, &[1.0, 0.0], 2, Some(&[doc_a])).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, close.chunk_id);
        assert_eq!(hits[1].chunk_id, far.chunk_id);
        assert!(hits[0].similarity > hits[1].similarity);

        let hits = index.search(space, &[1.0, 0.0], 1, None).unwrap();
        assert_eq!(hits[0].chunk_id, other.chunk_id);
        assert!(index.search(space, &[1.0], 1, None).is_err());
    }

    #[test]
    fn test_disable_and_delete_document() {
        let index = index();
        let space = VectorSpace::KnowledgeBase(Uuid::new_v4());
        let doc = Uuid::new_v4();
        let item = VectorItem::new(Uuid::new_v4(), doc, vec![0.5, 0.5]);
        index.upsert(space, &[item.clone()]).unwrap();
        assert_eq!(index.get(space, item.chunk_id).unwrap(), Some(vec![0.5, 0.5]));

        index.set_document_enabled(space, doc, false).unwrap();
        assert!(index.search(space, &[0.5, 0.5], 5, None).unwrap().is_empty());

        assert_eq!(index.delete_document(space, doc).unwrap(), 1);
        index.drop_space(space).unwrap();
        assert_eq!(index.dimension(space).unwrap(), None);
        assert!(index.search(space, &[0.5, 0.5], 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_space_is_empty() {
        let index = index();
        let space = VectorSpace::KnowledgeBase(Uuid::new_v4());
        assert!(index.search(space, &[1.0], 3, None).unwrap().is_empty());
        assert_eq!(index.delete_document(space, Uuid::new_v4()).unwrap(), 0);
    }
}
