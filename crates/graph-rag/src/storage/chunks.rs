//! Chunk, link and keyword-search queries of the metadata store

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::database::{delete_chunk_rows, opt_uuid_column, parsed_column, uuid_column, MetadataDb};
use crate::chunking::tokens::content_words;
use crate::error::{Error, Result};
use crate::types::{Chunk, ChunkLink, ChunkType, LinkType, SearchScope};

const CHUNK_COLUMNS: &str = "c.id, c.document_id, c.text, c.token_count, c.chunk_type, \
     c.global_offset, c.local_offset, c.enabled, c.link_to, c.image_blob_ids";

/// Chunks a retrieval query may see: enabled chunks of enabled, live
/// documents that are not being (re)parsed
const VISIBLE: &str = "c.enabled = 1 AND d.enabled = 1 AND d.deleted = 0 AND d.status = 'pending'";

/// A keyword hit with its bm25 score (lower is better)
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub chunk: Chunk,
    pub score: f64,
}

impl MetadataDb {
    /// Persist a chunk graph atomically
    pub fn insert_chunk_graph(&self, chunks: &[Chunk], links: &[ChunkLink]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::storage(format!("Failed to begin transaction: {}", e)))?;

        {
            let mut insert_chunk = tx
                .prepare(
                    r#"
                    INSERT INTO chunks (
                        id, document_id, text, token_count, chunk_type, global_offset,
                        local_offset, enabled, link_to, image_blob_ids
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    "#,
                )
                .map_err(|e| Error::storage(format!("Failed to prepare chunk insert: {}", e)))?;

            for chunk in chunks {
                insert_chunk
                    .execute(params![
                        chunk.id.to_string(),
                        chunk.document_id.to_string(),
                        chunk.text,
                        chunk.token_count as i64,
                        chunk.chunk_type.to_string(),
                        chunk.global_offset,
                        chunk.local_offset,
                        chunk.enabled,
                        chunk.link_to.map(|id| id.to_string()),
                        serde_json::to_string(&chunk.image_blob_ids)?,
                    ])
                    .map_err(|e| Error::storage(format!("Failed to insert chunk {}: {}", chunk.id, e)))?;
            }

            let mut insert_link = tx
                .prepare("INSERT INTO chunk_links (id, chunk_a, chunk_b, link_type) VALUES (?1, ?2, ?3, ?4)")
                .map_err(|e| Error::storage(format!("Failed to prepare link insert: {}", e)))?;

            for link in links {
                insert_link
                    .execute(params![
                        link.id.to_string(),
                        link.chunk_a.to_string(),
                        link.chunk_b.to_string(),
                        link.link_type.to_string(),
                    ])
                    .map_err(|e| Error::storage(format!("Failed to insert link: {}", e)))?;
            }
        }

        tx.commit()
            .map_err(|e| Error::storage(format!("Failed to commit chunk graph: {}", e)))?;
        Ok(())
    }

    /// Delete every chunk of a document (and the links touching them)
    pub fn delete_chunks(&self, document_id: Uuid) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::storage(format!("Failed to begin transaction: {}", e)))?;
        let count = delete_chunk_rows(&tx, document_id)?;
        tx.commit()
            .map_err(|e| Error::storage(format!("Failed to commit chunk deletion: {}", e)))?;
        Ok(count)
    }

    pub fn get_chunk(&self, id: Uuid) -> Result<Option<Chunk>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM chunks c WHERE c.id = ?1", CHUNK_COLUMNS),
            params![id.to_string()],
            row_to_chunk,
        )
        .optional()
        .map_err(|e| Error::storage(format!("Failed to get chunk: {}", e)))
    }

    /// All chunks of a document ordered by global offset
    pub fn document_chunks(&self, document_id: Uuid) -> Result<Vec<Chunk>> {
        let conn = self.lock();
        query_chunks(
            &conn,
            &format!(
                "SELECT {} FROM chunks c WHERE c.document_id = ? ORDER BY c.global_offset",
                CHUNK_COLUMNS
            ),
            vec![Value::Text(document_id.to_string())],
        )
    }

    /// The chunk of a document at a global offset
    pub fn chunk_at(&self, document_id: Uuid, global_offset: i64) -> Result<Option<Chunk>> {
        let conn = self.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM chunks c WHERE c.document_id = ?1 AND c.global_offset = ?2",
                CHUNK_COLUMNS
            ),
            params![document_id.to_string(), global_offset],
            row_to_chunk,
        )
        .optional()
        .map_err(|e| Error::storage(format!("Failed to get chunk at offset: {}", e)))
    }

    pub fn count_chunks(&self, document_id: Uuid) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
                params![document_id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| Error::storage(format!("Failed to count chunks: {}", e)))?;
        Ok(count as usize)
    }

    /// Replace the text of a chunk (image chunks filled by OCR)
    pub fn update_chunk_text(&self, id: Uuid, text: &str, token_count: usize) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE chunks SET text = ?2, token_count = ?3 WHERE id = ?1",
            params![id.to_string(), text, token_count as i64],
        )
        .map_err(|e| Error::storage(format!("Failed to update chunk text: {}", e)))?;
        Ok(())
    }

    /// Image blobs referenced by a document's chunks
    pub fn image_blob_ids(&self, document_id: Uuid) -> Result<Vec<Uuid>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT j.value FROM chunks c, json_each(c.image_blob_ids) j \
                 WHERE c.document_id = ?1 ORDER BY c.global_offset, j.key",
            )
            .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;
        let ids = stmt
            .query_map(params![document_id.to_string()], |row| uuid_column(row, 0))
            .map_err(|e| Error::storage(format!("Failed to list image blobs: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(format!("Failed to read image blob id: {}", e)))?;
        Ok(ids)
    }

    /// Links leaving a chunk
    pub fn links_from(&self, chunk_id: Uuid) -> Result<Vec<ChunkLink>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id, chunk_a, chunk_b, link_type FROM chunk_links WHERE chunk_a = ?1")
            .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;
        let links = stmt
            .query_map(params![chunk_id.to_string()], row_to_link)
            .map_err(|e| Error::storage(format!("Failed to list links: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(format!("Failed to read link: {}", e)))?;
        Ok(links)
    }

    /// Every link whose source chunk belongs to the document
    pub fn document_links(&self, document_id: Uuid) -> Result<Vec<ChunkLink>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT l.id, l.chunk_a, l.chunk_b, l.link_type FROM chunk_links l
                 JOIN chunks c ON c.id = l.chunk_a
                 WHERE c.document_id = ?1
                 ORDER BY c.global_offset",
            )
            .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;
        let links = stmt
            .query_map(params![document_id.to_string()], row_to_link)
            .map_err(|e| Error::storage(format!("Failed to list links: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(format!("Failed to read link: {}", e)))?;
        Ok(links)
    }

    /// Full-text search over the visible chunks of a scope, best first
    pub fn keyword_search(&self, query: &str, scope: &SearchScope, limit: usize) -> Result<Vec<KeywordHit>> {
        let Some(expression) = match_expression(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let (scope_sql, mut values) = scope_filter(scope);
        let sql = format!(
            "SELECT {}, bm25(chunks_fts) AS score
             FROM chunks_fts
             JOIN chunks c ON c.seq = chunks_fts.rowid
             JOIN documents d ON d.id = c.document_id
             WHERE chunks_fts MATCH ? AND {} AND {}
             ORDER BY score, c.global_offset
             LIMIT ?",
            CHUNK_COLUMNS, VISIBLE, scope_sql
        );

        let mut params = vec![Value::Text(expression)];
        params.append(&mut values);
        params.push(Value::Integer(limit as i64));

        let conn = self.lock();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::storage(format!("Failed to prepare search: {}", e)))?;
        let hits = stmt
            .query_map(params_from_iter(params), |row| {
                Ok(KeywordHit {
                    chunk: row_to_chunk(row)?,
                    score: row.get(10)?,
                })
            })
            .map_err(|e| Error::storage(format!("Failed to search chunks: {}", e)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::storage(format!("Failed to read search hit: {}", e)))?;
        Ok(hits)
    }

    /// The subset of `ids` a query in `scope` may see, in input order
    pub fn visible_chunks(&self, ids: &[Uuid], scope: &SearchScope) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let (scope_sql, scope_values) = scope_filter(scope);
        let sql = format!(
            "SELECT {} FROM chunks c JOIN documents d ON d.id = c.document_id
             WHERE c.id IN ({}) AND {} AND {}",
            CHUNK_COLUMNS,
            placeholders(ids.len()),
            VISIBLE,
            scope_sql
        );
        let mut params: Vec<Value> = ids.iter().map(|id| Value::Text(id.to_string())).collect();
        params.extend(scope_values);

        let conn = self.lock();
        let found = query_chunks(&conn, &sql, params)?;
        Ok(ids
            .iter()
            .filter_map(|id| found.iter().find(|c| c.id == *id).cloned())
            .collect())
    }
}

/// FTS5 expression OR-ing the quoted content words of a query
fn match_expression(query: &str) -> Option<String> {
    let mut words = content_words(query);
    words.sort();
    words.dedup();
    if words.is_empty() {
        return None;
    }
    Some(
        words
            .iter()
            .map(|w| format!("\"{}\"", w.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// SQL restricting `d` (documents) to a search scope, with its parameters
fn scope_filter(scope: &SearchScope) -> (String, Vec<Value>) {
    match scope {
        SearchScope::KnowledgeBase(kb_id) => ("d.kb_id = ?".to_string(), vec![Value::Text(kb_id.to_string())]),
        SearchScope::Temporary(ids) if ids.is_empty() => ("0".to_string(), Vec::new()),
        SearchScope::Temporary(ids) => (
            format!("d.kb_id IS NULL AND d.id IN ({})", placeholders(ids.len())),
            ids.iter().map(|id| Value::Text(id.to_string())).collect(),
        ),
    }
}

fn query_chunks(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<Vec<Chunk>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| Error::storage(format!("Failed to prepare query: {}", e)))?;
    let chunks = stmt
        .query_map(params_from_iter(params), row_to_chunk)
        .map_err(|e| Error::storage(format!("Failed to query chunks: {}", e)))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| Error::storage(format!("Failed to read chunk: {}", e)))?;
    Ok(chunks)
}

fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: uuid_column(row, 0)?,
        document_id: uuid_column(row, 1)?,
        text: row.get(2)?,
        token_count: row.get::<_, i64>(3)? as usize,
        chunk_type: parsed_column(row, 4, |s| s.parse::<ChunkType>().ok())?,
        global_offset: row.get(5)?,
        local_offset: row.get(6)?,
        enabled: row.get(7)?,
        link_to: opt_uuid_column(row, 8)?,
        image_blob_ids: parsed_column(row, 9, |s| serde_json::from_str(s).ok())?,
    })
}

fn row_to_link(row: &Row<'_>) -> rusqlite::Result<ChunkLink> {
    Ok(ChunkLink {
        id: uuid_column(row, 0)?,
        chunk_a: uuid_column(row, 1)?,
        chunk_b: uuid_column(row, 2)?,
        link_type: parsed_column(row, 3, |s| s.parse::<LinkType>().ok())?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{
        BigType, ChunkAttr, Document, DocumentStatus, LinkJump, LinkScope, ParserMethod, Structure,
    };

    pub(crate) fn text_chunk(document_id: Uuid, offset: i64, text: &str) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            document_id,
            text: text.to_string(),
            token_count: crate::chunking::tokens::count_tokens(text),
            chunk_type: ChunkType::new(ParserMethod::General, BigType::Para, Structure::Line, ChunkAttr::Normal),
            global_offset: offset,
            local_offset: offset,
            enabled: true,
            link_to: None,
            image_blob_ids: Vec::new(),
        }
    }

    /// Insert a live document holding one chunk per text
    pub(crate) fn seed_document(db: &MetadataDb, kb_id: Option<Uuid>, name: &str, texts: &[&str]) -> (Document, Vec<Chunk>) {
        let doc = Document::new(kb_id, name, ParserMethod::General, 64, Uuid::new_v4(), format!("hash-{}", name));
        db.insert_document(&doc).unwrap();
        let chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| text_chunk(doc.id, i as i64, t))
            .collect();
        db.insert_chunk_graph(&chunks, &[]).unwrap();
        (doc, chunks)
    }

    #[test]
    fn test_chunk_graph_round_trip() {
        let db = MetadataDb::in_memory().unwrap();
        let doc_id = Uuid::new_v4();
        let mut a = text_chunk(doc_id, 0, "alpha");
        let mut b = text_chunk(doc_id, 1, "beta");
        a.image_blob_ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        b.image_blob_ids = vec![Uuid::new_v4()];
        let links = ChunkLink::pair(Some(a.id), Some(b.id), LinkScope::Global, Structure::Line, LinkJump::Step).unwrap();
        db.insert_chunk_graph(&[a.clone(), b.clone()], &links).unwrap();

        assert_eq!(db.document_chunks(doc_id).unwrap(), vec![a.clone(), b.clone()]);
        assert_eq!(db.chunk_at(doc_id, 1).unwrap().unwrap().id, b.id);
        assert_eq!(db.links_from(a.id).unwrap()[0].link_type.to_string(), "global.next.line.step");
        assert_eq!(db.document_links(doc_id).unwrap().len(), 2);
        let images: Vec<Uuid> = a.image_blob_ids.iter().chain(&b.image_blob_ids).copied().collect();
        assert_eq!(db.image_blob_ids(doc_id).unwrap(), images);

        assert_eq!(db.delete_chunks(doc_id).unwrap(), 2);
        assert_eq!(db.count_chunks(doc_id).unwrap(), 0);
        assert!(db.links_from(a.id).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_offset_rejected() {
        let db = MetadataDb::in_memory().unwrap();
        let doc_id = Uuid::new_v4();
        let result = db.insert_chunk_graph(&[text_chunk(doc_id, 0, "a"), text_chunk(doc_id, 0, "b")], &[]);
        assert!(result.is_err());
        // The transaction rolled back
        assert_eq!(db.count_chunks(doc_id).unwrap(), 0);
    }

    #[test]
    fn test_keyword_search_ranks_and_scopes() {
        let db = MetadataDb::in_memory().unwrap();
        let kb = Uuid::new_v4();
        let (_, chunks) = seed_document(
            &db,
            Some(kb),
            "a.txt",
            &["the borrow checker enforces borrow rules", "lifetimes annotate references", "borrow once"],
        );
        seed_document(&db, Some(Uuid::new_v4()), "b.txt", &["borrow from another base"]);

        let hits = db.keyword_search("How does the borrow checker work?", &SearchScope::KnowledgeBase(kb), 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, chunks[0].id);
        assert!(db.keyword_search("the of and", &SearchScope::KnowledgeBase(kb), 10).unwrap().is_empty());
    }

    #[test]
    fn test_keyword_search_skips_hidden_chunks() {
        let db = MetadataDb::in_memory().unwrap();
        let kb = Uuid::new_v4();
        let scope = SearchScope::KnowledgeBase(kb);
        let (doc, _) = seed_document(&db, Some(kb), "a.txt", &["tokio runtime"]);

        db.set_document_status(doc.id, DocumentStatus::Running).unwrap();
        assert!(db.keyword_search("tokio", &scope, 5).unwrap().is_empty());
        db.set_document_status(doc.id, DocumentStatus::Pending).unwrap();
        assert_eq!(db.keyword_search("tokio", &scope, 5).unwrap().len(), 1);

        db.set_document_enabled(doc.id, false).unwrap();
        assert!(db.keyword_search("tokio", &scope, 5).unwrap().is_empty());
    }

    #[test]
    fn test_updated_text_is_searchable() {
        let db = MetadataDb::in_memory().unwrap();
        let (doc, chunks) = seed_document(&db, None, "scan.png", &[""]);
        db.update_chunk_text(chunks[0].id, "invoice total", 2).unwrap();

        let scope = SearchScope::Temporary(vec![doc.id]);
        let hits = db.keyword_search("invoice", &scope, 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.token_count, 2);
        assert!(db.keyword_search("invoice", &SearchScope::Temporary(vec![]), 5).unwrap().is_empty());
    }

    #[test]
    fn test_visible_chunks_keeps_order() {
        let db = MetadataDb::in_memory().unwrap();
        let kb = Uuid::new_v4();
        let (_, chunks) = seed_document(&db, Some(kb), "a.txt", &["one", "two", "three"]);
        let ids = vec![chunks[2].id, Uuid::new_v4(), chunks[0].id];
        let visible = db.visible_chunks(&ids, &SearchScope::KnowledgeBase(kb)).unwrap();
        assert_eq!(visible.iter().map(|c| c.id).collect::<Vec<_>>(), vec![chunks[2].id, chunks[0].id]);
    }
}
