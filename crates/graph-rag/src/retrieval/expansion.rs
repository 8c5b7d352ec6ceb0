//! Context expansion around hits
//!
//! Every hit gets the same neighbour allowance, `token_budget / #hits`,
//! fixed before expansion starts. All hits also draw from one shared
//! remaining-budget counter; once it is spent nothing more is added.

use std::collections::BTreeMap;
use uuid::Uuid;

use super::arbiter::Expansion;
use crate::error::Result;
use crate::storage::MetadataDb;
use crate::types::Chunk;

/// Chunks gathered for one document, keyed by global offset
#[derive(Debug, Clone)]
pub struct DocumentContext {
    pub document_id: Uuid,
    pub chunks: BTreeMap<i64, Chunk>,
}

/// Accumulates expanded hits per document in first-hit order
pub struct ContextExpander<'a> {
    db: &'a MetadataDb,
    allowance: usize,
    remaining: usize,
    documents: Vec<DocumentContext>,
}

impl<'a> ContextExpander<'a> {
    pub fn new(db: &'a MetadataDb, token_budget: usize, hit_count: usize) -> Self {
        Self {
            db,
            allowance: token_budget / hit_count.max(1),
            remaining: token_budget,
            documents: Vec::new(),
        }
    }

    pub fn allowance(&self) -> usize {
        self.allowance
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// Add a hit and expand around it. Returns the tokens consumed.
    pub fn add_hit(&mut self, hit: &Chunk, expansion: Expansion) -> Result<usize> {
        if self.is_exhausted() {
            return Ok(0);
        }
        let before = self.remaining;
        self.insert(hit.clone());

        let mut spent = 0;
        let mut prev = Some(hit.global_offset - 1);
        let mut next = Some(hit.global_offset + 1);
        if !expansion.before() {
            prev = None;
        }
        if !expansion.after() {
            next = None;
        }

        // Alternate sides so a hit grows symmetrically
        while prev.is_some() || next.is_some() {
            if let Some(offset) = prev {
                prev = self.take_neighbour(hit.document_id, offset, &mut spent)?.then(|| offset - 1);
            }
            if let Some(offset) = next {
                next = self.take_neighbour(hit.document_id, offset, &mut spent)?.then(|| offset + 1);
            }
        }
        Ok(before - self.remaining)
    }

    pub fn into_documents(self) -> Vec<DocumentContext> {
        self.documents
    }

    /// Pull in the chunk at `offset` if it exists, is enabled and fits both
    /// budgets. Returns whether the walk may continue past it.
    fn take_neighbour(&mut self, document_id: Uuid, offset: i64, spent: &mut usize) -> Result<bool> {
        if offset < 0 || self.remaining == 0 {
            return Ok(false);
        }
        if self.contains(document_id, offset) {
            return Ok(true);
        }
        let Some(chunk) = self.db.chunk_at(document_id, offset)? else {
            return Ok(false);
        };
        if !chunk.enabled {
            return Ok(false);
        }
        let cost = chunk.token_count;
        if *spent + cost > self.allowance || cost > self.remaining {
            return Ok(false);
        }
        *spent += cost;
        self.insert(chunk);
        Ok(true)
    }

    fn contains(&self, document_id: Uuid, offset: i64) -> bool {
        self.documents
            .iter()
            .any(|d| d.document_id == document_id && d.chunks.contains_key(&offset))
    }

    /// Insert a chunk, charging the shared counter unless already present.
    /// A hit larger than what is left is still inserted; assembly truncates.
    fn insert(&mut self, chunk: Chunk) {
        let index = match self.documents.iter().position(|d| d.document_id == chunk.document_id) {
            Some(index) => index,
            None => {
                self.documents.push(DocumentContext {
                    document_id: chunk.document_id,
                    chunks: BTreeMap::new(),
                });
                self.documents.len() - 1
            }
        };
        let chunks = &mut self.documents[index].chunks;
        if chunks.contains_key(&chunk.global_offset) {
            return;
        }
        self.remaining = self.remaining.saturating_sub(chunk.token_count);
        chunks.insert(chunk.global_offset, chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::seed_document;

    fn offsets(ctx: &DocumentContext) -> Vec<i64> {
        ctx.chunks.keys().copied().collect()
    }

    #[test]
    fn test_allowance_is_split_across_hits() {
        let db = MetadataDb::in_memory().unwrap();
        let expander = ContextExpander::new(&db, 200, 10);
        assert_eq!(expander.allowance(), 20);
        assert_eq!(expander.remaining(), 200);
    }

    #[test]
    fn test_expands_both_sides_within_allowance() {
        let db = MetadataDb::in_memory().unwrap();
        // two tokens per chunk
        let (doc, chunks) = seed_document(&db, None, "a.txt", &["a0 b0", "a1 b1", "a2 b2", "a3 b3", "a4 b4"]);
        let mut expander = ContextExpander::new(&db, 6, 1);

        let used = expander.add_hit(&chunks[2], Expansion::Both).unwrap();
        assert_eq!(used, 6);
        let docs = expander.into_documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].document_id, doc.id);
        assert_eq!(offsets(&docs[0]), vec![1, 2, 3]);
    }

    #[test]
    fn test_one_sided_expansion() {
        let db = MetadataDb::in_memory().unwrap();
        let (_, chunks) = seed_document(&db, None, "a.txt", &["a0 b0", "a1 b1", "a2 b2", "a3 b3"]);
        let mut expander = ContextExpander::new(&db, 100, 1);

        expander.add_hit(&chunks[1], Expansion::Before).unwrap();
        let docs = expander.into_documents();
        assert_eq!(offsets(&docs[0]), vec![0, 1]);
    }

    #[test]
    fn test_overlapping_hits_are_deduplicated() {
        let db = MetadataDb::in_memory().unwrap();
        let (_, chunks) = seed_document(&db, None, "a.txt", &["a0 b0", "a1 b1", "a2 b2"]);
        let mut expander = ContextExpander::new(&db, 100, 2);

        expander.add_hit(&chunks[0], Expansion::Both).unwrap();
        let before = expander.remaining();
        let used = expander.add_hit(&chunks[1], Expansion::Both).unwrap();
        assert_eq!(before - expander.remaining(), used);
        let docs = expander.into_documents();
        assert_eq!(offsets(&docs[0]), vec![0, 1, 2]);
    }

    #[test]
    fn test_shared_budget_stops_expansion() {
        let db = MetadataDb::in_memory().unwrap();
        let (_, first) = seed_document(&db, None, "a.txt", &["a0 b0", "a1 b1", "a2 b2"]);
        let (_, second) = seed_document(&db, None, "b.txt", &["c0 d0", "c1 d1", "c2 d2"]);
        let mut expander = ContextExpander::new(&db, 4, 1);

        expander.add_hit(&first[1], Expansion::Both).unwrap();
        assert!(expander.is_exhausted());
        assert_eq!(expander.add_hit(&second[1], Expansion::Both).unwrap(), 0);
        assert_eq!(expander.into_documents().len(), 1);
    }
}
