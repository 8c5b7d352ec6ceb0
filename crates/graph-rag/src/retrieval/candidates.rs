//! Candidate gathering
//!
//! Keyword and vector search run concurrently, each under its own timeout
//! and attempt limit. Keyword hits fill the first half of `top_k`, vector
//! hits the rest. When the vector side is unavailable the keyword side fills
//! every slot.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::error::{Error, Result};
use crate::providers::EmbeddingProvider;
use crate::storage::{MetadataDb, VectorIndex, VectorSpace};
use crate::types::{Chunk, SearchScope};

/// Which search produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Keyword,
    Vector,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk: Chunk,
    pub source: CandidateSource,
}

/// Hits to expand plus next-best candidates for replacing irrelevant ones
#[derive(Debug, Default)]
pub struct CandidateSet {
    pub hits: Vec<Candidate>,
    pub reserve: Vec<Candidate>,
    /// False when the vector side failed or timed out
    pub vector_available: bool,
}

/// Run `op` up to `attempts` times, each bounded by `timeout`
pub(crate) async fn with_retries<T, F, Fut>(label: &str, attempts: u32, timeout: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut last_error = Error::internal(format!("{} was not attempted", label));
    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                tracing::warn!("{} attempt {}/{} failed: {}", label, attempt, attempts, e);
                last_error = e;
            }
            Err(_) => {
                tracing::warn!("{} attempt {}/{} timed out after {:?}", label, attempt, attempts, timeout);
                last_error = Error::Timeout(timeout);
            }
        }
    }
    Err(last_error)
}

pub struct CandidateGatherer {
    db: Arc<MetadataDb>,
    vectors: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrievalConfig,
}

impl CandidateGatherer {
    pub fn new(
        db: Arc<MetadataDb>,
        vectors: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            db,
            vectors,
            embedder,
            config,
        }
    }

    pub async fn gather(&self, query: &str, scope: &SearchScope, top_k: usize) -> Result<CandidateSet> {
        if top_k == 0 {
            return Ok(CandidateSet::default());
        }
        let pool = top_k * 2;
        let (keyword, vector) = tokio::join!(self.keyword(query, scope, pool), self.vector(query, scope, pool));

        // Keyword failure is fatal only when there is nothing to degrade to
        let keyword = match (keyword, &vector) {
            (Ok(hits), _) => hits,
            (Err(e), Ok(_)) => {
                tracing::warn!("Keyword search unavailable, using vector results only: {}", e);
                Vec::new()
            }
            (Err(e), Err(_)) => return Err(e),
        };
        let (vector, vector_available) = match vector {
            Ok(hits) => (hits, true),
            Err(e) => {
                tracing::warn!("Vector search unavailable, using keyword results only: {}", e);
                (Vec::new(), false)
            }
        };

        Ok(merge(keyword, vector, top_k, vector_available))
    }

    async fn keyword(&self, query: &str, scope: &SearchScope, limit: usize) -> Result<Vec<Chunk>> {
        with_retries("Keyword search", self.config.max_attempts, self.config.keyword_timeout(), || {
            let db = Arc::clone(&self.db);
            let query = query.to_string();
            let scope = scope.clone();
            async move {
                tokio::task::spawn_blocking(move || db.keyword_search(&query, &scope, limit))
                    .await
                    .map_err(|e| Error::internal(format!("Keyword search task failed: {}", e)))?
            }
        })
        .await
        .map(|hits| hits.into_iter().map(|hit| hit.chunk).collect())
    }

    async fn vector(&self, query: &str, scope: &SearchScope, limit: usize) -> Result<Vec<Chunk>> {
        let (space, documents) = match scope {
            SearchScope::KnowledgeBase(kb_id) => (VectorSpace::KnowledgeBase(*kb_id), None),
            SearchScope::Temporary(ids) => (VectorSpace::Temporary, Some(ids.clone())),
        };
        with_retries("Vector search", self.config.max_attempts, self.config.vector_timeout(), || {
            let db = Arc::clone(&self.db);
            let embedder = Arc::clone(&self.embedder);
            let vectors = Arc::clone(&self.vectors);
            let scope = scope.clone();
            let documents = documents.clone();
            async move {
                let embedding = embedder.embed(query).await?;
                tokio::task::spawn_blocking(move || {
                    visible_matches(&db, &vectors, space, &embedding, &scope, documents.as_deref(), limit)
                })
                .await
                .map_err(|e| Error::internal(format!("Vector search task failed: {}", e)))?
            }
        })
        .await
    }
}

/// Nearest `limit` chunks that are still visible. Hidden documents keep
/// their vectors, so the search widens until enough survive the filter or
/// the space runs out.
fn visible_matches(
    db: &MetadataDb,
    vectors: &VectorIndex,
    space: VectorSpace,
    embedding: &[f32],
    scope: &SearchScope,
    documents: Option<&[Uuid]>,
    limit: usize,
) -> Result<Vec<Chunk>> {
    let mut fetch = limit.max(1);
    loop {
        let matches = vectors.search(space, embedding, fetch, documents)?;
        let ids: Vec<Uuid> = matches.iter().map(|m| m.chunk_id).collect();
        let mut visible = db.visible_chunks(&ids, scope)?;
        if visible.len() >= limit || matches.len() < fetch {
            visible.truncate(limit);
            return Ok(visible);
        }
        fetch = fetch.saturating_mul(4);
    }
}

/// Keyword hits take the first `top_k / 2` slots, vector hits the rest,
/// leftover keyword hits fill any gap. Everything unused is kept as reserve.
fn merge(keyword: Vec<Chunk>, vector: Vec<Chunk>, top_k: usize, vector_available: bool) -> CandidateSet {
    let keyword_slots = if vector_available { top_k / 2 } else { top_k };
    let mut seen = HashSet::new();
    let mut hits = Vec::with_capacity(top_k);
    let mut reserve = Vec::new();

    let mut keyword = keyword.into_iter();
    for chunk in keyword.by_ref().take(keyword_slots) {
        if seen.insert(chunk.id) {
            hits.push(Candidate {
                chunk,
                source: CandidateSource::Keyword,
            });
        }
    }
    for chunk in vector {
        if !seen.insert(chunk.id) {
            continue;
        }
        let candidate = Candidate {
            chunk,
            source: CandidateSource::Vector,
        };
        if hits.len() < top_k {
            hits.push(candidate);
        } else {
            reserve.push(candidate);
        }
    }
    for chunk in keyword {
        if !seen.insert(chunk.id) {
            continue;
        }
        let candidate = Candidate {
            chunk,
            source: CandidateSource::Keyword,
        };
        if hits.len() < top_k {
            hits.push(candidate);
        } else {
            reserve.push(candidate);
        }
    }

    CandidateSet {
        hits,
        reserve,
        vector_available,
    }
}
