//! Deterministic provider stubs and a wired task context for unit tests

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::chunking::tokens::content_words;
use crate::config::RagConfig;
use crate::error::{Error, Result};
use crate::ingestion::DocumentParser;
use crate::processing::TaskContext;
use crate::providers::{EmbeddingProvider, LlmProvider, OcrProvider};
use crate::storage::{LocalObjectStore, MetadataDb, SqliteQueue, VectorIndex};

pub(crate) const STUB_DIMENSIONS: usize = 8;

/// Bag-of-words embedding hashed into a few buckets
pub(crate) struct StubEmbedder;

pub(crate) fn stub_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0.0; STUB_DIMENSIONS];
    for word in content_words(text) {
        let bucket = word.bytes().fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
        v[bucket % STUB_DIMENSIONS] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(stub_embedding(text))
    }

    fn dimensions(&self) -> usize {
        STUB_DIMENSIONS
    }

    fn model(&self) -> &str {
        "stub"
    }

    fn name(&self) -> &str {
        "stub"
    }
}

pub(crate) struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::embedding("embedding service unavailable"))
    }

    fn dimensions(&self) -> usize {
        STUB_DIMENSIONS
    }

    fn model(&self) -> &str {
        "failing"
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Embedder that answers only after a delay
pub(crate) struct SlowEmbedder(pub Duration);

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        tokio::time::sleep(self.0).await;
        Ok(stub_embedding(text))
    }

    fn dimensions(&self) -> usize {
        STUB_DIMENSIONS
    }

    fn model(&self) -> &str {
        "slow"
    }

    fn name(&self) -> &str {
        "slow"
    }
}

/// LLM returning a fixed completion and empty image summaries
pub(crate) struct StubLlm(pub String);

#[async_trait]
impl LlmProvider for StubLlm {
    async fn generate(&self, _prompt: &str) -> Result<String> {
        Ok(self.0.clone())
    }

    async fn summarize_image(&self, _image: &[u8], _context: &str) -> Result<String> {
        Ok(String::new())
    }

    fn name(&self) -> &str {
        "stub"
    }

    fn model(&self) -> &str {
        "stub"
    }
}

pub(crate) struct StubOcr;

#[async_trait]
impl OcrProvider for StubOcr {
    async fn recognize(&self, _image: &[u8]) -> Result<String> {
        Ok("recognised text".to_string())
    }

    fn name(&self) -> &str {
        "stub"
    }
}

/// Task context over an in-memory database and a temporary blob directory
pub(crate) fn context() -> (Arc<TaskContext>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RagConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.embeddings.dimensions = STUB_DIMENSIONS;
    config.chunking.embed_batch_size = 4;

    let db = Arc::new(MetadataDb::in_memory().unwrap());
    let ctx = TaskContext {
        queue: Arc::new(SqliteQueue::new(db.connection())),
        vectors: Arc::new(VectorIndex::new(db.connection())),
        blobs: Arc::new(LocalObjectStore::new(config.storage.blob_dir()).unwrap()),
        parser: Arc::new(DocumentParser::new(&config.parser).unwrap()),
        embedder: Arc::new(StubEmbedder),
        llm: Arc::new(StubLlm(String::new())),
        ocr: Arc::new(StubOcr),
        db,
        config,
    };
    (Arc::new(ctx), dir)
}
