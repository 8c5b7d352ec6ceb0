//! Hybrid retrieval with token-budgeted context expansion
//!
//! A search gathers keyword and vector candidates, optionally has an LLM
//! arbitrate each hit, expands hits into their neighbouring chunks and
//! assembles per-document passages that fit the caller's token budget.

pub mod arbiter;
pub mod assembly;
pub mod candidates;
pub mod expansion;

pub use arbiter::{Arbiter, Decision, Expansion, LlmClassifier, Relevance, RelevanceClassifier};
pub use candidates::{Candidate, CandidateGatherer, CandidateSet, CandidateSource};
pub use expansion::{ContextExpander, DocumentContext};

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::error::Result;
use crate::providers::EmbeddingProvider;
use crate::storage::{MetadataDb, VectorIndex};
use crate::types::{DocumentPassages, SearchRequest};

pub struct RetrievalEngine {
    db: Arc<MetadataDb>,
    gatherer: CandidateGatherer,
    classifier: Option<Arc<dyn RelevanceClassifier>>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        db: Arc<MetadataDb>,
        vectors: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            gatherer: CandidateGatherer::new(Arc::clone(&db), vectors, embedder, config.clone()),
            db,
            classifier: None,
            config,
        }
    }

    /// Enable arbitration with a classifier (used only when the config allows it)
    pub fn with_classifier(mut self, classifier: Arc<dyn RelevanceClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<DocumentPassages>> {
        if request.query.trim().is_empty() || request.top_k == 0 || request.token_budget == 0 {
            return Ok(Vec::new());
        }

        let candidates = self
            .gatherer
            .gather(&request.query, &request.scope, request.top_k)
            .await?;
        tracing::info!(
            "Search '{}': {} hits, {} in reserve{}",
            request.query,
            candidates.hits.len(),
            candidates.reserve.len(),
            if candidates.vector_available { "" } else { " (keyword only)" }
        );
        if candidates.hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut expander = ContextExpander::new(&self.db, request.token_budget, candidates.hits.len());
        match self.arbiter(&request.query) {
            Some(mut arbiter) => {
                self.expand_arbitrated(&mut arbiter, &request.query, candidates, &mut expander)
                    .await?
            }
            None => {
                for hit in &candidates.hits {
                    if expander.is_exhausted() {
                        break;
                    }
                    expander.add_hit(&hit.chunk, Expansion::Both)?;
                }
            }
        }

        let mut result = Vec::new();
        for ctx in expander.into_documents() {
            let Some(doc) = self.db.get_document(ctx.document_id)? else {
                continue;
            };
            let passages = assembly::passages(&ctx);
            if passages.is_empty() {
                continue;
            }
            result.push(DocumentPassages {
                document_id: doc.id,
                document_name: doc.name,
                passages,
            });
        }
        Ok(assembly::fit_to_budget(result, request.token_budget))
    }

    fn arbiter(&self, query: &str) -> Option<Arbiter> {
        if !self.config.arbitration_enabled {
            return None;
        }
        let classifier = self.classifier.as_ref()?;
        Some(Arbiter::new(Arc::clone(classifier), self.config.weak_keep_probability, query))
    }

    /// Irrelevant hits are swapped for the next reserve candidate, which is
    /// judged in turn
    async fn expand_arbitrated(
        &self,
        arbiter: &mut Arbiter,
        query: &str,
        candidates: CandidateSet,
        expander: &mut ContextExpander<'_>,
    ) -> Result<()> {
        let mut reserve: VecDeque<Candidate> = candidates.reserve.into();
        for hit in candidates.hits {
            let mut current = Some(hit);
            while let Some(candidate) = current.take() {
                if expander.is_exhausted() {
                    return Ok(());
                }
                match arbiter.judge(query, &candidate.chunk.text).await {
                    Decision::Keep(expansion) => {
                        expander.add_hit(&candidate.chunk, expansion)?;
                    }
                    Decision::Drop => {}
                    Decision::Replace => current = reserve.pop_front(),
                }
            }
        }
        Ok(())
    }
}
