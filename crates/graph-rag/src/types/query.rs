//! Retrieval request and response types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which documents a query may see
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    /// Every enabled document of a knowledge base
    KnowledgeBase(Uuid),
    /// An explicit set of temporary documents
    Temporary(Vec<Uuid>),
}

/// A retrieval query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub scope: SearchScope,
    /// Number of hits gathered before expansion
    pub top_k: usize,
    /// Upper bound on the tokens of the returned passages
    pub token_budget: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, scope: SearchScope, top_k: usize, token_budget: usize) -> Self {
        Self {
            query: query.into(),
            scope,
            top_k,
            token_budget,
        }
    }
}

/// Passages retrieved from one document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentPassages {
    pub document_id: Uuid,
    pub document_name: String,
    pub passages: Vec<String>,
}

/// Status of a task as seen by collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub status: super::TaskStatus,
    pub retry: u32,
    pub reports: Vec<super::TaskStatusReport>,
}
