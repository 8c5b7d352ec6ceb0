//! Paragraph splitting and merging ahead of chunk construction

use super::tokens::{cosine_similarity, count_tokens, split_to_budget, term_frequencies};
use crate::ingestion::{NodeTopology, NodeType, ParseNode};

/// Size rules for paragraph leaves
#[derive(Debug, Clone, Copy)]
pub struct MergePolicy {
    /// Token budget of one chunk
    pub budget: usize,
    /// TF cosine similarity above which paragraphs may merge up to the full budget
    pub similarity_threshold: f32,
}

impl MergePolicy {
    pub fn new(budget: usize, similarity_threshold: f32) -> Self {
        Self {
            budget: budget.max(1),
            similarity_threshold,
        }
    }

    fn should_merge(&self, a: &str, b: &str) -> bool {
        let combined = count_tokens(a) + count_tokens(b);
        if combined < self.budget / 2 {
            return true;
        }
        combined < self.budget
            && cosine_similarity(&term_frequencies(a), &term_frequencies(b)) > self.similarity_threshold
    }
}

/// Headed tree sections are never merged into each other
fn is_paragraph_leaf(node: &ParseNode) -> bool {
    node.node_type == NodeType::Text
        && node.children.is_empty()
        && match node.topology {
            NodeTopology::ListLeaf => true,
            NodeTopology::TreeLeaf => node.title.is_none(),
            _ => false,
        }
}

/// Split oversized paragraph leaves, then merge short or near-duplicate
/// neighbours. Only sibling leaves are touched; nodes with children keep
/// their place, and the pass recurses into them.
pub fn normalize_siblings(nodes: Vec<ParseNode>, policy: &MergePolicy) -> Vec<ParseNode> {
    let mut split = Vec::with_capacity(nodes.len());
    for mut node in nodes {
        if !node.children.is_empty() {
            node.children = normalize_siblings(std::mem::take(&mut node.children), policy);
            split.push(node);
            continue;
        }
        if is_paragraph_leaf(&node) && count_tokens(&node.text()) > policy.budget {
            let text = node.text();
            for piece in split_to_budget(&text, policy.budget) {
                let mut part = ParseNode::new(node.topology, NodeType::Text, piece);
                part.level = node.level;
                split.push(part);
            }
            continue;
        }
        split.push(node);
    }

    let mut merged: Vec<ParseNode> = Vec::with_capacity(split.len());
    for node in split {
        if let Some(prev) = merged.last_mut() {
            if is_paragraph_leaf(prev) && is_paragraph_leaf(&node) {
                let (a, b) = (prev.text(), node.text());
                if policy.should_merge(&a, &b) {
                    prev.title = None;
                    prev.content = format!("{}\n{}", a, b);
                    continue;
                }
            }
        }
        merged.push(node);
    }
    merged
}
