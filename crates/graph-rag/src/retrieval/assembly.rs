//! Passage assembly
//!
//! Contiguous runs of global offsets become one passage each. When the
//! passages overrun the token budget they are recomputed with stop words
//! removed and truncated in order until the budget holds.

use crate::chunking::tokens::{compress, count_tokens};
use crate::types::DocumentPassages;

use super::expansion::DocumentContext;

/// Join contiguous chunks of one document into passages
pub fn passages(ctx: &DocumentContext) -> Vec<String> {
    let mut passages = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut last_offset = None;

    for (offset, chunk) in &ctx.chunks {
        if last_offset.is_some_and(|last| last + 1 != *offset) && !current.is_empty() {
            passages.push(current.join("\n"));
            current.clear();
        }
        if !chunk.text.trim().is_empty() {
            current.push(chunk.text.trim());
        }
        last_offset = Some(*offset);
    }
    if !current.is_empty() {
        passages.push(current.join("\n"));
    }
    passages
}

pub fn total_tokens(result: &[DocumentPassages]) -> usize {
    result
        .iter()
        .flat_map(|d| d.passages.iter())
        .map(|p| count_tokens(p))
        .sum()
}

/// Compress and truncate passages in order so the total fits `token_budget`.
/// Documents left without passages are dropped.
pub fn fit_to_budget(mut result: Vec<DocumentPassages>, token_budget: usize) -> Vec<DocumentPassages> {
    if total_tokens(&result) <= token_budget {
        return result;
    }
    tracing::debug!("Passages exceed {} tokens, compressing", token_budget);

    let mut remaining = token_budget;
    for doc in &mut result {
        for passage in &mut doc.passages {
            let compressed = compress(passage, remaining);
            remaining -= count_tokens(&compressed).min(remaining);
            *passage = compressed;
        }
        doc.passages.retain(|p| !p.is_empty());
    }
    result.retain(|d| !d.passages.is_empty());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::text_chunk;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn context(offsets: &[i64]) -> DocumentContext {
        let document_id = Uuid::new_v4();
        let chunks: BTreeMap<i64, _> = offsets
            .iter()
            .map(|&o| (o, text_chunk(document_id, o, &format!("chunk {}", o))))
            .collect();
        DocumentContext { document_id, chunks }
    }

    #[test]
    fn test_contiguous_runs_become_passages() {
        let ctx = context(&[0, 1, 2, 5, 6, 9]);
        assert_eq!(passages(&ctx), vec!["chunk 0\nchunk 1\nchunk 2", "chunk 5\nchunk 6", "chunk 9"]);
    }

    #[test]
    fn test_within_budget_is_untouched() {
        let result = vec![DocumentPassages {
            document_id: Uuid::new_v4(),
            document_name: "a".into(),
            passages: vec!["the cat sat on the mat".into()],
        }];
        assert_eq!(fit_to_budget(result.clone(), 10), result);
    }

    #[test]
    fn test_over_budget_is_compressed_and_truncated() {
        let result = vec![
            DocumentPassages {
                document_id: Uuid::new_v4(),
                document_name: "a".into(),
                passages: vec!["the cat sat on the mat with the dog".into()],
            },
            DocumentPassages {
                document_id: Uuid::new_v4(),
                document_name: "b".into(),
                passages: vec!["another passage entirely".into()],
            },
        ];
        let fitted = fit_to_budget(result, 5);
        assert!(total_tokens(&fitted) <= 5);
        assert_eq!(fitted[0].passages[0], "cat sat mat dog");
        assert_eq!(fitted.len(), 2);
        assert_eq!(fitted[1].passages[0], "another");
    }
}
