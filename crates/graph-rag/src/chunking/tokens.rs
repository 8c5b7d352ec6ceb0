//! Token counting, term vectors and budget-bounded text reduction
//!
//! A token is a Unicode word (UAX #29). This is the unit of every chunk and
//! retrieval budget in the crate.

use std::collections::HashMap;
use unicode_segmentation::UnicodeSegmentation;

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "all", "am", "an", "and", "any", "are", "as", "at",
    "be", "because", "been", "before", "being", "below", "between", "both", "but", "by", "can",
    "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for", "from",
    "further", "had", "has", "have", "having", "he", "her", "here", "hers", "him", "his", "how",
    "i", "if", "in", "into", "is", "it", "its", "itself", "just", "me", "more", "most", "my",
    "no", "nor", "not", "now", "of", "off", "on", "once", "only", "or", "other", "our", "ours",
    "out", "over", "own", "same", "she", "should", "so", "some", "such", "than", "that", "the",
    "their", "theirs", "them", "then", "there", "these", "they", "this", "those", "through", "to",
    "too", "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours",
];

/// Number of tokens in `text`
pub fn count_tokens(text: &str) -> usize {
    text.unicode_words().count()
}

pub fn is_stop_word(word: &str) -> bool {
    let lower = word.to_lowercase();
    STOP_WORDS.binary_search(&lower.as_str()).is_ok()
}

/// Lower-cased content words
pub fn content_words(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(|w| w.to_lowercase())
        .filter(|w| STOP_WORDS.binary_search(&w.as_str()).is_err())
        .collect()
}

/// Term-frequency vector over content words
pub fn term_frequencies(text: &str) -> HashMap<String, f32> {
    let mut tf = HashMap::new();
    for word in content_words(text) {
        *tf.entry(word).or_insert(0.0) += 1.0;
    }
    tf
}

/// Cosine similarity of two sparse term vectors; 0 when either is empty
pub fn cosine_similarity(a: &HashMap<String, f32>, b: &HashMap<String, f32>) -> f32 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f32 = small
        .iter()
        .filter_map(|(term, x)| large.get(term).map(|y| x * y))
        .sum();
    let norm_a: f32 = a.values().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.values().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Prefix of `text` holding at most `max_tokens` tokens
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> &str {
    if max_tokens == 0 {
        return "";
    }
    match text.unicode_word_indices().nth(max_tokens - 1) {
        Some((start, word)) => &text[..start + word.len()],
        None => text,
    }
}

/// Drop stop words, then truncate to `max_tokens`
pub fn compress(text: &str, max_tokens: usize) -> String {
    let kept: Vec<&str> = text
        .unicode_words()
        .filter(|w| !is_stop_word(w))
        .take(max_tokens)
        .collect();
    kept.join(" ")
}

/// Split `text` into pieces of at most `budget` tokens, preferring sentence
/// boundaries and falling back to word boundaries for long sentences
pub fn split_to_budget(text: &str, budget: usize) -> Vec<String> {
    let budget = budget.max(1);
    if count_tokens(text) <= budget {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0;

    for sentence in text.split_sentence_bounds() {
        let tokens = count_tokens(sentence);
        if tokens > budget {
            if !current.trim().is_empty() {
                pieces.push(current.trim().to_string());
            }
            current.clear();
            current_tokens = 0;

            let mut rest = sentence;
            while count_tokens(rest) > budget {
                let head = truncate_to_tokens(rest, budget);
                pieces.push(head.trim().to_string());
                rest = &rest[head.len()..];
            }
            current.push_str(rest);
            current_tokens = count_tokens(rest);
            continue;
        }
        if current_tokens + tokens > budget && !current.trim().is_empty() {
            pieces.push(current.trim().to_string());
            current.clear();
            current_tokens = 0;
        }
        current.push_str(sentence);
        current_tokens += tokens;
    }
    if !current.trim().is_empty() {
        pieces.push(current.trim().to_string());
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_words_sorted() {
        let mut sorted = STOP_WORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOP_WORDS.to_vec());
    }

    #[test]
    fn test_count_tokens() {
        assert_eq!(count_tokens("Hello, world! It's 2024."), 4);
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn test_cosine_similarity() {
        let a = term_frequencies("rust borrow checker rules");
        let b = term_frequencies("the rust borrow checker rules");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);

        let c = term_frequencies("python garbage collector");
        assert_eq!(cosine_similarity(&a, &c), 0.0);
        assert_eq!(cosine_similarity(&a, &HashMap::new()), 0.0);
    }

    #[test]
    fn test_truncate_and_compress() {
        assert_eq!(truncate_to_tokens("one two three four", 2), "one two");
        assert_eq!(truncate_to_tokens("one two", 5), "one two");
        assert_eq!(truncate_to_tokens("one", 0), "");
        assert_eq!(compress("The cat sat on the mat near the door", 3), "cat sat mat");
    }

    #[test]
    fn test_split_to_budget() {
        let text = "First sentence here. Second one follows. A third closes it.";
        let pieces = split_to_budget(text, 6);
        assert!(pieces.len() >= 2);
        assert!(pieces.iter().all(|p| count_tokens(p) <= 6));
        assert_eq!(
            pieces.iter().map(|p| count_tokens(p)).sum::<usize>(),
            count_tokens(text)
        );

        let long = "w ".repeat(25);
        let pieces = split_to_budget(&long, 10);
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| count_tokens(p) <= 10));
    }
}
