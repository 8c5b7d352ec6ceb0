//! LLM relevance arbitration of hit windows
//!
//! Each hit is classified against the query. The class decides whether the
//! hit is replaced, dropped, kept verbatim or expanded towards the side that
//! is missing context.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::providers::LlmProvider;

/// Relevance class of a hit window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    Irrelevant,
    Weak,
    MissingPrior,
    MissingFollowing,
    MissingBoth,
    Complete,
}

impl Relevance {
    const ALL: [Relevance; 6] = [
        Relevance::Irrelevant,
        Relevance::Weak,
        Relevance::MissingPrior,
        Relevance::MissingFollowing,
        Relevance::MissingBoth,
        Relevance::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Relevance::Irrelevant => "irrelevant",
            Relevance::Weak => "weakly-relevant",
            Relevance::MissingPrior => "missing-prior-context",
            Relevance::MissingFollowing => "missing-following-context",
            Relevance::MissingBoth => "missing-both",
            Relevance::Complete => "complete",
        }
    }

    /// First whole label in a model answer; "incomplete" is not "complete"
    pub fn parse(answer: &str) -> Option<Self> {
        let answer = answer.to_lowercase();
        answer
            .split(|c: char| !(c.is_alphanumeric() || c == '-'))
            .find_map(|word| Self::ALL.iter().copied().find(|r| r.as_str() == word))
    }
}

/// Which neighbours of a hit to pull in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expansion {
    None,
    Before,
    After,
    Both,
}

impl Expansion {
    pub fn before(&self) -> bool {
        matches!(self, Expansion::Before | Expansion::Both)
    }

    pub fn after(&self) -> bool {
        matches!(self, Expansion::After | Expansion::Both)
    }
}

/// What happens to a classified hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Keep(Expansion),
    Drop,
    Replace,
}

#[async_trait]
pub trait RelevanceClassifier: Send + Sync {
    async fn classify(&self, query: &str, window: &str) -> Result<Relevance>;

    fn name(&self) -> &str;
}

/// Classifier asking an LLM for one of the relevance labels
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    fn prompt(query: &str, window: &str) -> String {
        let labels: Vec<&str> = Relevance::ALL.iter().map(Relevance::as_str).collect();
        format!(
            "You judge whether a text passage helps answer a question.\n\n\
             Question: {}\n\nPassage:\n{}\n\n\
             Answer with exactly one label from: {}.\n\
             Use missing-prior-context or missing-following-context when the passage is relevant \
             but cut off before or after, missing-both when it is cut off on both sides.",
            query,
            window,
            labels.join(", ")
        )
    }
}

#[async_trait]
impl RelevanceClassifier for LlmClassifier {
    async fn classify(&self, query: &str, window: &str) -> Result<Relevance> {
        let answer = tokio::time::timeout(self.timeout, self.llm.generate(&Self::prompt(query, window)))
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;
        Relevance::parse(&answer).ok_or_else(|| Error::llm(format!("Unrecognised relevance label: {}", answer.trim())))
    }

    fn name(&self) -> &str {
        self.llm.name()
    }
}

/// Turns relevance classes into decisions. Weak windows are kept with a
/// fixed probability drawn from an RNG seeded by the query, so the same
/// query over the same data decides the same way.
pub struct Arbiter {
    classifier: Arc<dyn RelevanceClassifier>,
    keep_probability: f64,
    rng: StdRng,
}

impl Arbiter {
    pub fn new(classifier: Arc<dyn RelevanceClassifier>, keep_probability: f64, query: &str) -> Self {
        Self {
            classifier,
            keep_probability: keep_probability.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(query_seed(query)),
        }
    }

    /// Classify a window; classifier failures fall back to expanding both ways
    pub async fn judge(&mut self, query: &str, window: &str) -> Decision {
        let relevance = match self.classifier.classify(query, window).await {
            Ok(relevance) => relevance,
            Err(e) => {
                tracing::warn!("Relevance classification via {} failed: {}", self.classifier.name(), e);
                Relevance::MissingBoth
            }
        };
        tracing::debug!("Window classified as {}", relevance.as_str());
        self.decide(relevance)
    }

    pub fn decide(&mut self, relevance: Relevance) -> Decision {
        match relevance {
            Relevance::Irrelevant => Decision::Replace,
            Relevance::Weak => {
                if self.rng.gen_bool(self.keep_probability) {
                    Decision::Keep(Expansion::None)
                } else {
                    Decision::Drop
                }
            }
            Relevance::MissingPrior => Decision::Keep(Expansion::Before),
            Relevance::MissingFollowing => Decision::Keep(Expansion::After),
            Relevance::MissingBoth => Decision::Keep(Expansion::Both),
            Relevance::Complete => Decision::Keep(Expansion::None),
        }
    }
}

fn query_seed(query: &str) -> u64 {
    let digest = Sha256::digest(query.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubLlm;

    struct Fixed(Relevance);

    #[async_trait]
    impl RelevanceClassifier for Fixed {
        async fn classify(&self, _query: &str, _window: &str) -> Result<Relevance> {
            Ok(self.0)
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[test]
    fn test_parse_picks_first_label() {
        assert_eq!(Relevance::parse("Label: missing-prior-context"), Some(Relevance::MissingPrior));
        assert_eq!(Relevance::parse("COMPLETE, not irrelevant"), Some(Relevance::Complete));
        assert_eq!(Relevance::parse("no idea"), None);
    }

    #[test]
    fn test_parse_matches_whole_labels_only() {
        assert_eq!(
            Relevance::parse("incomplete; missing-prior-context"),
            Some(Relevance::MissingPrior)
        );
        assert_eq!(Relevance::parse("weakly-relevant-ish"), None);
        assert_eq!(Relevance::parse("(irrelevant)."), Some(Relevance::Irrelevant));
    }

    #[test]
    fn test_decisions() {
        let mut arbiter = Arbiter::new(Arc::new(Fixed(Relevance::Complete)), 0.5, "q");
        assert_eq!(arbiter.decide(Relevance::Irrelevant), Decision::Replace);
        assert_eq!(arbiter.decide(Relevance::MissingFollowing), Decision::Keep(Expansion::After));
        assert_eq!(arbiter.decide(Relevance::Complete), Decision::Keep(Expansion::None));
    }

    #[test]
    fn test_weak_windows_are_reproducible() {
        let draws = |query: &str| {
            let mut arbiter = Arbiter::new(Arc::new(Fixed(Relevance::Weak)), 0.5, query);
            (0..32).map(|_| arbiter.decide(Relevance::Weak)).collect::<Vec<_>>()
        };
        assert_eq!(draws("same query"), draws("same query"));

        let mut always = Arbiter::new(Arc::new(Fixed(Relevance::Weak)), 1.0, "q");
        assert_eq!(always.decide(Relevance::Weak), Decision::Keep(Expansion::None));
        let mut never = Arbiter::new(Arc::new(Fixed(Relevance::Weak)), 0.0, "q");
        assert_eq!(never.decide(Relevance::Weak), Decision::Drop);
    }

    #[tokio::test]
    async fn test_llm_classifier_falls_back_on_garbage() {
        let classifier = LlmClassifier::new(Arc::new(StubLlm("maybe".into())), Duration::from_secs(1));
        assert!(classifier.classify("q", "w").await.is_err());

        let mut arbiter = Arbiter::new(Arc::new(classifier), 0.5, "q");
        assert_eq!(arbiter.judge("q", "w").await, Decision::Keep(Expansion::Both));

        let classifier = LlmClassifier::new(Arc::new(StubLlm("irrelevant".into())), Duration::from_secs(1));
        assert_eq!(classifier.classify("q", "w").await.unwrap(), Relevance::Irrelevant);
    }
}
