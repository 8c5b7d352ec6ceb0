//! LLM provider trait for text generation and image summaries

use async_trait::async_trait;
use crate::error::Result;

/// Trait for LLM calls made during ingestion and retrieval
///
/// Implementations:
/// - `OllamaLlm`: Local Ollama server (phi3 for text, llava for images)
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete a prompt
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Describe an image, using the surrounding paragraphs as context
    async fn summarize_image(&self, image: &[u8], context: &str) -> Result<String>;

    /// Get provider name for logging
    fn name(&self) -> &str;

    /// Get the model being used for text generation
    fn model(&self) -> &str;
}
