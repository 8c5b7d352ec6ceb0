//! Ollama client and the embedding/LLM providers built on it

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::{EmbeddingConfig, LlmConfig};
use crate::error::{Error, Result};

use super::embedding::EmbeddingProvider;
use super::llm::LlmProvider;

/// Ollama API client with automatic retry
pub struct OllamaClient {
    /// HTTP client
    client: Client,
    /// Server base URL
    base_url: String,
    /// Sampling temperature
    temperature: f32,
    /// Maximum retries
    max_retries: u32,
    /// First backoff delay, doubled per attempt
    base_delay: Duration,
}

#[derive(Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

impl OllamaClient {
    /// Create a new Ollama client with retry support
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            base_delay: Duration::from_secs(1),
        })
    }

    #[cfg(test)]
    fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Retry a request with exponential backoff
    async fn retry_request<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        let delay = self.base_delay * 2u32.pow(attempt);
                        tracing::warn!(
                            "Request failed (attempt {}/{}), retrying in {:?}",
                            attempt + 1,
                            self.max_retries + 1,
                            delay
                        );
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::llm("Unknown error")))
    }

    /// Check if Ollama is available
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.base_url);

        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    /// Generate an embedding with retry
    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);

        self.retry_request(|| {
            let request = EmbedRequest {
                model: model.to_string(),
                prompt: text.to_string(),
            };
            let request = self.client.post(&url).json(&request);

            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| Error::embedding(format!("Embedding request failed: {}", e)))?;

                if !response.status().is_success() {
                    return Err(Error::embedding(format!(
                        "Embedding failed: HTTP {}",
                        response.status()
                    )));
                }

                let embed_response: EmbedResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::embedding(format!("Failed to parse embedding response: {}", e)))?;

                if embed_response.embedding.is_empty() {
                    return Err(Error::embedding("Empty embedding returned"));
                }
                Ok(embed_response.embedding)
            }
        })
        .await
    }

    /// Complete a prompt, optionally attaching images, with retry
    pub async fn generate(&self, model: &str, prompt: &str, images: &[Vec<u8>]) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let images: Vec<String> = images
            .iter()
            .map(|data| base64::engine::general_purpose::STANDARD.encode(data))
            .collect();

        tracing::debug!("Generating with model {} ({} images)", model, images.len());

        self.retry_request(|| {
            let request = GenerateRequest {
                model: model.to_string(),
                prompt: prompt.to_string(),
                stream: false,
                images: images.clone(),
                options: GenerateOptions {
                    temperature: self.temperature,
                },
            };
            let request = self.client.post(&url).json(&request);

            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| Error::llm(format!("Generation request failed: {}", e)))?;

                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(Error::llm(format!("Generation failed: HTTP {} - {}", status, body)));
                }

                let generate_response: GenerateResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::llm(format!("Failed to parse generation response: {}", e)))?;

                Ok(generate_response.response.trim().to_string())
            }
        })
        .await
    }
}

/// Ollama embedding provider using nomic-embed-text or similar models
pub struct OllamaEmbedder {
    client: Arc<OllamaClient>,
    model: String,
    dimensions: usize,
}

impl OllamaEmbedder {
    pub fn new(client: Arc<OllamaClient>, config: &EmbeddingConfig) -> Self {
        Self {
            client,
            model: config.model.clone(),
            dimensions: config.dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self.client.embed(&self.model, text).await?;
        if embedding.len() != self.dimensions {
            return Err(Error::embedding(format!(
                "Model {} returned {} dimensions, expected {}",
                self.model,
                embedding.len(),
                self.dimensions
            )));
        }
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

/// Ollama LLM provider
pub struct OllamaLlm {
    client: Arc<OllamaClient>,
    model: String,
    vision_model: String,
}

impl OllamaLlm {
    pub fn new(client: Arc<OllamaClient>, config: &LlmConfig) -> Self {
        Self {
            client,
            model: config.generate_model.clone(),
            vision_model: config.vision_model.clone(),
        }
    }
}

/// Prompt asking a vision model to describe an image in its document context
fn image_summary_prompt(context: &str) -> String {
    let mut prompt = String::from(
        "Describe the content of this image so that it can be found by a text search. \
         Transcribe any visible text. Answer with the description only.",
    );
    if !context.trim().is_empty() {
        prompt.push_str("\n\nThe image appears in a document between these passages:\n");
        prompt.push_str(context.trim());
    }
    prompt
}

#[async_trait]
impl LlmProvider for OllamaLlm {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.client.generate(&self.model, prompt, &[]).await
    }

    async fn summarize_image(&self, image: &[u8], context: &str) -> Result<String> {
        let prompt = image_summary_prompt(context);
        self.client
            .generate(&self.vision_model, &prompt, &[image.to_vec()])
            .await
    }

    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn client(max_retries: u32) -> OllamaClient {
        let config = LlmConfig {
            base_url: "http://127.0.0.1:9/".to_string(),
            max_retries,
            timeout_secs: 2,
            ..LlmConfig::default()
        };
        OllamaClient::new(&config)
            .unwrap()
            .with_base_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let client = client(2);
        let calls = AtomicU32::new(0);
        let result = client
            .retry_request(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::llm("flaky"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let client = client(1);
        let calls = AtomicU32::new(0);
        let result: Result<()> = client
            .retry_request(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::llm("down")) }
            })
            .await;
        assert!(matches!(result, Err(Error::Llm(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let client = client(0);
        assert!(!client.health_check().await.unwrap());
        assert!(matches!(
            client.embed("nomic-embed-text", "hi").await,
            Err(Error::Embedding(_))
        ));
    }

    #[test]
    fn test_image_prompt_includes_context() {
        assert!(image_summary_prompt("Figure 2 shows the pipeline").contains("Figure 2"));
        assert!(!image_summary_prompt("  ").contains("between these passages"));
    }
}
