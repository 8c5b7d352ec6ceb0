//! Provider abstractions for embeddings, LLM calls and OCR
//!
//! Ingestion and retrieval only see these traits; the Ollama and tesseract
//! backends are wired in by the service.

pub mod embedding;
pub mod llm;
pub mod ocr;
pub mod ollama;

pub use embedding::EmbeddingProvider;
pub use llm::LlmProvider;
pub use ocr::{OcrProvider, TesseractOcr};
pub use ollama::{OllamaClient, OllamaEmbedder, OllamaLlm};
