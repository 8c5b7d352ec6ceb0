//! Configuration for the ingestion scheduler and retrieval engine

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "GRAPH_RAG_DATA_DIR";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagConfig {
    /// Storage locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Scheduler and worker pool configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Chunk graph configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// Embedding configuration
    #[serde(default)]
    pub embeddings: EmbeddingConfig,
    /// Ollama/LLM configuration
    #[serde(default)]
    pub llm: LlmConfig,
    /// OCR configuration
    #[serde(default)]
    pub ocr: OcrConfig,
    /// Parser configuration
    #[serde(default)]
    pub parser: ParserConfig,
    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

impl RagConfig {
    /// Load configuration from a TOML file, falling back to defaults when no
    /// path is given. The data directory may be overridden from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Failed to read {}: {}", path.display(), e))
                })?;
                toml::from_str::<RagConfig>(&raw).map_err(|e| {
                    Error::Config(format!("Invalid config {}: {}", path.display(), e))
                })?
            }
            None => RagConfig::default(),
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            config.storage.data_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break scheduler or chunking invariants
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_token_budget == 0 {
            return Err(Error::Config("chunking.chunk_token_budget must be > 0".into()));
        }
        if self.scheduler.max_retries > 3 {
            return Err(Error::Config("scheduler.max_retries must be <= 3".into()));
        }
        if !(0.0..=1.0).contains(&self.chunking.merge_similarity_threshold) {
            return Err(Error::Config(
                "chunking.merge_similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.weak_keep_probability) {
            return Err(Error::Config(
                "retrieval.weak_keep_probability must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the database and blobs
    pub data_dir: PathBuf,
}

impl StorageConfig {
    /// SQLite database holding metadata, queues and vectors
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("graph-rag.db")
    }

    /// Directory of the local object store
    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")))
            .join("graph-rag");
        Self { data_dir }
    }
}

/// Scheduler and worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval of the pending-queue poll loop in seconds (default: 5)
    pub poll_interval_secs: u64,
    /// Interval of the worker monitor loop in seconds (default: 25)
    pub monitor_interval_secs: u64,
    /// Operator cap on concurrent workers (default: half the CPU cores)
    pub max_workers: Option<usize>,
    /// Retry ceiling for a task (at most 3)
    pub max_retries: u32,
    /// Hard deadline for a single worker process in seconds
    pub task_timeout_secs: u64,
    /// Program spawned for each task (default: the current executable)
    pub worker_program: Option<PathBuf>,
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Effective worker cap: half the CPU cores, at least one, capped by the operator value
    pub fn worker_cap(&self) -> usize {
        let auto = (num_cpus::get() / 2).max(1);
        match self.max_workers {
            Some(cap) => auto.min(cap.max(1)),
            None => auto,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            monitor_interval_secs: 25,
            max_workers: None,
            max_retries: 3,
            task_timeout_secs: 1200, // 20 minutes
            worker_program: None,
        }
    }
}

/// Chunk graph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Default token budget per chunk when a document has none
    pub chunk_token_budget: usize,
    /// Cosine similarity above which paragraphs merge up to the full budget
    pub merge_similarity_threshold: f32,
    /// Parallel OCR calls per document
    pub ocr_concurrency: usize,
    /// Chunks embedded per batch
    pub embed_batch_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_token_budget: 512,
            merge_similarity_threshold: 0.85,
            ocr_concurrency: 2,
            embed_batch_size: 16,
        }
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model used when a knowledge base does not name one
    pub model: String,
    /// Dimension of the default model (also used for temporary documents)
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "nomic-embed-text".to_string(),
            dimensions: 768,
        }
    }
}

/// LLM (Ollama) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Ollama base URL
    pub base_url: String,
    /// Text generation model (relevance arbitration)
    pub generate_model: String,
    /// Vision model (image summarisation for enhanced parsing)
    pub vision_model: String,
    /// Temperature for generation
    pub temperature: f32,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Number of retries for failed requests
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            generate_model: "phi3".to_string(),
            vision_model: "llava".to_string(),
            temperature: 0.1,
            timeout_secs: 120,
            max_retries: 2,
        }
    }
}

/// OCR configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// tesseract binary
    pub tesseract_bin: String,
    /// tesseract language pack
    pub language: String,
    /// Per-image timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            tesseract_bin: "tesseract".to_string(),
            language: "eng".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Parser configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Timeout for fetching a remote image referenced by a document
    pub image_fetch_timeout_secs: u64,
    /// LibreOffice binary used for legacy formats
    pub libreoffice_bin: String,
    /// Timeout for legacy format conversion
    pub conversion_timeout_secs: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            image_fetch_timeout_secs: 10,
            libreoffice_bin: "libreoffice".to_string(),
            conversion_timeout_secs: 120,
        }
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Timeout for query embedding plus vector lookup in milliseconds
    pub vector_timeout_ms: u64,
    /// Timeout for the keyword scan in milliseconds
    pub keyword_timeout_ms: u64,
    /// Attempts per candidate source
    pub max_attempts: u32,
    /// Timeout for LLM relevance arbitration in seconds
    pub llm_timeout_secs: u64,
    /// Classify hit windows with the LLM before expansion
    pub arbitration_enabled: bool,
    /// Probability of keeping a weakly relevant window
    pub weak_keep_probability: f64,
}

impl RetrievalConfig {
    pub fn vector_timeout(&self) -> Duration {
        Duration::from_millis(self.vector_timeout_ms)
    }

    pub fn keyword_timeout(&self) -> Duration {
        Duration::from_millis(self.keyword_timeout_ms)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_timeout_ms: 1000,
            keyword_timeout_ms: 2000,
            max_attempts: 3,
            llm_timeout_secs: 30,
            arbitration_enabled: false,
            weak_keep_probability: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RagConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.scheduler.monitor_interval(), Duration::from_secs(25));
        assert_eq!(config.retrieval.vector_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_worker_cap_respects_operator_limit() {
        let mut scheduler = SchedulerConfig::default();
        scheduler.max_workers = Some(1);
        assert_eq!(scheduler.worker_cap(), 1);

        scheduler.max_workers = Some(0);
        assert_eq!(scheduler.worker_cap(), 1);

        scheduler.max_workers = None;
        assert!(scheduler.worker_cap() >= 1);
    }

    #[test]
    fn test_partial_toml() {
        let raw = r#"
            [scheduler]
            poll_interval_secs = 1
            monitor_interval_secs = 2
            max_retries = 2
            task_timeout_secs = 10

            [chunking]
            chunk_token_budget = 128
            merge_similarity_threshold = 0.9
            ocr_concurrency = 1
            embed_batch_size = 4
        "#;
        let config: RagConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.scheduler.max_retries, 2);
        assert_eq!(config.chunking.chunk_token_budget, 128);
        assert_eq!(config.llm.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_rejects_retry_ceiling_above_three() {
        let mut config = RagConfig::default();
        config.scheduler.max_retries = 4;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
