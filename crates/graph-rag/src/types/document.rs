//! Knowledge base and document types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported input formats
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// PDF document
    Pdf,
    /// Microsoft Word document (.docx)
    Docx,
    /// Legacy Word document (.doc), converted through LibreOffice
    Doc,
    /// PowerPoint presentation (.pptx)
    Pptx,
    /// Legacy PowerPoint (.ppt), converted through LibreOffice
    Ppt,
    /// Excel spreadsheet (.xlsx)
    Xlsx,
    /// Legacy Excel spreadsheet (.xls)
    Xls,
    /// CSV file
    Csv,
    /// HTML document
    Html,
    /// Markdown file
    Markdown,
    /// Plain text file
    Txt,
    /// JSON document
    Json,
    /// YAML document
    Yaml,
    /// Raster image
    Image,
    /// Unknown file type
    Unknown,
}

impl FileType {
    /// Detect file type from extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "pdf" => Self::Pdf,
            "docx" => Self::Docx,
            "doc" => Self::Doc,
            "pptx" => Self::Pptx,
            "ppt" => Self::Ppt,
            "xlsx" | "xlsm" => Self::Xlsx,
            "xls" => Self::Xls,
            "csv" => Self::Csv,
            "html" | "htm" => Self::Html,
            "md" | "markdown" => Self::Markdown,
            "txt" | "text" | "log" => Self::Txt,
            "json" => Self::Json,
            "yaml" | "yml" => Self::Yaml,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tiff" | "tif" => Self::Image,
            _ => Self::Unknown,
        }
    }

    /// Detect file type from a path or file name
    pub fn from_path(path: &std::path::Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Self::Unknown)
    }

    /// Check if this is a supported file type
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Legacy binary Office formats are converted before parsing
    pub fn converted_form(&self) -> Option<FileType> {
        match self {
            Self::Doc => Some(Self::Docx),
            Self::Ppt => Some(Self::Pptx),
            Self::Xls => Some(Self::Xlsx),
            _ => None,
        }
    }

    /// Canonical extension
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Doc => "doc",
            Self::Pptx => "pptx",
            Self::Ppt => "ppt",
            Self::Xlsx => "xlsx",
            Self::Xls => "xls",
            Self::Csv => "csv",
            Self::Html => "html",
            Self::Markdown => "md",
            Self::Txt => "txt",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Image => "png",
            Self::Unknown => "bin",
        }
    }
}

/// How a document is parsed, and in particular how its images are treated
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ParserMethod {
    /// Images are attached to the nearest preceding paragraph
    #[default]
    General,
    /// Images become chunks whose text comes from OCR
    Ocr,
    /// OCR refined by an LLM summary using neighbouring paragraphs
    Enhanced,
}

impl ParserMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Ocr => "ocr",
            Self::Enhanced => "enhanced",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "general" => Some(Self::General),
            "ocr" => Some(Self::Ocr),
            "enhanced" => Some(Self::Enhanced),
            _ => None,
        }
    }

    /// Whether images are promoted to chunks of their own
    pub fn images_as_chunks(&self) -> bool {
        !matches!(self, Self::General)
    }
}

/// Document processing status
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    #[default]
    Pending,
    Running,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "running" => Self::Running,
            _ => Self::Pending,
        }
    }
}

/// A document uploaded into a knowledge base (or a temporary document)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Unique document ID
    pub id: Uuid,
    /// Owning knowledge base; `None` for temporary documents
    pub kb_id: Option<Uuid>,
    /// Display name (original file name)
    pub name: String,
    /// Detected input format
    pub file_type: FileType,
    /// Parser method
    pub parser_method: ParserMethod,
    /// Token budget per chunk
    pub chunk_token_budget: usize,
    /// Processing status
    pub status: DocumentStatus,
    /// Object store id of the input bytes
    pub blob_id: Uuid,
    /// SHA-256 of the input bytes
    pub content_hash: String,
    /// Disabled documents are invisible to retrieval
    pub enabled: bool,
    /// Soft-deletion flag
    pub deleted: bool,
    /// Upload timestamp
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Document {
    /// Create a new pending document
    pub fn new(
        kb_id: Option<Uuid>,
        name: impl Into<String>,
        parser_method: ParserMethod,
        chunk_token_budget: usize,
        blob_id: Uuid,
        content_hash: String,
    ) -> Self {
        let name = name.into();
        let file_type = FileType::from_path(std::path::Path::new(&name));
        Self {
            id: Uuid::new_v4(),
            kb_id,
            name,
            file_type,
            parser_method,
            chunk_token_budget,
            status: DocumentStatus::Pending,
            blob_id,
            content_hash,
            enabled: true,
            deleted: false,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.kb_id.is_none()
    }
}

/// Export state of a knowledge base
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    #[default]
    Idle,
    Exporting,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Exporting => "exporting",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "exporting" => Self::Exporting,
            _ => Self::Idle,
        }
    }
}

/// A per-tenant knowledge base; its embedding model fixes the vector dimension
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeBase {
    pub id: Uuid,
    pub name: String,
    pub embedding_model: String,
    pub dimension: usize,
    pub export_status: ExportStatus,
    /// Object store id of the most recent export
    pub export_blob_id: Option<Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl KnowledgeBase {
    pub fn new(name: impl Into<String>, embedding_model: impl Into<String>, dimension: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            embedding_model: embedding_model.into(),
            dimension,
            export_status: ExportStatus::Idle,
            export_blob_id: None,
            created_at: chrono::Utc::now(),
        }
    }
}
