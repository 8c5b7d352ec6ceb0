//! Multi-format document parser
//!
//! Dispatches on the file type, converts legacy Office formats first, and
//! resolves image references once the parse tree is complete.

use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

use super::converter::OfficeConverter;
use super::images::ImageResolver;
use super::parse_tree::{NodeTopology, ParseNode, ParseResult};
use super::{markup, office, pdf, structured};
use crate::config::ParserConfig;
use crate::error::{Error, ParseError, Result};
use crate::types::FileType;

/// Parses any supported file into a [`ParseResult`]
#[derive(Debug, Clone)]
pub struct DocumentParser {
    converter: OfficeConverter,
    images: ImageResolver,
}

impl DocumentParser {
    pub fn new(config: &ParserConfig) -> Result<Self> {
        Ok(Self {
            converter: OfficeConverter::new(config),
            images: ImageResolver::new(Duration::from_secs(config.image_fetch_timeout_secs))?,
        })
    }

    /// Read and parse a file on disk; relative image references resolve
    /// against the file's directory
    pub async fn parse_file(&self, path: &Path) -> Result<ParseResult> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ParseError::open(path, e.to_string()))?;
        self.parse_bytes(path, &data, path.parent()).await
    }

    /// Parse in-memory bytes; `name` supplies the file type and error context
    pub async fn parse_bytes(&self, name: &Path, data: &[u8], base_dir: Option<&Path>) -> Result<ParseResult> {
        let mut file_type = FileType::from_path(name);
        if !file_type.is_supported() {
            return Err(Error::UnsupportedFileType(name.display().to_string()));
        }

        let mut owned = data.to_vec();
        if let Some(target) = file_type.converted_form() {
            owned = self.converter.convert(name, data, target).await?;
            file_type = target;
        }

        let path = name.to_path_buf();
        let mut result = tokio::task::spawn_blocking(move || Self::parse_native(file_type, &path, &owned))
            .await
            .map_err(|e| Error::Internal(format!("parser task failed: {}", e)))??;

        self.images.resolve(&mut result, base_dir).await;

        tracing::info!(
            "[{}] parsed {:?} into {} nodes ({:?})",
            name.display(),
            file_type,
            result.node_count(),
            result.topology
        );
        Ok(result)
    }

    /// Synchronous dispatch for formats that need no conversion
    pub fn parse_native(file_type: FileType, path: &Path, data: &[u8]) -> Result<ParseResult> {
        match file_type {
            FileType::Markdown => markup::parse_markdown(path, data),
            FileType::Html => markup::parse_html(path, data),
            FileType::Docx => office::parse_docx(path, data),
            FileType::Pptx => office::parse_pptx(path, data),
            FileType::Xlsx => office::parse_spreadsheet(path, data),
            FileType::Csv => office::parse_csv(path, data),
            FileType::Pdf => pdf::parse_pdf(path, data),
            FileType::Txt => Ok(structured::parse_text(data)),
            FileType::Json => structured::parse_json(path, data),
            FileType::Yaml => structured::parse_yaml(path, data),
            FileType::Image => {
                if data.is_empty() {
                    return Err(ParseError::open(path, "empty image file").into());
                }
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let mut node = ParseNode::image(NodeTopology::General, name.clone(), name);
                node.image_data = Some(data.to_vec());
                Ok(ParseResult::general(node))
            }
            FileType::Doc | FileType::Ppt | FileType::Xls | FileType::Unknown => {
                Err(Error::UnsupportedFileType(format!(
                    "{} requires conversion before parsing",
                    path.display()
                )))
            }
        }
    }
}

/// SHA-256 of a document's bytes, hex encoded
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
