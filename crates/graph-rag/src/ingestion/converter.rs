//! Legacy Office conversion through a headless LibreOffice

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use crate::config::ParserConfig;
use crate::error::{ParseError, Result};
use crate::types::FileType;

/// Converts `.doc`/`.ppt`/`.xls` into their OOXML counterparts
#[derive(Debug, Clone)]
pub struct OfficeConverter {
    binary: String,
    timeout: Duration,
}

impl OfficeConverter {
    pub fn new(config: &ParserConfig) -> Self {
        Self {
            binary: config.libreoffice_bin.clone(),
            timeout: Duration::from_secs(config.conversion_timeout_secs),
        }
    }

    /// Convert `data` (named by `path`) into `target`, returning the new bytes.
    ///
    /// Work happens in a scratch directory that is removed on return.
    pub async fn convert(&self, path: &Path, data: &[u8], target: FileType) -> Result<Vec<u8>> {
        let scratch = tempfile::tempdir()
            .map_err(|e| ParseError::open(path, format!("failed to create scratch dir: {}", e)))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("input.{}", FileType::from_path(path).extension()));
        let input = scratch.path().join(&file_name);
        tokio::fs::write(&input, data)
            .await
            .map_err(|e| ParseError::open(path, format!("failed to stage input: {}", e)))?;

        tracing::info!("[{}] converting to {} with {}", file_name, target.extension(), self.binary);

        let child = tokio::process::Command::new(&self.binary)
            .arg("--headless")
            .arg("--convert-to")
            .arg(target.extension())
            .arg("--outdir")
            .arg(scratch.path())
            .arg(&input)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ParseError::decode(path, format!("failed to start {}: {}", self.binary, e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ParseError::decode(path, format!("conversion timed out after {:?}", self.timeout)))?
            .map_err(|e| ParseError::decode(path, format!("conversion failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ParseError::decode(path, format!("LibreOffice error: {}", stderr.trim())).into());
        }

        let stem = Path::new(&file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "input".to_string());
        let converted = scratch.path().join(format!("{}.{}", stem, target.extension()));

        tokio::fs::read(&converted)
            .await
            .map_err(|e| ParseError::decode(path, format!("converted file missing: {}", e)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_parse_error() {
        let config = ParserConfig {
            libreoffice_bin: "/nonexistent/soffice-binary".to_string(),
            ..ParserConfig::default()
        };
        let converter = OfficeConverter::new(&config);
        let err = converter
            .convert(Path::new("old.doc"), b"\xd0\xcf\x11\xe0", FileType::Docx)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Parse(_)));
    }
}
