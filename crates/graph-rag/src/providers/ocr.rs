//! Optical character recognition for image chunks

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::OcrConfig;
use crate::error::{Error, Result};

/// Trait for extracting text from an image
#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Recognise the text of an encoded image (png, jpeg, ...)
    async fn recognize(&self, image: &[u8]) -> Result<String>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Tesseract CLI, fed through stdin and read from stdout
pub struct TesseractOcr {
    binary: String,
    language: String,
    timeout: Duration,
}

impl TesseractOcr {
    pub fn new(config: &OcrConfig) -> Self {
        Self {
            binary: config.tesseract_bin.clone(),
            language: config.language.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn run(&self, image: &[u8]) -> Result<String> {
        let mut child = Command::new(&self.binary)
            .args(["stdin", "stdout", "-l", &self.language])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Ocr(format!("Failed to start {}: {}", self.binary, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(image)
                .await
                .map_err(|e| Error::Ocr(format!("Failed to feed image to {}: {}", self.binary, e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Ocr(format!("{} did not finish: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Ocr(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            )));
        }

        Ok(normalize_ocr_text(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl OcrProvider for TesseractOcr {
    async fn recognize(&self, image: &[u8]) -> Result<String> {
        tokio::time::timeout(self.timeout, self.run(image))
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }

    fn name(&self) -> &str {
        "tesseract"
    }
}

/// Collapse the blank lines and form feeds tesseract emits between blocks
fn normalize_ocr_text(raw: &str) -> String {
    raw.replace('\u{c}', "")
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
