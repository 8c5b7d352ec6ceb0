//! PDF text extraction
//!
//! pdf-extract does the heavy lifting; it can hang on pathological fonts, so
//! it runs on its own thread with a deadline and falls back to walking the
//! page content streams with lopdf.

use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use super::parse_tree::{NodeType, ParseNode, ParseResult};
use super::structured::paragraphs;
use crate::error::{ParseError, Result};

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(60);

/// Glyph names that leak into extracted text from badly embedded fonts
const GLYPH_NAMES: &[(&str, &str)] = &[
    ("uni2010", "-"),
    ("uni2011", "-"),
    ("uni2013", "-"),
    ("uni2014", "--"),
    ("uni2018", "'"),
    ("uni2019", "'"),
    ("uni201C", "\""),
    ("uni201D", "\""),
    ("uni2022", "* "),
    ("uni2026", "..."),
    ("uni00A0", " "),
    ("f_f_i", "ffi"),
    ("f_f_l", "ffl"),
    ("f_i", "fi"),
    ("f_l", "fl"),
    ("f_f", "ff"),
];

/// Normalise glyph names, typographic punctuation and ligatures to ASCII
fn cleanup_pdf_text(text: &str) -> String {
    let mut result = text.replace('\0', "");
    for (glyph, replacement) in GLYPH_NAMES {
        result = result
            .replace(&format!("({})", glyph), replacement)
            .replace(&format!("<{}>", glyph), replacement);
    }
    result
        .replace(['\u{2010}', '\u{2011}', '\u{2013}'], "-")
        .replace('\u{2014}', "--")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace('\u{2022}', "* ")
        .replace('\u{2026}', "...")
        .replace('\u{00A0}', " ")
        .replace('\u{FB01}', "fi")
        .replace('\u{FB02}', "fl")
        .replace('\u{FB00}', "ff")
        .replace('\u{FB03}', "ffi")
        .replace('\u{FB04}', "ffl")
}

/// Parse a PDF into paragraph leaves
pub fn parse_pdf(path: &Path, data: &[u8]) -> Result<ParseResult> {
    let text = extract_with_timeout(path, data)?;
    let text = cleanup_pdf_text(&text);

    let nodes: Vec<ParseNode> = paragraphs(&text)
        .into_iter()
        .map(|p| {
            let joined = p.lines().map(str::trim).collect::<Vec<_>>().join(" ");
            ParseNode::list_leaf(NodeType::Text, joined)
        })
        .collect();

    if nodes.is_empty() {
        return Err(ParseError::extract(path, "no text content could be extracted").into());
    }

    tracing::debug!(
        "[{}] extracted {} paragraphs from {} pages",
        path.display(),
        nodes.len(),
        page_count(data).unwrap_or(0)
    );
    Ok(ParseResult::list(nodes))
}

fn page_count(data: &[u8]) -> Option<usize> {
    lopdf::Document::load_mem(data).ok().map(|doc| doc.get_pages().len())
}

fn extract_with_timeout(path: &Path, data: &[u8]) -> Result<String> {
    let owned = data.to_vec();
    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        let _ = tx.send(pdf_extract::extract_text_from_mem(&owned));
    });

    match rx.recv_timeout(EXTRACT_TIMEOUT) {
        Ok(Ok(text)) if !text.trim().is_empty() => Ok(text),
        Ok(Ok(_)) => extract_fallback(path, data),
        Ok(Err(e)) => {
            tracing::warn!("[{}] pdf-extract failed: {}, trying fallback", path.display(), e);
            extract_fallback(path, data)
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracing::error!(
                "[{}] pdf-extract timed out after {:?}, trying fallback",
                path.display(),
                EXTRACT_TIMEOUT
            );
            extract_fallback(path, data)
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            tracing::error!("[{}] pdf-extract thread crashed, trying fallback", path.display());
            extract_fallback(path, data)
        }
    }
}

/// Walk page content streams for text-show operators
fn extract_fallback(path: &Path, data: &[u8]) -> Result<String> {
    let doc = lopdf::Document::load_mem(data)
        .map_err(|e| ParseError::decode(path, format!("failed to load PDF: {}", e)))?;

    let mut pages = Vec::new();
    for (page_num, page_id) in doc.get_pages() {
        match doc.get_page_content(page_id) {
            Ok(content) => {
                let text = text_from_content_stream(&content);
                if !text.trim().is_empty() {
                    pages.push(text);
                }
            }
            Err(e) => tracing::debug!("Could not get content for page {}: {}", page_num, e),
        }
    }

    if pages.is_empty() {
        return Err(ParseError::extract(
            path,
            "PDF appears to be image-based or has no extractable text",
        )
        .into());
    }
    Ok(pages.join("\n\n"))
}

fn text_from_content_stream(content: &[u8]) -> String {
    let content = String::from_utf8_lossy(content);
    let mut text = String::new();
    let mut in_text_block = false;

    for line in content.lines().map(str::trim) {
        match line {
            "BT" => in_text_block = true,
            "ET" => {
                in_text_block = false;
                text.push('\n');
            }
            _ if in_text_block && (line.ends_with("Tj") || line.ends_with("TJ")) => {
                if let (Some(start), Some(end)) = (line.find('('), line.rfind(')')) {
                    if start < end {
                        let decoded = line[start + 1..end]
                            .replace("\\(", "(")
                            .replace("\\)", ")")
                            .replace("\\\\", "\\");
                        text.push_str(&decoded);
                        text.push(' ');
                    }
                }
            }
            _ => {}
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_ligatures_and_quotes() {
        assert_eq!(cleanup_pdf_text("\u{FB01}le \u{201C}x\u{201D}\0"), "file \"x\"");
        assert_eq!(cleanup_pdf_text("a(uni2019)s"), "a's");
    }

    #[test]
    fn test_content_stream_text() {
        let stream = b"BT\n/F1 12 Tf\n(Hello \\(world\\)) Tj\nET\n";
        assert_eq!(text_from_content_stream(stream).trim(), "Hello (world)");
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = parse_pdf(Path::new("x.pdf"), b"definitely not a pdf").unwrap_err();
        assert!(matches!(err, crate::error::Error::Parse(_)));
    }
}
