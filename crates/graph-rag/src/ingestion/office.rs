//! Office formats: DOCX, PPTX, XLSX and CSV
//!
//! DOCX and PPTX are read straight from their zip containers with quick-xml
//! so that heading styles and embedded pictures survive. Embedded pictures
//! are attached to their image nodes here; nothing needs fetching later.

use calamine::Reader as _;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::Path;

use super::markup::{document_title, render_row};
use super::parse_tree::{segment, Block, NodeTopology, NodeType, ParseNode, ParseResult};
use crate::error::{ParseError, Result};

/// Cap on a single zip entry to guard against decompression bombs
const MAX_ENTRY_BYTES: u64 = 64 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn open_archive<'a>(path: &Path, data: &'a [u8]) -> Result<Archive<'a>> {
    zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| ParseError::decode(path, format!("not a zip container: {}", e)).into())
}

fn read_entry(archive: &mut Archive<'_>, path: &Path, name: &str) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ParseError::decode(path, format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ParseError::decode(path, format!("{}: {}", name, e)))?;
    if out.len() as u64 >= MAX_ENTRY_BYTES {
        return Err(ParseError::decode(path, format!("{} exceeds size limit", name)).into());
    }
    Ok(out)
}

fn attr(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .map(|a| String::from_utf8_lossy(&a.value).to_string())
}

/// Relationship id -> zip entry name, for one part's `.rels` file
fn relationships(archive: &mut Archive<'_>, path: &Path, rels: &str, base_dir: &str) -> HashMap<String, String> {
    let Ok(xml) = read_entry(archive, path, rels) else {
        return HashMap::new();
    };

    let mut map = HashMap::new();
    let mut reader = Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                    map.insert(id, resolve_target(base_dir, &target));
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    map
}

/// Resolve a relationship target against the directory of its source part
fn resolve_target(base_dir: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut parts: Vec<&str> = base_dir.split('/').filter(|p| !p.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            ".." => {
                parts.pop();
            }
            "." | "" => {}
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Fill image bytes for nodes whose source names a zip entry
fn attach_media(result: &mut ParseResult, archive: &mut Archive<'_>, path: &Path) {
    fn visit(node: &mut ParseNode, archive: &mut Archive<'_>, path: &Path) {
        if node.node_type == NodeType::Image && node.image_data.is_none() {
            if let Some(source) = node.image_source.clone() {
                match read_entry(archive, path, &source) {
                    Ok(bytes) => node.image_data = Some(bytes),
                    Err(e) => tracing::debug!("[{}] missing embedded image {}: {}", path.display(), source, e),
                }
            }
        }
        for child in node.children.iter_mut() {
            visit(child, archive, path);
        }
    }
    for node in result.nodes.iter_mut() {
        visit(node, archive, path);
    }
}

/// Heading level of a paragraph style such as `Heading2` or `Title`
fn heading_level(style: &str) -> Option<u32> {
    let lower = style.to_ascii_lowercase();
    if lower == "title" {
        return Some(1);
    }
    lower
        .strip_prefix("heading")
        .and_then(|n| n.trim().parse::<u32>().ok())
        .map(|n| n.clamp(1, 9))
}

#[derive(Default)]
struct DocxParagraph {
    text: String,
    style: Option<String>,
    numbered: bool,
    images: Vec<String>,
}

/// Parse a DOCX file; heading styles build the tree
pub fn parse_docx(path: &Path, data: &[u8]) -> Result<ParseResult> {
    let mut archive = open_archive(path, data)?;
    let xml = read_entry(&mut archive, path, "word/document.xml")?;
    let rels = relationships(&mut archive, path, "word/_rels/document.xml.rels", "word");

    let blocks = docx_blocks(path, &xml, &rels)?;
    let mut result = segment(&blocks, &document_title(path));
    attach_media(&mut result, &mut archive, path);
    Ok(result)
}

fn docx_blocks(path: &Path, xml: &[u8], rels: &HashMap<String, String>) -> Result<Vec<Block>> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut blocks = Vec::new();
    let mut paragraph: Option<DocxParagraph> = None;
    let mut in_text = false;
    let mut table_depth = 0usize;
    let mut header: Option<Vec<String>> = None;
    let mut table_rows = 0usize;
    let mut row: Vec<String> = Vec::new();
    let mut cell: Option<String> = None;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ParseError::decode(path, format!("word/document.xml: {}", e)))?;
        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"p" => paragraph = Some(DocxParagraph::default()),
                b"t" => in_text = true,
                b"tbl" => {
                    table_depth += 1;
                    if table_depth == 1 {
                        header = None;
                        table_rows = 0;
                    }
                }
                b"tr" if table_depth == 1 => row.clear(),
                b"tc" if table_depth == 1 => cell = Some(String::new()),
                b"numPr" => {
                    if let Some(p) = paragraph.as_mut() {
                        p.numbered = true;
                    }
                }
                b"pStyle" => {
                    if let Some(p) = paragraph.as_mut() {
                        p.style = attr(&e, b"val");
                    }
                }
                b"blip" => {
                    if let (Some(p), Some(id)) = (paragraph.as_mut(), attr(&e, b"embed")) {
                        p.images.push(id);
                    }
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"pStyle" => {
                    if let Some(p) = paragraph.as_mut() {
                        p.style = attr(&e, b"val");
                    }
                }
                b"blip" => {
                    if let (Some(p), Some(id)) = (paragraph.as_mut(), attr(&e, b"embed")) {
                        p.images.push(id);
                    }
                }
                b"tab" => {
                    if let Some(p) = paragraph.as_mut() {
                        p.text.push('\t');
                    }
                }
                b"br" | b"cr" => {
                    if let Some(p) = paragraph.as_mut() {
                        p.text.push('\n');
                    }
                }
                _ => {}
            },
            Event::Text(t) if in_text => {
                if let Some(p) = paragraph.as_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| ParseError::decode(path, format!("bad text run: {}", e)))?;
                    p.text.push_str(&text);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if let Some(p) = paragraph.take() {
                        match cell.as_mut() {
                            Some(cell) => {
                                if !cell.is_empty() && !p.text.trim().is_empty() {
                                    cell.push(' ');
                                }
                                cell.push_str(p.text.trim());
                            }
                            None => push_paragraph(p, rels, &mut blocks),
                        }
                    }
                }
                b"tc" if table_depth == 1 => {
                    row.push(cell.take().unwrap_or_default());
                }
                b"tr" if table_depth == 1 => {
                    let cells = std::mem::take(&mut row);
                    match header.as_ref() {
                        // Word tables carry no header markup; the first row is taken as one
                        None => header = Some(cells),
                        Some(h) if !cells.iter().all(|c| c.is_empty()) => {
                            blocks.push(Block::TableRow(render_row(h, &cells)));
                            table_rows += 1;
                        }
                        Some(_) => {}
                    }
                }
                b"tbl" => {
                    // A single-row table has no data rows; keep its one row
                    if table_depth == 1 {
                        if let Some(h) = header.take() {
                            if table_rows == 0 && !h.iter().all(|c| c.is_empty()) {
                                blocks.push(Block::TableRow(h.join(" | ")));
                            }
                        }
                    }
                    table_depth = table_depth.saturating_sub(1);
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(blocks)
}

fn push_paragraph(p: DocxParagraph, rels: &HashMap<String, String>, blocks: &mut Vec<Block>) {
    let text = p.text.trim().to_string();
    if !text.is_empty() {
        let block = match p.style.as_deref().and_then(heading_level) {
            Some(level) => Block::Heading { level, text },
            None if p.numbered => Block::ListItem(text),
            None => Block::Paragraph(text),
        };
        blocks.push(block);
    }
    for id in p.images {
        if let Some(target) = rels.get(&id) {
            blocks.push(Block::Image {
                source: target.clone(),
                alt: String::new(),
            });
        }
    }
}

/// Parse a PPTX file: one leaf per slide, followed by the slide's pictures
pub fn parse_pptx(path: &Path, data: &[u8]) -> Result<ParseResult> {
    let mut archive = open_archive(path, data)?;

    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("ppt/slides/slide") && name.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut nodes = Vec::new();
    for (index, slide_name) in slide_names.iter().enumerate() {
        let xml = read_entry(&mut archive, path, slide_name)?;
        let (text, image_ids) = slide_contents(path, &xml)?;

        let file = slide_name.trim_start_matches("ppt/slides/");
        let rels = relationships(&mut archive, path, &format!("ppt/slides/_rels/{}.rels", file), "ppt/slides");

        if !text.is_empty() {
            nodes.push(ParseNode::list_leaf(NodeType::Text, text).with_title(format!("Slide {}", index + 1)));
        }
        for id in image_ids {
            if let Some(target) = rels.get(&id) {
                nodes.push(ParseNode::image(
                    NodeTopology::ListLeaf,
                    target.clone(),
                    format!("Slide {} image", index + 1),
                ));
            }
        }
    }

    let mut result = ParseResult::list(nodes);
    attach_media(&mut result, &mut archive, path);
    Ok(result)
}

/// Text lines and picture relationship ids of one slide
fn slide_contents(path: &Path, xml: &[u8]) -> Result<(String, Vec<String>)> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut lines: Vec<String> = Vec::new();
    let mut line = String::new();
    let mut in_text = false;
    let mut images = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ParseError::decode(path, format!("slide xml: {}", e)))?;
        match event {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"blip" => {
                if let Some(id) = attr(&e, b"embed") {
                    images.push(id);
                }
            }
            Event::Start(e) if e.local_name().as_ref() == b"t" => in_text = true,
            Event::Text(t) if in_text => {
                if let Ok(text) = t.unescape() {
                    if !line.is_empty() {
                        line.push(' ');
                    }
                    line.push_str(&text);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !line.trim().is_empty() {
                        lines.push(line.trim().to_string());
                    }
                    line.clear();
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok((lines.join("\n"), images))
}

fn cell_text(cell: &calamine::Data) -> String {
    match cell {
        calamine::Data::Empty => String::new(),
        calamine::Data::String(s) => s.trim().to_string(),
        calamine::Data::Float(f) => f.to_string(),
        calamine::Data::Int(i) => i.to_string(),
        calamine::Data::Bool(b) => b.to_string(),
        calamine::Data::DateTime(dt) => dt.to_string(),
        _ => String::new(),
    }
}

/// Parse a spreadsheet: one table leaf per data row, the first non-empty
/// row of each sheet being its header
pub fn parse_spreadsheet(path: &Path, data: &[u8]) -> Result<ParseResult> {
    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(data))
        .map_err(|e| ParseError::decode(path, e.to_string()))?;

    let mut nodes = Vec::new();
    for sheet_name in workbook.sheet_names().to_vec() {
        let range = match workbook.worksheet_range(&sheet_name) {
            Ok(range) => range,
            Err(e) => {
                tracing::warn!("[{}] skipping sheet {}: {}", path.display(), sheet_name, e);
                continue;
            }
        };

        let mut header: Option<Vec<String>> = None;
        for row in range.rows() {
            let cells: Vec<String> = row.iter().map(cell_text).collect();
            if cells.iter().all(|c| c.is_empty()) {
                continue;
            }
            match &header {
                None => header = Some(cells),
                Some(h) => nodes.push(
                    ParseNode::list_leaf(NodeType::Table, render_row(h, &cells))
                        .with_title(sheet_name.clone()),
                ),
            }
        }
    }

    Ok(ParseResult::list(nodes))
}

/// Parse a CSV file: one table leaf per record
pub fn parse_csv(path: &Path, data: &[u8]) -> Result<ParseResult> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(data);
    let header: Vec<String> = reader
        .headers()
        .map_err(|e| ParseError::decode(path, e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut nodes = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ParseError::extract(path, e.to_string()))?;
        let cells: Vec<String> = record.iter().map(|c| c.trim().to_string()).collect();
        if cells.iter().all(|c| c.is_empty()) {
            continue;
        }
        nodes.push(ParseNode::list_leaf(NodeType::Table, render_row(&header, &cells)));
    }
    Ok(ParseResult::list(nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::parse_tree::ResultTopology;
    use std::io::Write;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, bytes) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(bytes).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    const DOCUMENT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"
            xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"
            xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">
  <w:body>
    <w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Overview</w:t></w:r></w:p>
    <w:p><w:r><w:t xml:space="preserve">Hello </w:t></w:r><w:r><w:t>world</w:t></w:r></w:p>
    <w:p><w:r><w:drawing><a:blip r:embed="rId7"/></w:drawing></w:r></w:p>
    <w:tbl>
      <w:tr><w:tc><w:p><w:r><w:t>key</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>value</w:t></w:r></w:p></w:tc></w:tr>
      <w:tr><w:tc><w:p><w:r><w:t>a</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>1</w:t></w:r></w:p></w:tc></w:tr>
    </w:tbl>
  </w:body>
</w:document>"#;

    const DOCUMENT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Id="rId7" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="media/image1.png"/>
</Relationships>"#;

    #[test]
    fn test_docx_headings_tables_and_images() {
        let data = build_zip(&[
            ("word/document.xml", DOCUMENT_XML.as_bytes()),
            ("word/_rels/document.xml.rels", DOCUMENT_RELS.as_bytes()),
            ("word/media/image1.png", b"\x89PNG fake"),
        ]);
        let result = parse_docx(Path::new("report.docx"), &data).unwrap();
        assert_eq!(result.topology, ResultTopology::Tree);

        let overview = &result.nodes[0].children[0];
        assert_eq!(overview.title.as_deref(), Some("Overview"));
        assert_eq!(overview.content, "Hello world");
        assert_eq!(overview.children.len(), 2);

        let image = &overview.children[0];
        assert_eq!(image.node_type, NodeType::Image);
        assert_eq!(image.image_source.as_deref(), Some("word/media/image1.png"));
        assert_eq!(image.image_data.as_deref(), Some(&b"\x89PNG fake"[..]));

        let row = &overview.children[1];
        assert_eq!(row.node_type, NodeType::Table);
        assert_eq!(row.content, "key: a | value: 1");
    }

    #[test]
    fn test_pptx_slides_in_order() {
        let slide = |text: &str| {
            format!(
                r#"<p:sld xmlns:p="p" xmlns:a="a"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>"#,
                text
            )
        };
        let (s1, s2, s10) = (slide("first"), slide("second"), slide("tenth"));
        let data = build_zip(&[
            ("ppt/slides/slide10.xml", s10.as_bytes()),
            ("ppt/slides/slide2.xml", s2.as_bytes()),
            ("ppt/slides/slide1.xml", s1.as_bytes()),
        ]);
        let result = parse_pptx(Path::new("deck.pptx"), &data).unwrap();
        let contents: Vec<_> = result.nodes.iter().map(|n| n.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "tenth"]);
        assert!(result.nodes.iter().all(|n| n.topology == NodeTopology::ListLeaf));
    }

    #[test]
    fn test_csv_rows() {
        let data = b"name,qty\nbolt,4\n,\nnut,9\n";
        let result = parse_csv(Path::new("parts.csv"), data).unwrap();
        assert_eq!(result.nodes.len(), 2);
        assert_eq!(result.nodes[0].content, "name: bolt | qty: 4");
        assert_eq!(result.nodes[1].node_type, NodeType::Table);
    }

    #[test]
    fn test_invalid_container_is_decode_error() {
        let err = parse_docx(Path::new("bad.docx"), b"not a zip").unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Parse(ParseError {
                stage: crate::error::ParseStage::Decode,
                ..
            })
        ));
    }

    #[test]
    fn test_resolve_target() {
        assert_eq!(resolve_target("ppt/slides", "../media/image2.png"), "ppt/media/image2.png");
        assert_eq!(resolve_target("word", "media/image1.png"), "word/media/image1.png");
        assert_eq!(resolve_target("word", "/word/media/x.png"), "word/media/x.png");
        assert_eq!(heading_level("Heading3"), Some(3));
        assert_eq!(heading_level("Normal"), None);
    }
}
