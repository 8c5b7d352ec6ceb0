//! Markdown and HTML lowering into blocks
//!
//! Both formats are heading-structured, so their blocks go through
//! [`segment`](super::parse_tree::segment) to build a tree.

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};
use scraper::{ElementRef, Html, Selector};
use std::path::Path;

use super::parse_tree::{segment, Block, ParseResult};
use crate::error::{ParseError, Result};

/// Parse a Markdown document into a heading tree
pub fn parse_markdown(path: &Path, data: &[u8]) -> Result<ParseResult> {
    let text = std::str::from_utf8(data)
        .map_err(|e| ParseError::decode(path, format!("invalid UTF-8: {}", e)))?;
    let blocks = markdown_blocks(text);
    Ok(segment(&blocks, &document_title(path)))
}

/// Parse an HTML document into a heading tree
pub fn parse_html(path: &Path, data: &[u8]) -> Result<ParseResult> {
    let html = String::from_utf8_lossy(data);
    let blocks = html_blocks(&html).map_err(|message| ParseError::extract(path, message))?;
    Ok(segment(&blocks, &document_title(path)))
}

pub(crate) fn document_title(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string())
}

#[derive(Default)]
struct MarkdownWalker {
    blocks: Vec<Block>,
    text: String,
    heading: Option<u32>,
    item_depth: usize,
    image: Option<(String, String)>,
    pending_images: Vec<Block>,
    link: Option<(String, String)>,
    links: Vec<(String, String)>,
    cell: Option<String>,
    row: Vec<String>,
    header: Vec<String>,
}

impl MarkdownWalker {
    fn push_text(&mut self, value: &str) {
        if let Some((_, alt)) = self.image.as_mut() {
            alt.push_str(value);
        } else if let Some(cell) = self.cell.as_mut() {
            cell.push_str(value);
        } else {
            self.text.push_str(value);
            if let Some((text, _)) = self.link.as_mut() {
                text.push_str(value);
            }
        }
    }

    /// Emit the buffered text; a paragraph holding nothing but a single
    /// link becomes a link block
    fn flush(&mut self, as_item: bool) {
        let text = std::mem::take(&mut self.text).trim().to_string();
        let links = std::mem::take(&mut self.links);
        if !text.is_empty() {
            let block = match links.as_slice() {
                [(link_text, href)] if !as_item && link_text.trim() == text => Block::Link {
                    text,
                    href: href.clone(),
                },
                _ if as_item => Block::ListItem(text),
                _ => Block::Paragraph(text),
            };
            self.blocks.push(block);
        }
        self.blocks.append(&mut self.pending_images);
    }

    fn table_row(&mut self) {
        let row = std::mem::take(&mut self.row);
        if row.iter().all(|c| c.trim().is_empty()) {
            return;
        }
        self.blocks.push(Block::TableRow(render_row(&self.header, &row)));
    }

    fn handle(&mut self, event: Event<'_>) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                self.flush(false);
                self.heading = Some(level as u32);
            }
            Event::End(TagEnd::Heading(_)) => {
                let text = std::mem::take(&mut self.text).trim().to_string();
                self.links.clear();
                if let Some(level) = self.heading.take() {
                    self.blocks.push(Block::Heading { level, text });
                }
                self.blocks.append(&mut self.pending_images);
            }
            Event::End(TagEnd::Paragraph) if self.item_depth == 0 => self.flush(false),
            Event::Start(Tag::Item) => {
                self.flush(true);
                self.item_depth += 1;
            }
            Event::End(TagEnd::Item) => {
                self.flush(true);
                self.item_depth = self.item_depth.saturating_sub(1);
            }
            Event::Start(Tag::CodeBlock(_)) => {
                self.flush(self.item_depth > 0);
            }
            Event::End(TagEnd::CodeBlock) => {
                let code = std::mem::take(&mut self.text);
                if !code.trim().is_empty() {
                    self.blocks.push(Block::Code(code.trim_end().to_string()));
                }
            }
            Event::Start(Tag::Table(_)) => {
                self.flush(false);
                self.header.clear();
            }
            Event::End(TagEnd::TableHead) => {
                self.header = std::mem::take(&mut self.row);
            }
            Event::End(TagEnd::TableRow) => self.table_row(),
            Event::Start(Tag::TableCell) => self.cell = Some(String::new()),
            Event::End(TagEnd::TableCell) => {
                let cell = self.cell.take().unwrap_or_default();
                self.row.push(cell.trim().to_string());
            }
            Event::Start(Tag::Image { dest_url, .. }) => {
                self.image = Some((dest_url.to_string(), String::new()));
            }
            Event::End(TagEnd::Image) => {
                if let Some((source, alt)) = self.image.take() {
                    self.pending_images.push(Block::Image { source, alt });
                }
            }
            Event::Start(Tag::Link { dest_url, .. }) => {
                self.link = Some((String::new(), dest_url.to_string()));
            }
            Event::End(TagEnd::Link) => {
                if let Some(link) = self.link.take() {
                    self.links.push(link);
                }
            }
            Event::Text(value) | Event::Code(value) => self.push_text(&value),
            Event::SoftBreak => self.push_text(" "),
            Event::HardBreak => self.push_text("\n"),
            _ => {}
        }
    }
}

/// Lower Markdown into blocks in reading order
pub fn markdown_blocks(text: &str) -> Vec<Block> {
    let mut walker = MarkdownWalker::default();
    for event in Parser::new_ext(text, Options::ENABLE_TABLES) {
        walker.handle(event);
    }
    walker.flush(false);
    walker.blocks
}

/// Render a table row, pairing cells with the header when there is one
pub(crate) fn render_row(header: &[String], row: &[String]) -> String {
    if header.len() == row.len() && header.iter().any(|h| !h.is_empty()) {
        header
            .iter()
            .zip(row)
            .map(|(h, v)| format!("{}: {}", h, v))
            .collect::<Vec<_>>()
            .join(" | ")
    } else {
        row.join(" | ")
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

/// Lower HTML into blocks in reading order
pub fn html_blocks(html: &str) -> std::result::Result<Vec<Block>, String> {
    let document = Html::parse_document(html);
    let body = Selector::parse("body").map_err(|e| format!("{:?}", e))?;
    let rows = Selector::parse("tr").map_err(|e| format!("{:?}", e))?;
    let cells = Selector::parse("th, td").map_err(|e| format!("{:?}", e))?;
    let header_cells = Selector::parse("th").map_err(|e| format!("{:?}", e))?;

    let mut blocks = Vec::new();
    let root = document
        .select(&body)
        .next()
        .unwrap_or_else(|| document.root_element());

    let selectors = TableSelectors {
        rows: &rows,
        cells: &cells,
        header_cells: &header_cells,
    };
    walk_html(root, &selectors, &mut blocks);
    Ok(blocks)
}

struct TableSelectors<'a> {
    rows: &'a Selector,
    cells: &'a Selector,
    header_cells: &'a Selector,
}

fn walk_html(element: ElementRef<'_>, selectors: &TableSelectors<'_>, blocks: &mut Vec<Block>) {
    let mut loose_text = String::new();

    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            loose_text.push_str(text);
            continue;
        }
        let Some(child) = ElementRef::wrap(child) else {
            continue;
        };

        let name = child.value().name();
        let is_inline = matches!(
            name,
            "span" | "b" | "strong" | "i" | "em" | "code" | "small" | "sup" | "sub" | "u" | "abbr"
        );
        if is_inline {
            loose_text.push_str(&child.text().collect::<String>());
            continue;
        }

        flush_loose(&mut loose_text, blocks);
        match name {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = name[1..].parse::<u32>().unwrap_or(1);
                blocks.push(Block::Heading {
                    level,
                    text: element_text(child),
                });
            }
            "p" => html_paragraph(child, blocks),
            "li" => {
                let nested = child
                    .children()
                    .filter_map(ElementRef::wrap)
                    .any(|c| matches!(c.value().name(), "ul" | "ol"));
                if nested {
                    walk_html(child, selectors, blocks);
                } else {
                    let text = element_text(child);
                    if !text.is_empty() {
                        blocks.push(Block::ListItem(text));
                    }
                }
            }
            "pre" => {
                let code = child.text().collect::<String>();
                if !code.trim().is_empty() {
                    blocks.push(Block::Code(code.trim_end().to_string()));
                }
            }
            "table" => html_table(child, selectors, blocks),
            "img" => {
                if let Some(src) = child.value().attr("src") {
                    blocks.push(Block::Image {
                        source: src.to_string(),
                        alt: child.value().attr("alt").unwrap_or_default().to_string(),
                    });
                }
            }
            "a" => {
                let text = element_text(child);
                match child.value().attr("href") {
                    Some(href) if !text.is_empty() => blocks.push(Block::Link {
                        text,
                        href: href.to_string(),
                    }),
                    _ if !text.is_empty() => blocks.push(Block::Paragraph(text)),
                    _ => {}
                }
            }
            "script" | "style" | "noscript" | "template" | "head" | "svg" => {}
            "br" | "hr" => {}
            _ => walk_html(child, selectors, blocks),
        }
    }

    flush_loose(&mut loose_text, blocks);
}

fn flush_loose(text: &mut String, blocks: &mut Vec<Block>) {
    let collapsed = collapse_whitespace(text);
    if !collapsed.is_empty() {
        blocks.push(Block::Paragraph(collapsed));
    }
    text.clear();
}

fn html_paragraph(element: ElementRef<'_>, blocks: &mut Vec<Block>) {
    let text = element_text(element);
    let children: Vec<ElementRef<'_>> = element.children().filter_map(ElementRef::wrap).collect();

    let sole_link = match children.as_slice() {
        [only] if only.value().name() == "a" && element_text(*only) == text => {
            only.value().attr("href")
        }
        _ => None,
    };

    match sole_link {
        Some(href) if !text.is_empty() => blocks.push(Block::Link {
            text,
            href: href.to_string(),
        }),
        _ if !text.is_empty() => blocks.push(Block::Paragraph(text)),
        _ => {}
    }

    // Images keep their place right after the paragraph that holds them
    for image in element.descendants().filter_map(ElementRef::wrap) {
        if image.value().name() == "img" {
            if let Some(src) = image.value().attr("src") {
                blocks.push(Block::Image {
                    source: src.to_string(),
                    alt: image.value().attr("alt").unwrap_or_default().to_string(),
                });
            }
        }
    }
}

fn html_table(element: ElementRef<'_>, selectors: &TableSelectors<'_>, blocks: &mut Vec<Block>) {
    let mut header: Vec<String> = Vec::new();
    for row in element.select(selectors.rows) {
        let cells: Vec<String> = row.select(selectors.cells).map(element_text).collect();
        let is_header = header.is_empty() && row.select(selectors.header_cells).next().is_some();
        if is_header {
            header = cells;
            continue;
        }
        if cells.iter().all(|c| c.is_empty()) {
            continue;
        }
        blocks.push(Block::TableRow(render_row(&header, &cells)));
    }
}
