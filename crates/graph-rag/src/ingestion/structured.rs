//! Plain text, JSON and YAML parsing (flat formats)

use std::path::Path;

use super::parse_tree::{NodeTopology, NodeType, ParseNode, ParseResult};
use crate::error::{ParseError, Result};

/// Split text on blank lines into paragraph leaves
pub fn parse_text(data: &[u8]) -> ParseResult {
    let text = String::from_utf8_lossy(data);
    ParseResult::list(
        paragraphs(&text)
            .into_iter()
            .map(|p| ParseNode::list_leaf(NodeType::Text, p))
            .collect(),
    )
}

/// Paragraphs of a text separated by one or more blank lines
pub(crate) fn paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        out.push(current.join("\n"));
    }
    out
}

/// One leaf per top-level entry of an object or array
pub fn parse_json(path: &Path, data: &[u8]) -> Result<ParseResult> {
    let value: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| ParseError::decode(path, format!("invalid JSON: {}", e)))?;

    let render = |v: &serde_json::Value| serde_json::to_string(v).unwrap_or_default();

    let result = match value {
        serde_json::Value::Object(map) => ParseResult::list(
            map.iter()
                .map(|(key, v)| ParseNode::list_leaf(NodeType::Json, format!("{}: {}", key, render(v))))
                .collect(),
        ),
        serde_json::Value::Array(items) => ParseResult::list(
            items
                .iter()
                .map(|v| ParseNode::list_leaf(NodeType::Json, render(v)))
                .collect(),
        ),
        scalar => ParseResult::general(ParseNode::new(
            NodeTopology::General,
            NodeType::Json,
            render(&scalar),
        )),
    };
    Ok(result)
}

/// One leaf per top-level key (or top-level sequence item) of a YAML file.
///
/// The document is not interpreted; each leaf carries the raw lines of its
/// entry, comments included.
pub fn parse_yaml(path: &Path, data: &[u8]) -> Result<ParseResult> {
    let text = std::str::from_utf8(data)
        .map_err(|e| ParseError::decode(path, format!("invalid UTF-8: {}", e)))?;

    let mut entries: Vec<Vec<&str>> = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            continue;
        }
        if starts_entry(trimmed) {
            entries.push(vec![trimmed]);
            continue;
        }
        match entries.last_mut() {
            Some(lines) => lines.push(trimmed),
            // Preamble (comments before the first key)
            None if !trimmed.trim().is_empty() => entries.push(vec![trimmed]),
            None => {}
        }
    }

    let nodes = entries
        .into_iter()
        .map(|lines| lines.join("\n").trim_end().to_string())
        .filter(|content| !content.trim().is_empty())
        .map(|content| ParseNode::list_leaf(NodeType::Json, content))
        .collect();
    Ok(ParseResult::list(nodes))
}

/// A `key:` line or a `- item` line at column 0
fn starts_entry(line: &str) -> bool {
    let Some(first) = line.chars().next() else {
        return false;
    };
    if first.is_whitespace() || first == '#' {
        return false;
    }
    if line == "-" || line.starts_with("- ") {
        return true;
    }
    match line.find(':') {
        Some(colon) => {
            let rest = &line[colon + 1..];
            rest.is_empty() || rest.starts_with(' ')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::parse_tree::ResultTopology;

    #[test]
    fn test_text_paragraphs() {
        let result = parse_text(b"first line\nstill first\n\n\nsecond\n");
        assert_eq!(result.nodes.len(), 2);
        assert_eq!(result.nodes[0].content, "first line\nstill first");
        assert_eq!(result.nodes[1].content, "second");
    }

    #[test]
    fn test_json_object_entries() {
        let data = br#"{"name": "svc", "ports": [80, 443]}"#;
        let result = parse_json(Path::new("a.json"), data).unwrap();
        assert_eq!(result.topology, ResultTopology::List);
        assert_eq!(result.nodes.len(), 2);
        assert!(result.nodes.iter().all(|n| n.node_type == NodeType::Json));
        assert!(result.nodes.iter().any(|n| n.content == "ports: [80,443]"));
    }

    #[test]
    fn test_json_scalar_is_general() {
        let result = parse_json(Path::new("a.json"), b"42").unwrap();
        assert_eq!(result.topology, ResultTopology::General);
        assert!(parse_json(Path::new("a.json"), b"{oops").is_err());
    }

    #[test]
    fn test_yaml_top_level_keys() {
        let yaml = "---\n# service\nname: api\nserver:\n  port: 8080\n  host: local\nurl: http://x\n";
        let result = parse_yaml(Path::new("c.yaml"), yaml.as_bytes()).unwrap();
        let contents: Vec<_> = result.nodes.iter().map(|n| n.content.as_str()).collect();
        assert_eq!(contents.len(), 4);
        assert_eq!(contents[0], "# service");
        assert_eq!(contents[1], "name: api");
        assert_eq!(contents[3], "url: http://x");
        assert_eq!(result.nodes[2].content, "server:\n  port: 8080\n  host: local");
    }

    #[test]
    fn test_yaml_sequence_items() {
        let yaml = "- a: 1\n  b: 2\n- c: 3\n";
        let result = parse_yaml(Path::new("c.yml"), yaml.as_bytes()).unwrap();
        assert_eq!(result.nodes.len(), 2);
        assert_eq!(result.nodes[0].content, "- a: 1\n  b: 2");
    }
}
