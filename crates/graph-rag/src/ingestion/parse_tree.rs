//! Parse tree produced by the format parsers
//!
//! Parsers first lower a file into a flat sequence of [`Block`]s in reading
//! order. Tree-capable formats then run [`segment`], an index-based recursive
//! descent that nests every block under the closest preceding heading of a
//! lower level and returns how many sibling blocks each subtree consumed.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shape of a parser's output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultTopology {
    /// Single-level sequence of nodes
    List,
    /// Heading-nested tree under one root node
    Tree,
    /// A single node (whole-file formats such as pictures)
    General,
}

/// Position of a node inside its result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NodeTopology {
    General,
    ListLeaf,
    TreeRoot,
    TreeNormal,
    TreeLeaf,
}

/// Content class of a node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Text,
    Table,
    Image,
    Code,
    Link,
    Json,
}

/// One node of a parse result
#[derive(Debug, Clone, PartialEq)]
pub struct ParseNode {
    pub id: Uuid,
    /// Depth in the tree (root = 0); always 0 for list results
    pub level: u32,
    pub topology: NodeTopology,
    pub title: Option<String>,
    pub content: String,
    pub node_type: NodeType,
    /// Where an image came from (path, URL or data URI)
    pub image_source: Option<String>,
    /// Raw image bytes once resolved
    pub image_data: Option<Vec<u8>>,
    pub children: Vec<ParseNode>,
}

impl ParseNode {
    pub fn new(topology: NodeTopology, node_type: NodeType, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level: 0,
            topology,
            title: None,
            content: content.into(),
            node_type,
            image_source: None,
            image_data: None,
            children: Vec::new(),
        }
    }

    /// Flat-format leaf
    pub fn list_leaf(node_type: NodeType, content: impl Into<String>) -> Self {
        Self::new(NodeTopology::ListLeaf, node_type, content)
    }

    /// Image node with unresolved bytes
    pub fn image(topology: NodeTopology, source: impl Into<String>, alt: impl Into<String>) -> Self {
        let mut node = Self::new(topology, NodeType::Image, alt);
        node.image_source = Some(source.into());
        node
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Title and content joined, as stored in a chunk
    pub fn text(&self) -> String {
        match (&self.title, self.content.trim()) {
            (Some(title), "") => title.clone(),
            (Some(title), content) => format!("{}\n{}", title, content),
            (None, content) => content.to_string(),
        }
    }

    /// Number of nodes in this subtree, including itself
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(|c| c.subtree_len()).sum::<usize>()
    }
}

/// Output of a format parser
#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    pub topology: ResultTopology,
    pub nodes: Vec<ParseNode>,
}

impl ParseResult {
    pub fn list(nodes: Vec<ParseNode>) -> Self {
        Self {
            topology: ResultTopology::List,
            nodes,
        }
    }

    pub fn general(node: ParseNode) -> Self {
        Self {
            topology: ResultTopology::General,
            nodes: vec![node],
        }
    }

    /// Total node count across all subtrees
    pub fn node_count(&self) -> usize {
        self.nodes.iter().map(|n| n.subtree_len()).sum()
    }

    /// Depth-first visit of every node
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a ParseNode)) {
        fn go<'a>(node: &'a ParseNode, visit: &mut impl FnMut(&'a ParseNode)) {
            visit(node);
            for child in &node.children {
                go(child, visit);
            }
        }
        for node in &self.nodes {
            go(node, visit);
        }
    }
}

/// Block-level element in reading order
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Heading { level: u32, text: String },
    Paragraph(String),
    ListItem(String),
    Code(String),
    /// One table row, already rendered as text
    TableRow(String),
    Image { source: String, alt: String },
    Link { text: String, href: String },
}

impl Block {
    fn is_text(&self) -> bool {
        matches!(self, Block::Paragraph(_) | Block::ListItem(_))
    }

    /// Leaf node for a non-heading block
    fn into_leaf(self, topology: NodeTopology, level: u32) -> Option<ParseNode> {
        let mut node = match self {
            Block::Heading { .. } => return None,
            Block::Paragraph(text) | Block::ListItem(text) => {
                ParseNode::new(topology, NodeType::Text, text)
            }
            Block::Code(code) => ParseNode::new(topology, NodeType::Code, code),
            Block::TableRow(row) => ParseNode::new(topology, NodeType::Table, row),
            Block::Image { source, alt } => ParseNode::image(topology, source, alt),
            Block::Link { text, href } => {
                ParseNode::new(topology, NodeType::Link, format!("{} ({})", text, href))
            }
        };
        node.level = level;
        Some(node)
    }
}

/// Lower blocks into a flat list result; headings become ordinary text leaves
pub fn flatten(blocks: Vec<Block>) -> ParseResult {
    let nodes = blocks
        .into_iter()
        .filter_map(|block| match block {
            Block::Heading { text, .. } => Some(ParseNode::list_leaf(NodeType::Text, text)),
            other => other.into_leaf(NodeTopology::ListLeaf, 0),
        })
        .filter(|n| n.node_type == NodeType::Image || !n.content.trim().is_empty())
        .collect();
    ParseResult::list(nodes)
}

/// Nest blocks under their headings and wrap them in a tree root
pub fn segment(blocks: &[Block], root_title: &str) -> ParseResult {
    let (children, _) = segment_siblings(blocks, 0, 0, 1);

    let mut root = ParseNode::new(NodeTopology::TreeRoot, NodeType::Text, "");
    root.title = Some(root_title.to_string());
    root.children = children;

    ParseResult {
        topology: ResultTopology::Tree,
        nodes: vec![root],
    }
}

/// Parse the siblings starting at `start` that belong under a heading of
/// `parent_level`. Returns the nodes and the number of blocks consumed.
fn segment_siblings(
    blocks: &[Block],
    start: usize,
    parent_level: u32,
    depth: u32,
) -> (Vec<ParseNode>, usize) {
    let mut nodes = Vec::new();
    let mut i = start;

    while i < blocks.len() {
        match &blocks[i] {
            Block::Heading { level, .. } if *level <= parent_level => break,
            Block::Heading { level, text } => {
                i += 1;

                // Leading text directly below the heading becomes its content
                let mut content = Vec::new();
                while i < blocks.len() && blocks[i].is_text() {
                    if let Block::Paragraph(t) | Block::ListItem(t) = &blocks[i] {
                        content.push(t.as_str());
                    }
                    i += 1;
                }

                let (children, consumed) = segment_siblings(blocks, i, *level, depth + 1);
                i += consumed;

                let topology = if children.is_empty() {
                    NodeTopology::TreeLeaf
                } else {
                    NodeTopology::TreeNormal
                };
                let mut node = ParseNode::new(topology, NodeType::Text, content.join("\n"));
                node.title = Some(text.clone());
                node.level = depth;
                node.children = children;
                nodes.push(node);
            }
            block => {
                if let Some(leaf) = block.clone().into_leaf(NodeTopology::TreeLeaf, depth) {
                    if leaf.node_type == NodeType::Image || !leaf.content.trim().is_empty() {
                        nodes.push(leaf);
                    }
                }
                i += 1;
            }
        }
    }

    (nodes, i - start)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heading(level: u32, text: &str) -> Block {
        Block::Heading {
            level,
            text: text.to_string(),
        }
    }

    fn para(text: &str) -> Block {
        Block::Paragraph(text.to_string())
    }

    #[test]
    fn test_segment_nests_by_level() {
        let blocks = vec![
            para("preamble"),
            heading(1, "Intro"),
            para("intro text"),
            heading(2, "Detail"),
            para("detail text"),
            Block::Code("fn main() {}".to_string()),
            heading(1, "Outro"),
            para("bye"),
        ];

        let result = segment(&blocks, "doc");
        assert_eq!(result.topology, ResultTopology::Tree);
        let root = &result.nodes[0];
        assert_eq!(root.topology, NodeTopology::TreeRoot);
        assert_eq!(root.children.len(), 3);

        let intro = &root.children[1];
        assert_eq!(intro.title.as_deref(), Some("Intro"));
        assert_eq!(intro.content, "intro text");
        assert_eq!(intro.topology, NodeTopology::TreeNormal);
        assert_eq!(intro.children.len(), 1);

        let detail = &intro.children[0];
        assert_eq!(detail.level, 2);
        assert_eq!(detail.children.len(), 1);
        assert_eq!(detail.children[0].node_type, NodeType::Code);

        let outro = &root.children[2];
        assert_eq!(outro.topology, NodeTopology::TreeLeaf);
        assert_eq!(result.node_count(), 6);
    }

    #[test]
    fn test_heading_stops_at_same_level() {
        let blocks = vec![heading(2, "A"), para("a"), heading(2, "B"), para("b")];
        let (nodes, consumed) = segment_siblings(&blocks, 0, 0, 1);
        assert_eq!(consumed, 4);
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.topology == NodeTopology::TreeLeaf));
    }

    #[test]
    fn test_flatten_drops_empty_text() {
        let result = flatten(vec![heading(1, "Title"), para("   "), para("body")]);
        assert_eq!(result.topology, ResultTopology::List);
        assert_eq!(result.nodes.len(), 2);
        assert!(result.nodes.iter().all(|n| n.topology == NodeTopology::ListLeaf));
    }

    #[test]
    fn test_node_text_joins_title() {
        let node = ParseNode::list_leaf(NodeType::Text, "body").with_title("Title");
        assert_eq!(node.text(), "Title\nbody");
    }
}
