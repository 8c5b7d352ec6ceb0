//! Flattening of parse trees into chunks and chunk links
//!
//! Line documents (list and single-node results) get offsets by reading
//! order and by same-type run. Tree documents keep their hierarchy through
//! `link_to` and tree links, with the node depth stored as local offset.

use uuid::Uuid;

use super::merge::{normalize_siblings, MergePolicy};
use super::tokens::count_tokens;
use crate::ingestion::{NodeTopology, NodeType, ParseNode, ParseResult, ResultTopology};
use crate::types::{
    BigType, Chunk, ChunkAttr, ChunkLink, ChunkType, LinkJump, LinkScope, ParserMethod, Structure,
};

/// Image bytes pulled out of a document, to be stored under `blob_id`
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub blob_id: Uuid,
    /// Image chunk, or the paragraph chunk the image is attached to
    pub chunk_id: Uuid,
    pub data: Vec<u8>,
    /// Text of the closest paragraph before the image chunk
    pub context_before: Option<String>,
    /// Text of the closest paragraph after the image chunk
    pub context_after: Option<String>,
}

/// Output of [`ChunkBuilder::build`]
#[derive(Debug, Clone, Default)]
pub struct ChunkGraph {
    pub chunks: Vec<Chunk>,
    pub links: Vec<ChunkLink>,
    pub images: Vec<ExtractedImage>,
}

impl ChunkGraph {
    /// Image chunks whose text still has to come from OCR
    pub fn image_chunks(&self) -> impl Iterator<Item = &ExtractedImage> {
        self.images.iter().filter(move |img| {
            self.chunks
                .iter()
                .any(|c| c.id == img.chunk_id && c.is_image())
        })
    }
}

fn big_type(node_type: NodeType) -> BigType {
    match node_type {
        NodeType::Text => BigType::Para,
        NodeType::Table => BigType::Table,
        NodeType::Image => BigType::Image,
        NodeType::Code => BigType::Code,
        NodeType::Link => BigType::Link,
        NodeType::Json => BigType::Json,
    }
}

/// Builds the chunk graph of one document
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    document_id: Uuid,
    method: ParserMethod,
    policy: MergePolicy,
}

impl ChunkBuilder {
    pub fn new(document_id: Uuid, method: ParserMethod, policy: MergePolicy) -> Self {
        Self {
            document_id,
            method,
            policy,
        }
    }

    pub fn build(&self, result: ParseResult) -> ChunkGraph {
        let topology = result.topology;
        let nodes = normalize_siblings(result.nodes, &self.policy);

        let mut state = BuildState::new(self, topology == ResultTopology::Tree);
        match topology {
            ResultTopology::Tree => {
                for node in nodes {
                    state.visit_tree(node, None);
                }
            }
            ResultTopology::List | ResultTopology::General => {
                for node in nodes {
                    state.visit_line(node, topology == ResultTopology::General);
                }
            }
        }
        state.finish()
    }
}

struct BuildState<'a> {
    builder: &'a ChunkBuilder,
    graph: ChunkGraph,
    tree: bool,
    /// Index of the latest paragraph chunk, for attaching images
    last_para: Option<usize>,
    /// Image nodes waiting for a paragraph to attach to
    unattached: Vec<ParseNode>,
}

impl<'a> BuildState<'a> {
    fn new(builder: &'a ChunkBuilder, tree: bool) -> Self {
        Self {
            builder,
            graph: ChunkGraph::default(),
            tree,
            last_para: None,
            unattached: Vec::new(),
        }
    }

    fn chunk_type(&self, big: BigType, structure: Structure, attr: ChunkAttr) -> ChunkType {
        ChunkType::new(self.builder.method, big, structure, attr)
    }

    /// Images stay metadata of a paragraph unless the parser method
    /// promotes them (or the whole document is one picture)
    fn attaches_image(&self, node: &ParseNode, whole_document: bool) -> bool {
        node.node_type == NodeType::Image && !self.builder.method.images_as_chunks() && !whole_document
    }

    fn attach_image(&mut self, mut node: ParseNode) {
        match self.last_para {
            Some(idx) => {
                if let Some(data) = node.image_data.take() {
                    self.attach_to(idx, data);
                }
            }
            None => self.unattached.push(node),
        }
    }

    /// A paragraph keeps every image that follows it, in reading order
    fn attach_to(&mut self, idx: usize, data: Vec<u8>) {
        let chunk = &mut self.graph.chunks[idx];
        let blob_id = Uuid::new_v4();
        chunk.image_blob_ids.push(blob_id);
        self.graph.images.push(ExtractedImage {
            blob_id,
            chunk_id: chunk.id,
            data,
            context_before: None,
            context_after: None,
        });
    }

    /// Append a chunk in reading order and link it to its predecessor
    fn push(&mut self, node: ParseNode, chunk_type: ChunkType, local_offset: i64, link_to: Option<Uuid>) -> Option<usize> {
        let text = node.text();
        let is_image = node.node_type == NodeType::Image;
        if !is_image && text.trim().is_empty() {
            return None;
        }

        let previous = self.graph.chunks.last().map(|c| c.id);
        let chunk = Chunk {
            id: Uuid::new_v4(),
            document_id: self.builder.document_id,
            token_count: count_tokens(&text),
            text,
            chunk_type,
            global_offset: self.graph.chunks.len() as i64,
            local_offset,
            enabled: true,
            link_to,
            image_blob_ids: Vec::new(),
        };
        let id = chunk.id;
        let idx = self.graph.chunks.len();
        self.graph.chunks.push(chunk);

        if let Some(pair) = ChunkLink::pair(previous, Some(id), LinkScope::Global, Structure::Line, LinkJump::Step) {
            self.graph.links.extend(pair);
        }

        if is_image {
            if let Some(data) = node.image_data {
                let blob_id = Uuid::new_v4();
                self.graph.chunks[idx].image_blob_ids.push(blob_id);
                self.graph.images.push(ExtractedImage {
                    blob_id,
                    chunk_id: id,
                    data,
                    context_before: None,
                    context_after: None,
                });
            }
        }

        if chunk_type.big == BigType::Para {
            self.last_para = Some(idx);
            for mut image in std::mem::take(&mut self.unattached) {
                if let Some(data) = image.image_data.take() {
                    self.attach_to(idx, data);
                }
            }
        }
        Some(idx)
    }

    fn visit_line(&mut self, node: ParseNode, whole_document: bool) {
        if self.attaches_image(&node, whole_document) {
            if node.image_data.is_some() {
                self.attach_image(node);
            }
            return;
        }

        let big = big_type(node.node_type);
        let prev = self.graph.chunks.last();
        let local_offset = match prev {
            Some(p) if p.chunk_type.big == big => p.local_offset + 1,
            _ => 0,
        };
        // Closest earlier chunk of the same type, adjacent or not
        let same_type = self
            .graph
            .chunks
            .iter()
            .rev()
            .find(|c| c.chunk_type.big == big)
            .map(|c| (c.id, c.global_offset));

        let attr = if local_offset == 0 { ChunkAttr::Head } else { ChunkAttr::Normal };
        let chunk_type = self.chunk_type(big, Structure::Line, attr);

        if let Some(idx) = self.push(node, chunk_type, local_offset, None) {
            let (id, offset) = (self.graph.chunks[idx].id, self.graph.chunks[idx].global_offset);
            if let Some((prev_id, prev_offset)) = same_type {
                let jump = if offset - prev_offset == 1 { LinkJump::Step } else { LinkJump::Jump };
                if let Some(pair) = ChunkLink::pair(Some(prev_id), Some(id), LinkScope::Local, Structure::Line, jump) {
                    self.graph.links.extend(pair);
                }
            }
        }
    }

    /// Pre-order walk; returns the chunk index of `node` when it produced one
    fn visit_tree(&mut self, mut node: ParseNode, parent: Option<usize>) -> Option<usize> {
        if self.attaches_image(&node, false) {
            if node.image_data.is_some() {
                node.children.clear();
                self.attach_image(node);
            }
            return None;
        }

        let children = std::mem::take(&mut node.children);
        let own = if node.topology == NodeTopology::TreeRoot && node.content.trim().is_empty() {
            // The synthetic document root only groups top-level sections
            None
        } else {
            let attr = match node.topology {
                NodeTopology::TreeRoot => ChunkAttr::Root,
                _ if children.is_empty() => ChunkAttr::Leaf,
                _ => ChunkAttr::Normal,
            };
            let chunk_type = self.chunk_type(big_type(node.node_type), Structure::Tree, attr);
            let link_to = parent.map(|p| self.graph.chunks[p].id);
            let depth = node.level as i64;
            let idx = self.push(node, chunk_type, depth, link_to);
            if let (Some(p), Some(c)) = (parent, idx) {
                self.link_tree(p, c, LinkScope::Global);
            }
            idx
        };

        let child_parent = own.or(parent);
        let mut previous_sibling: Option<usize> = None;
        for child in children {
            if let Some(idx) = self.visit_tree(child, child_parent) {
                if let Some(prev) = previous_sibling {
                    self.link_tree(prev, idx, LinkScope::Local);
                }
                previous_sibling = Some(idx);
            }
        }
        own
    }

    /// Tree link pair between two chunk indices in reading order; parent and
    /// child links are global, sibling links local
    fn link_tree(&mut self, from: usize, to: usize, scope: LinkScope) {
        let (a, b) = (&self.graph.chunks[from], &self.graph.chunks[to]);
        let jump = if b.global_offset - a.global_offset == 1 { LinkJump::Step } else { LinkJump::Jump };
        if let Some(pair) = ChunkLink::pair(Some(a.id), Some(b.id), scope, Structure::Tree, jump) {
            self.graph.links.extend(pair);
        }
    }

    /// Images of a document without any paragraph become image chunks of
    /// their own, appended in reading order
    fn promote_unattached(&mut self) {
        let pending = std::mem::take(&mut self.unattached);
        if pending.is_empty() {
            return;
        }
        tracing::debug!(
            "Document {} has no paragraph, keeping {} image(s) as chunks",
            self.builder.document_id,
            pending.len()
        );
        for node in pending {
            if self.tree {
                let chunk_type = self.chunk_type(BigType::Image, Structure::Tree, ChunkAttr::Leaf);
                let depth = node.level as i64;
                self.push(node, chunk_type, depth, None);
            } else {
                self.visit_line(node, true);
            }
        }
    }

    fn finish(mut self) -> ChunkGraph {
        self.promote_unattached();

        let chunks = &self.graph.chunks;
        for image in self.graph.images.iter_mut() {
            let Some(pos) = chunks.iter().position(|c| c.id == image.chunk_id) else {
                continue;
            };
            if !chunks[pos].is_image() {
                continue;
            }
            image.context_before = chunks[..pos]
                .iter()
                .rev()
                .find(|c| c.chunk_type.big == BigType::Para)
                .map(|c| c.text.clone());
            image.context_after = chunks[pos + 1..]
                .iter()
                .find(|c| c.chunk_type.big == BigType::Para)
                .map(|c| c.text.clone());
        }
        self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::DocumentParser;
    use crate::types::LinkModel;
    use std::collections::HashSet;
    use std::path::Path;

    fn builder(method: ParserMethod) -> ChunkBuilder {
        ChunkBuilder::new(Uuid::new_v4(), method, MergePolicy::new(512, 0.85))
    }

    fn leaf(node_type: NodeType, text: &str) -> ParseNode {
        ParseNode::list_leaf(node_type, text)
    }

    fn image_leaf(topology: NodeTopology) -> ParseNode {
        let mut node = ParseNode::image(topology, "a.png", "");
        node.image_data = Some(b"img".to_vec());
        node
    }

    fn assert_links_symmetric(graph: &ChunkGraph) {
        let ids: HashSet<Uuid> = graph.chunks.iter().map(|c| c.id).collect();
        for link in &graph.links {
            assert!(ids.contains(&link.chunk_a) && ids.contains(&link.chunk_b));
            let mirror = graph.links.iter().any(|l| {
                l.chunk_a == link.chunk_b && l.chunk_b == link.chunk_a && l.link_type == link.link_type.reversed()
            });
            assert!(mirror, "missing mirror for {}", link.link_type);
        }
    }

    #[test]
    fn test_line_offsets_and_runs() {
        // Large paragraphs so the merge pass leaves them alone
        let para = |w: &str| leaf(NodeType::Text, &format!("{} ", w).repeat(300));
        let result = ParseResult::list(vec![
            para("alpha"),
            para("beta"),
            leaf(NodeType::Table, "k: 1"),
            leaf(NodeType::Table, "k: 2"),
            para("gamma"),
        ]);
        let graph = builder(ParserMethod::General).build(result);

        let globals: Vec<i64> = graph.chunks.iter().map(|c| c.global_offset).collect();
        let locals: Vec<i64> = graph.chunks.iter().map(|c| c.local_offset).collect();
        assert_eq!(globals, vec![0, 1, 2, 3, 4]);
        assert_eq!(locals, vec![0, 1, 0, 1, 0]);
        assert_eq!(graph.chunks[0].chunk_type.to_string(), "general.para.line.head");
        assert_eq!(graph.chunks[1].chunk_type.to_string(), "general.para.line.normal");
        assert_eq!(graph.chunks[2].chunk_type.attr, ChunkAttr::Head);

        // Paragraph run resumes after the table: local link with a jump
        let jump = graph.links.iter().find(|l| {
            l.chunk_a == graph.chunks[1].id
                && l.chunk_b == graph.chunks[4].id
                && l.link_type.model == LinkModel::Next
        });
        assert_eq!(jump.map(|l| l.link_type.to_string()).as_deref(), Some("local.next.line.jump"));
        assert_links_symmetric(&graph);
    }

    #[test]
    fn test_general_method_attaches_image_to_preceding_paragraph() {
        let result = ParseResult::list(vec![
            leaf(NodeType::Text, "intro"),
            image_leaf(NodeTopology::ListLeaf),
            leaf(NodeType::Code, "let x = 1;"),
        ]);
        let graph = builder(ParserMethod::General).build(result);
        assert_eq!(graph.chunks.len(), 2);
        assert!(graph.chunks.iter().all(|c| !c.is_image()));
        assert_eq!(graph.images.len(), 1);
        assert_eq!(graph.chunks[0].image_blob_ids, vec![graph.images[0].blob_id]);
        assert_eq!(graph.image_chunks().count(), 0);
    }

    #[test]
    fn test_general_method_keeps_every_image_of_a_paragraph() {
        let result = ParseResult::list(vec![
            leaf(NodeType::Text, "intro paragraph"),
            image_leaf(NodeTopology::ListLeaf),
            image_leaf(NodeTopology::ListLeaf),
        ]);
        let graph = builder(ParserMethod::General).build(result);
        assert_eq!(graph.chunks.len(), 1);
        assert_eq!(graph.images.len(), 2);
        let blobs: Vec<Uuid> = graph.images.iter().map(|i| i.blob_id).collect();
        assert_eq!(graph.chunks[0].image_blob_ids, blobs);
        assert!(graph.images.iter().all(|i| i.chunk_id == graph.chunks[0].id));
    }

    #[test]
    fn test_images_without_paragraph_become_chunks() {
        let result = ParseResult::list(vec![image_leaf(NodeTopology::ListLeaf), image_leaf(NodeTopology::ListLeaf)]);
        let graph = builder(ParserMethod::General).build(result);
        assert_eq!(graph.chunks.len(), 2);
        assert!(graph.chunks.iter().all(|c| c.is_image()));
        assert_eq!(graph.images.len(), 2);
        assert_eq!(graph.image_chunks().count(), 2);
        let offsets: Vec<(i64, i64)> = graph.chunks.iter().map(|c| (c.global_offset, c.local_offset)).collect();
        assert_eq!(offsets, vec![(0, 0), (1, 1)]);
        assert_links_symmetric(&graph);
    }

    #[test]
    fn test_image_only_tree_keeps_images() {
        let mut root = ParseNode::new(NodeTopology::TreeRoot, NodeType::Text, "");
        root.children = vec![image_leaf(NodeTopology::TreeLeaf), image_leaf(NodeTopology::TreeLeaf)];
        let result = ParseResult {
            topology: ResultTopology::Tree,
            nodes: vec![root],
        };
        let graph = builder(ParserMethod::General).build(result);
        assert_eq!(graph.chunks.len(), 2);
        assert!(graph.chunks.iter().all(|c| c.is_image() && c.link_to.is_none()));
        assert_eq!(graph.images.len(), 2);
    }

    #[test]
    fn test_ocr_method_promotes_image_with_context() {
        let big = |w: &str| leaf(NodeType::Text, &format!("{} ", w).repeat(300));
        let result = ParseResult::list(vec![big("before"), image_leaf(NodeTopology::ListLeaf), big("after")]);
        let graph = builder(ParserMethod::Ocr).build(result);
        assert_eq!(graph.chunks.len(), 3);
        assert!(graph.chunks[1].is_image());
        assert_eq!(graph.chunks[1].chunk_type.to_string(), "ocr.image.line.head");

        let image = graph.image_chunks().next().unwrap();
        assert!(image.context_before.as_deref().unwrap().starts_with("before"));
        assert!(image.context_after.as_deref().unwrap().starts_with("after"));
    }

    #[test]
    fn test_tree_links_and_depth() {
        let md = "# Top\n\nintro\n\n## Child A\n\ntext a\n\n```\ncode\n```\n\n## Child B\n\ntext b\n";
        let result = DocumentParser::parse_native(crate::types::FileType::Markdown, Path::new("t.md"), md.as_bytes()).unwrap();
        let graph = builder(ParserMethod::General).build(result);

        let titles: Vec<&str> = graph.chunks.iter().map(|c| c.text.lines().next().unwrap_or("")).collect();
        assert_eq!(titles, vec!["Top", "Child A", "code", "Child B"]);

        let top = &graph.chunks[0];
        assert_eq!(top.link_to, None);
        assert_eq!(top.local_offset, 1);
        assert_eq!(top.chunk_type.to_string(), "general.para.tree.normal");
        assert_eq!(graph.chunks[1].link_to, Some(top.id));
        assert_eq!(graph.chunks[1].local_offset, 2);
        assert_eq!(graph.chunks[2].link_to, Some(graph.chunks[1].id));
        assert_eq!(graph.chunks[2].chunk_type.to_string(), "general.code.tree.leaf");

        // Child A and Child B are siblings separated by Child A's code block
        let sibling = graph.links.iter().find(|l| {
            l.chunk_a == graph.chunks[1].id && l.chunk_b == graph.chunks[3].id && l.link_type.model == LinkModel::Next
        });
        assert_eq!(sibling.map(|l| l.link_type.to_string()).as_deref(), Some("local.next.tree.jump"));
        assert_links_symmetric(&graph);
    }

    #[test]
    fn test_markdown_scenario_three_chunks() {
        let body = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. ".repeat(12);
        let md = format!("## First\n\n{}\n\n## Second\n\n{}\n\n![figure](fig.png)\n", body, body);
        let mut result =
            DocumentParser::parse_native(crate::types::FileType::Markdown, Path::new("s.md"), md.as_bytes()).unwrap();
        assert!(md.len() > 1200);

        let root = &mut result.nodes[0];
        assert_eq!(root.topology, NodeTopology::TreeRoot);
        assert_eq!(root.children.len(), 2);
        root.children[1].children[0].image_data = Some(b"png".to_vec());

        let graph = builder(ParserMethod::Ocr).build(result);
        let offsets: Vec<i64> = graph.chunks.iter().map(|c| c.global_offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert!(graph.chunks[2].is_image());
        assert_eq!(graph.images.len(), 1);
    }

    #[test]
    fn test_picture_file_always_becomes_image_chunk() {
        let graph = builder(ParserMethod::General).build(ParseResult::general(image_leaf(NodeTopology::General)));
        assert_eq!(graph.chunks.len(), 1);
        assert!(graph.chunks[0].is_image());
        assert_eq!(graph.image_chunks().count(), 1);
        assert!(graph.links.is_empty());
    }
}
