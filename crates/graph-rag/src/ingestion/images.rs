//! Resolution of image references found while parsing
//!
//! Image nodes carry a source (relative path, URL or data URI). Sources are
//! fetched concurrently once the whole tree is known; nodes whose image
//! cannot be loaded are discarded.

use base64::Engine as _;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use super::parse_tree::{NodeTopology, NodeType, ParseNode, ParseResult};
use crate::error::{Error, Result};

/// Loads the bytes behind image references
#[derive(Debug, Clone)]
pub struct ImageResolver {
    client: reqwest::Client,
}

impl ImageResolver {
    pub fn new(fetch_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Fill `image_data` for every unresolved image node, then drop image
    /// nodes that are still empty
    pub async fn resolve(&self, result: &mut ParseResult, base_dir: Option<&Path>) {
        let mut sources = Vec::new();
        result.walk(&mut |node| {
            if node.node_type == NodeType::Image && node.image_data.is_none() {
                if let Some(source) = &node.image_source {
                    if !sources.contains(source) {
                        sources.push(source.clone());
                    }
                }
            }
        });

        let fetched = futures::future::join_all(sources.iter().map(|s| self.load(s, base_dir))).await;
        let loaded: HashMap<String, Vec<u8>> = sources
            .into_iter()
            .zip(fetched)
            .filter_map(|(source, bytes)| bytes.map(|b| (source, b)))
            .collect();

        for node in result.nodes.iter_mut() {
            fill(node, &loaded);
        }
        let before = result.node_count();
        prune_empty_images(&mut result.nodes);
        let dropped = before - result.node_count();
        if dropped > 0 {
            tracing::info!("Discarded {} unresolvable image(s)", dropped);
        }
    }

    async fn load(&self, source: &str, base_dir: Option<&Path>) -> Option<Vec<u8>> {
        let bytes = if let Some(data) = source.strip_prefix("data:") {
            decode_data_uri(data)
        } else if source.starts_with("http://") || source.starts_with("https://") {
            self.fetch(source).await
        } else {
            let local = source.strip_prefix("file://").unwrap_or(source);
            match base_dir.and_then(|dir| contained_path(dir, local)) {
                Some(path) => tokio::fs::read(&path).await.ok(),
                None => None,
            }
        };

        match bytes {
            Some(b) if !b.is_empty() => Some(b),
            _ => {
                tracing::warn!("Could not load image {}", truncate(source, 80));
                None
            }
        }
    }

    async fn fetch(&self, url: &str) -> Option<Vec<u8>> {
        let response = match self.client.get(url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::debug!("Image fetch {} returned {}", url, r.status());
                return None;
            }
            Err(e) => {
                tracing::debug!("Image fetch {} failed: {}", url, e);
                return None;
            }
        };
        response.bytes().await.ok().map(|b| b.to_vec())
    }
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

/// `image/png;base64,AAAA` -> bytes
fn decode_data_uri(data: &str) -> Option<Vec<u8>> {
    let (meta, payload) = data.split_once(',')?;
    if !meta.ends_with(";base64") {
        return None;
    }
    base64::engine::general_purpose::STANDARD.decode(payload.trim()).ok()
}

/// Relative reference resolved under `base`; absolute paths and `..` are refused
fn contained_path(base: &Path, reference: &str) -> Option<PathBuf> {
    let reference = Path::new(reference);
    let safe = reference
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return None;
    }
    Some(base.join(reference))
}

fn fill(node: &mut ParseNode, loaded: &HashMap<String, Vec<u8>>) {
    if node.node_type == NodeType::Image && node.image_data.is_none() {
        if let Some(bytes) = node.image_source.as_ref().and_then(|s| loaded.get(s)) {
            node.image_data = Some(bytes.clone());
        }
    }
    for child in node.children.iter_mut() {
        fill(child, loaded);
    }
}

/// Remove image nodes without bytes; parents left without children become leaves
pub(crate) fn prune_empty_images(nodes: &mut Vec<ParseNode>) {
    nodes.retain(|n| {
        n.node_type != NodeType::Image || n.image_data.as_ref().is_some_and(|d| !d.is_empty())
    });
    for node in nodes.iter_mut() {
        prune_empty_images(&mut node.children);
        if node.topology == NodeTopology::TreeNormal && node.children.is_empty() {
            node.topology = NodeTopology::TreeLeaf;
        }
    }
}
