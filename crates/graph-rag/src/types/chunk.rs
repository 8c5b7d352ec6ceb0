//! Chunk and chunk-link records of the document graph

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::document::ParserMethod;

/// Coarse content class of a chunk
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BigType {
    Para,
    Table,
    Image,
    Code,
    Link,
    Json,
}

impl BigType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Para => "para",
            Self::Table => "table",
            Self::Image => "image",
            Self::Code => "code",
            Self::Link => "link",
            Self::Json => "json",
        }
    }
}

/// Whether a chunk or link follows reading order or the heading tree
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Structure {
    Line,
    Tree,
}

impl Structure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Tree => "tree",
        }
    }
}

/// Position attribute: `head`/`normal` in a line run, `root`/`normal`/`leaf` in a tree
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChunkAttr {
    Head,
    Normal,
    Root,
    Leaf,
}

impl ChunkAttr {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Normal => "normal",
            Self::Root => "root",
            Self::Leaf => "leaf",
        }
    }
}

/// `origin.bigType.smallType.attr`, e.g. `general.para.line.head`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChunkType {
    pub origin: ParserMethod,
    pub big: BigType,
    pub structure: Structure,
    pub attr: ChunkAttr,
}

impl ChunkType {
    pub fn new(origin: ParserMethod, big: BigType, structure: Structure, attr: ChunkAttr) -> Self {
        Self {
            origin,
            big,
            structure,
            attr,
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.origin.as_str(),
            self.big.as_str(),
            self.structure.as_str(),
            self.attr.as_str()
        )
    }
}

impl FromStr for ChunkType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 {
            return Err(format!("malformed chunk type '{}'", s));
        }
        let origin = ParserMethod::parse(parts[0]).ok_or_else(|| format!("bad origin in '{}'", s))?;
        let big = match parts[1] {
            "para" => BigType::Para,
            "table" => BigType::Table,
            "image" => BigType::Image,
            "code" => BigType::Code,
            "link" => BigType::Link,
            "json" => BigType::Json,
            other => return Err(format!("bad big type '{}'", other)),
        };
        let structure = parse_structure(parts[2])?;
        let attr = match parts[3] {
            "head" => ChunkAttr::Head,
            "normal" => ChunkAttr::Normal,
            "root" => ChunkAttr::Root,
            "leaf" => ChunkAttr::Leaf,
            other => return Err(format!("bad attr '{}'", other)),
        };
        Ok(Self::new(origin, big, structure, attr))
    }
}

impl From<ChunkType> for String {
    fn from(value: ChunkType) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for ChunkType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

fn parse_structure(value: &str) -> std::result::Result<Structure, String> {
    match value {
        "line" => Ok(Structure::Line),
        "tree" => Ok(Structure::Tree),
        other => Err(format!("bad structure '{}'", other)),
    }
}

/// The atomic retrievable unit of a parsed document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub text: String,
    pub token_count: usize,
    pub chunk_type: ChunkType,
    /// Position across the whole document, strictly increasing
    pub global_offset: i64,
    /// Position within the current same-type run (tree depth for tree chunks)
    pub local_offset: i64,
    pub enabled: bool,
    /// Parent chunk for tree-structured documents
    pub link_to: Option<Uuid>,
    /// Extracted images: the image of an image chunk, or every image
    /// attached to a paragraph in reading order
    #[serde(default)]
    pub image_blob_ids: Vec<Uuid>,
}

impl Chunk {
    pub fn is_image(&self) -> bool {
        self.chunk_type.big == BigType::Image
    }
}

/// Scope of a link: neighbour within the type run, or within the whole document
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LinkScope {
    Local,
    Global,
}

/// Direction of a link
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LinkModel {
    Next,
    Pre,
}

impl LinkModel {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Next => Self::Pre,
            Self::Pre => Self::Next,
        }
    }
}

/// Adjacent in reading order (`step`) or skipping over other chunks (`jump`)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LinkJump {
    Step,
    Jump,
}

/// `scope.model.structure.jump`, e.g. `local.next.line.step`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct LinkType {
    pub scope: LinkScope,
    pub model: LinkModel,
    pub structure: Structure,
    pub jump: LinkJump,
}

impl LinkType {
    /// Same link viewed from the other endpoint
    pub fn reversed(&self) -> Self {
        Self {
            model: self.model.opposite(),
            ..*self
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            LinkScope::Local => "local",
            LinkScope::Global => "global",
        };
        let model = match self.model {
            LinkModel::Next => "next",
            LinkModel::Pre => "pre",
        };
        let jump = match self.jump {
            LinkJump::Step => "step",
            LinkJump::Jump => "jump",
        };
        write!(f, "{}.{}.{}.{}", scope, model, self.structure.as_str(), jump)
    }
}

impl FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 {
            return Err(format!("malformed link type '{}'", s));
        }
        let scope = match parts[0] {
            "local" => LinkScope::Local,
            "global" => LinkScope::Global,
            other => return Err(format!("bad scope '{}'", other)),
        };
        let model = match parts[1] {
            "next" => LinkModel::Next,
            "pre" => LinkModel::Pre,
            other => return Err(format!("bad model '{}'", other)),
        };
        let structure = parse_structure(parts[2])?;
        let jump = match parts[3] {
            "step" => LinkJump::Step,
            "jump" => LinkJump::Jump,
            other => return Err(format!("bad jump '{}'", other)),
        };
        Ok(Self {
            scope,
            model,
            structure,
            jump,
        })
    }
}

impl From<LinkType> for String {
    fn from(value: LinkType) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for LinkType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Directed edge between two chunks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkLink {
    pub id: Uuid,
    pub chunk_a: Uuid,
    pub chunk_b: Uuid,
    pub link_type: LinkType,
}

impl ChunkLink {
    /// Build the symmetric `next`/`pre` pair from `from` to `to`.
    ///
    /// Returns `None` when either endpoint is missing, so dangling links are
    /// never materialised.
    pub fn pair(
        from: Option<Uuid>,
        to: Option<Uuid>,
        scope: LinkScope,
        structure: Structure,
        jump: LinkJump,
    ) -> Option<[ChunkLink; 2]> {
        let (from, to) = (from?, to?);
        let next = LinkType {
            scope,
            model: LinkModel::Next,
            structure,
            jump,
        };
        Some([
            ChunkLink {
                id: Uuid::new_v4(),
                chunk_a: from,
                chunk_b: to,
                link_type: next,
            },
            ChunkLink {
                id: Uuid::new_v4(),
                chunk_a: to,
                chunk_b: from,
                link_type: next.reversed(),
            },
        ])
    }
}
