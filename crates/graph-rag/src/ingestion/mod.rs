//! Document ingestion: multi-format parsing into structural trees

mod converter;
mod images;
mod markup;
mod office;
pub mod parse_tree;
mod parser;
mod pdf;
mod structured;

pub use converter::OfficeConverter;
pub use images::ImageResolver;
pub use parse_tree::{Block, NodeTopology, NodeType, ParseNode, ParseResult, ResultTopology};
pub use parser::{content_hash, DocumentParser};
