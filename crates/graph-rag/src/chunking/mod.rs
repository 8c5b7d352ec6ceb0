//! Chunk graph construction

mod builder;
mod merge;
pub mod tokens;

pub use builder::{ChunkBuilder, ChunkGraph, ExtractedImage};
pub use merge::{normalize_siblings, MergePolicy};
