//! Chunk geometry and content addressing for chunked uploads.
//!
//! Pure building blocks: [`ChunkPlan`] decides how a file is split,
//! [`Etag`] identifies a chunk's content for deduplication.

mod etag;
mod plan;

pub use etag::{Etag, EtagParseError};
pub use plan::ChunkPlan;
