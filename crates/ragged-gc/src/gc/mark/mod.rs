//! Mark bitmaps: the per-cycle arena and the per-span view into it.

mod arena;
mod bitmap;

pub use arena::{MarkArena, CHUNK_WORDS, MAX_SPAN_WORDS};
pub use bitmap::MarkBits;
