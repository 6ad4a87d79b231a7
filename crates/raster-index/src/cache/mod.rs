//! Cache implementations for input decoding.

mod chunk_cache;

pub use chunk_cache::{ChunkCache, ChunkKey};
