//! LRU cache for decoded input chunks.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::CacheStats;

/// Cache key: TIFF chunk (strip or tile) index within one band reader.
pub type ChunkKey = u32;

/// Entry ceiling when the memory limit would allow an absurd count.
const MAX_ENTRIES: usize = 65_536;

/// LRU cache of decoded single-band chunks with memory-bounded eviction.
pub struct ChunkCache {
    cache: LruCache<ChunkKey, Vec<f32>>,
    memory_limit: usize,
    current_memory: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ChunkCache {
    /// Create a new chunk cache with the given memory limit in bytes.
    pub fn new(memory_limit: usize) -> Self {
        // Orthophoto strips are small; assume ~64KB decoded per chunk.
        let chunk_size_estimate = 64 * 1024;
        let max_entries = (memory_limit / chunk_size_estimate).clamp(16, MAX_ENTRIES);

        Self {
            cache: LruCache::new(NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN)),
            memory_limit,
            current_memory: 0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Try to get a chunk from the cache.
    ///
    /// Returns `Some(data)` if found (cache hit), `None` if not found (cache miss).
    pub fn get(&mut self, key: &ChunkKey) -> Option<&Vec<f32>> {
        if let Some(data) = self.cache.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(data)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Check if a key exists in the cache without updating LRU order.
    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.cache.contains(key)
    }

    /// Insert a chunk into the cache.
    ///
    /// If the cache is at capacity, the least recently used entries
    /// will be evicted to make room.
    pub fn insert(&mut self, key: ChunkKey, data: Vec<f32>) {
        let data_size = data.len() * std::mem::size_of::<f32>();

        while self.current_memory + data_size > self.memory_limit && !self.cache.is_empty() {
            if let Some((_, evicted)) = self.cache.pop_lru() {
                self.release(&evicted);
            }
        }

        if data_size <= self.memory_limit {
            // A full entry-count cache drops its LRU entry on put.
            if let Some((_, evicted)) = self.cache.push(key, data) {
                self.release(&evicted);
            }
            self.current_memory += data_size;
        }
    }

    fn release(&mut self, evicted: &[f32]) {
        let evicted_size = std::mem::size_of_val(evicted);
        self.current_memory = self.current_memory.saturating_sub(evicted_size);
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.len(),
            memory_bytes: self.current_memory as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Clear all entries from the cache.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.current_memory = 0;
    }

    /// Get the current memory usage in bytes.
    pub fn memory_usage(&self) -> usize {
        self.current_memory
    }

    /// Get the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
