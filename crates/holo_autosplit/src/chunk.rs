//! Chunks as seen by the router: range, owner, version and a write counter.
//!
//! The write counter is best-effort and router-local. Every write batch that
//! touches a chunk adds its estimated size; the counter is reset whenever a
//! split decision is made for the chunk.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::key::{ChunkRange, ShardKey};
use crate::version::ChunkVersion;

/// Name of the shard that owns a chunk.
pub type ShardId = String;

/// A split is considered once a chunk has seen roughly `1 / SPLIT_TEST_FACTOR`
/// of its split threshold in writes.
pub const SPLIT_TEST_FACTOR: u64 = 5;

/// Persisted chunk metadata, as stored by the config server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkType {
    pub range: ChunkRange,
    pub shard: ShardId,
    pub version: ChunkVersion,
    #[serde(default)]
    pub jumbo: bool,
}

/// Router-side chunk with its running write counter.
#[derive(Debug)]
pub struct Chunk {
    range: ChunkRange,
    shard_id: ShardId,
    lastmod: ChunkVersion,
    jumbo: bool,
    bytes_written: AtomicU64,
}

impl Chunk {
    pub fn new(desc: ChunkType) -> Self {
        Self {
            range: desc.range,
            shard_id: desc.shard,
            lastmod: desc.version,
            jumbo: desc.jumbo,
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn min(&self) -> &ShardKey {
        &self.range.min
    }

    pub fn max(&self) -> &ShardKey {
        &self.range.max
    }

    pub fn range(&self) -> &ChunkRange {
        &self.range
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn lastmod(&self) -> ChunkVersion {
        self.lastmod
    }

    pub fn is_jumbo(&self) -> bool {
        self.jumbo
    }

    /// Add `bytes` to the counter and return the new total.
    pub fn add_bytes_written(&self, bytes: u64) -> u64 {
        self.bytes_written
            .fetch_add(bytes, Ordering::Relaxed)
            .saturating_add(bytes)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn clear_bytes_written(&self) {
        self.bytes_written.store(0, Ordering::Relaxed);
    }

    /// Whether enough has been written to this chunk to look for split points.
    ///
    /// Open-ended chunks (first or last in the collection) use 90% of the
    /// desired chunk size, since they tend to absorb monotonic inserts. Jumbo
    /// chunks are never split automatically.
    pub fn should_split(&self, desired_chunk_size: u64, min_is_inf: bool, max_is_inf: bool) -> bool {
        if self.is_jumbo() {
            return false;
        }
        let split_threshold = if min_is_inf || max_is_inf {
            desired_chunk_size.saturating_mul(9) / 10
        } else {
            desired_chunk_size
        };
        self.bytes_written() >= split_threshold / SPLIT_TEST_FACTOR
    }

    /// Persisted form of this chunk (without the write counter).
    pub fn descriptor(&self) -> ChunkType {
        ChunkType {
            range: self.range.clone(),
            shard: self.shard_id.clone(),
            version: self.lastmod,
            jumbo: self.jumbo,
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shard: {}, lastmod: {}, range: {}",
            self.shard_id, self.lastmod, self.range
        )
    }
}
