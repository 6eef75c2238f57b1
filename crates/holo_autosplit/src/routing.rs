//! Router-side routing table for one sharded collection.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::chunk::{Chunk, ChunkType};
use crate::key::{ShardKey, ShardKeyPattern};
use crate::version::ChunkVersion;

/// Ordered set of chunks covering the whole key space of a collection.
///
/// Chunks are keyed by their min key, must be contiguous, must start at the
/// pattern's global min and end at its global max, and must share one epoch.
#[derive(Debug)]
pub struct ChunkManager {
    nss: String,
    shard_key_pattern: ShardKeyPattern,
    chunks: BTreeMap<ShardKey, Arc<Chunk>>,
    version: ChunkVersion,
}

impl ChunkManager {
    pub fn new(
        nss: impl Into<String>,
        shard_key_pattern: ShardKeyPattern,
        mut chunks: Vec<ChunkType>,
    ) -> anyhow::Result<Self> {
        let nss = nss.into();
        if chunks.is_empty() {
            anyhow::bail!("routing table for {nss} has no chunks");
        }
        chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));

        let global_min = shard_key_pattern.global_min();
        let global_max = shard_key_pattern.global_max();
        let epoch = chunks[0].version.epoch;
        let mut expected_min = global_min;
        let mut version = chunks[0].version;
        for chunk in &chunks {
            if chunk.range.min != expected_min {
                anyhow::bail!(
                    "routing table for {nss} has a gap or overlap at {}: expected min {expected_min}",
                    chunk.range
                );
            }
            if chunk.version.epoch != epoch {
                anyhow::bail!(
                    "routing table for {nss} mixes epochs {epoch} and {}",
                    chunk.version.epoch
                );
            }
            if (chunk.version.major, chunk.version.minor) > (version.major, version.minor) {
                version = chunk.version;
            }
            expected_min = chunk.range.max.clone();
        }
        if expected_min != global_max {
            anyhow::bail!("routing table for {nss} ends at {expected_min} instead of {global_max}");
        }

        let chunks = chunks
            .into_iter()
            .map(|desc| (desc.range.min.clone(), Arc::new(Chunk::new(desc))))
            .collect();
        Ok(Self {
            nss,
            shard_key_pattern,
            chunks,
            version,
        })
    }

    pub fn nss(&self) -> &str {
        &self.nss
    }

    pub fn shard_key_pattern(&self) -> &ShardKeyPattern {
        &self.shard_key_pattern
    }

    /// Collection version: the highest chunk version in the table.
    pub fn version(&self) -> ChunkVersion {
        self.version
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Chunks in key order.
    pub fn chunks(&self) -> impl Iterator<Item = &Arc<Chunk>> {
        self.chunks.values()
    }

    /// Chunk whose range contains `key`.
    pub fn find_intersecting_chunk(&self, key: &ShardKey) -> anyhow::Result<Arc<Chunk>> {
        let found = self
            .chunks
            .range(..=key.clone())
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.range().contains_key(key));
        match found {
            Some(chunk) => Ok(chunk.clone()),
            None => anyhow::bail!("no chunk in {} contains key {key}", self.nss),
        }
    }

    /// Seed write counters from the table this one replaces. Chunks whose
    /// range is unchanged and that did not move keep accumulating; new or
    /// migrated chunks start at zero.
    pub fn carry_over_write_stats(&self, previous: &ChunkManager) {
        for (min, chunk) in &self.chunks {
            if let Some(old) = previous.chunks.get(min) {
                if old.range() == chunk.range()
                    && old.lastmod().is_write_compatible_with(&chunk.lastmod())
                {
                    chunk.add_bytes_written(old.bytes_written());
                }
            }
        }
    }
}
