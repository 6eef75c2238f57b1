//! Sharding operations the auto-splitter delegates to shards and the config
//! server, plus the stale-routing error they report.

use std::fmt;

use async_trait::async_trait;

use crate::chunk::{ChunkType, ShardId};
use crate::key::{ChunkRange, ShardKey, ShardKeyPattern};
use crate::version::ChunkVersion;

/// Remote sharding operations used by `AutoSplitter`.
///
/// Implementations are expected to enforce versioning on mutations: a split
/// or migration against stale routing information must fail with
/// `StaleShardVersion` rather than change chunk boundaries.
#[async_trait]
pub trait ShardingClient: Send + Sync + 'static {
    /// Ask `shard` for split points in `range`, aiming at chunks of
    /// `chunk_size_bytes`. Points come back in ascending key order.
    async fn select_chunk_split_points(
        &self,
        shard: &ShardId,
        nss: &str,
        pattern: &ShardKeyPattern,
        range: &ChunkRange,
        chunk_size_bytes: u64,
    ) -> anyhow::Result<Vec<ShardKey>>;

    /// Split `range` at `split_points` if the collection is still at
    /// `collection_version`'s epoch and the range is still one chunk.
    /// Returns an optional chunk the balancer should move away.
    async fn split_chunk_at_multiple_points(
        &self,
        shard: &ShardId,
        nss: &str,
        pattern: &ShardKeyPattern,
        collection_version: ChunkVersion,
        range: &ChunkRange,
        split_points: &[ShardKey],
    ) -> anyhow::Result<Option<ChunkRange>>;

    /// Lowest (or highest) shard key stored on `shard` for `nss`.
    async fn find_extreme_key_for_shard(
        &self,
        nss: &str,
        shard: &ShardId,
        pattern: &ShardKeyPattern,
        want_lowest: bool,
    ) -> anyhow::Result<Option<ShardKey>>;

    /// Ask the balancer to move `chunk` to a better shard.
    async fn rebalance_chunk(&self, nss: &str, chunk: &ChunkType) -> anyhow::Result<()>;

    /// Whether the balancer may move chunks of `nss`.
    async fn collection_allows_balance(&self, nss: &str) -> anyhow::Result<bool>;
}

/// The caller's routing information for `nss` is older than the shard's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleShardVersion {
    pub nss: String,
    pub wanted: ChunkVersion,
    pub received: ChunkVersion,
}

impl fmt::Display for StaleShardVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stale shard version for {}: wanted {}, received {}",
            self.nss, self.wanted, self.received
        )
    }
}

impl std::error::Error for StaleShardVersion {}

/// True if any error in the chain is a stale-routing error.
pub fn is_stale_sharding_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<StaleShardVersion>().is_some())
}
