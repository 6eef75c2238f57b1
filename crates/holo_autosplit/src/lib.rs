//! Write-driven chunk auto-splitting for range-sharded collections.
//!
//! The router accumulates the bytes each write batch sends to a chunk. Once a
//! chunk has seen enough writes, `AutoSplitter` asks the owning shard for split
//! points, commits a multi-point split through the versioned sharding client,
//! and optionally asks the balancer to move the new boundary chunk away.
//! Everything is best-effort: a failed auto-split never fails the write that
//! triggered it.
//!
//! Module map:
//! - `key`: shard keys, key patterns and chunk ranges.
//! - `version`: chunk versions (epoch + major/minor).
//! - `chunk` / `routing`: per-chunk write counters and the routing table.
//! - `catalog`: routing table cache with invalidation.
//! - `balancer`: balancer settings and their refresh.
//! - `client`: the sharding collaborator contract and stale-routing errors.
//! - `throttle`: split tickets.
//! - `splitter`: the auto-split decision engine.
//! - `targeter`: per-batch write stats and the write-path entry point.
//! - `memory`: in-memory cluster implementing every collaborator.

pub mod balancer;
pub mod catalog;
pub mod chunk;
pub mod client;
pub mod key;
pub mod memory;
pub mod routing;
pub mod splitter;
pub mod targeter;
pub mod throttle;
pub mod version;

pub use balancer::{BalancerConfiguration, BalancerSettings, BalancerSettingsSource};
pub use catalog::{CatalogCache, CollectionRoutingInfo, NamespaceNotSharded, RoutingTableSource};
pub use chunk::{Chunk, ChunkType, ShardId};
pub use client::{is_stale_sharding_error, ShardingClient, StaleShardVersion};
pub use key::{ChunkRange, KeyField, KeyFieldKind, KeyValue, ShardKey, ShardKeyPattern};
pub use memory::{CallCounts, ClusterOp, InMemoryCluster, InjectedFault};
pub use routing::ChunkManager;
pub use splitter::{
    chunk_size_to_use, extend_to_extreme_key, AutoSplitConfig, AutoSplitOutcome,
    AutoSplitStatsSnapshot, AutoSplitter, TOO_MANY_SPLIT_POINTS,
};
pub use targeter::TargeterStats;
pub use throttle::{AutoSplitThrottle, SplitTicket};
pub use version::ChunkVersion;
