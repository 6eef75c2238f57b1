//! Shared helpers for auto-split integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use holo_autosplit::{
    AutoSplitConfig, AutoSplitter, BalancerConfiguration, BalancerSettings, CatalogCache,
    ChunkManager, InMemoryCluster, ShardKey, ShardKeyPattern,
};

pub const NSS: &str = "test.users";
pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// In-memory cluster plus an auto-splitter wired to it.
pub struct Harness {
    pub cluster: Arc<InMemoryCluster>,
    pub catalog: Arc<CatalogCache>,
    pub splitter: Arc<AutoSplitter>,
}

impl Harness {
    /// Two shards, `NSS` sharded on `{ a: 1 }` with chunk bounds at `split_at`.
    pub fn new(settings: BalancerSettings, max_concurrent_splits: usize, split_at: &[i64]) -> Self {
        Self::with_pattern(settings, max_concurrent_splits, pattern(), split_at)
    }

    /// Same layout as `new`, sharded on `shard_key`.
    pub fn with_pattern(
        settings: BalancerSettings,
        max_concurrent_splits: usize,
        shard_key: ShardKeyPattern,
        split_at: &[i64],
    ) -> Self {
        let cluster = Arc::new(InMemoryCluster::new(
            vec!["shard0".to_string(), "shard1".to_string()],
            settings,
        ));
        let split_at = split_at.iter().map(|v| ShardKey::int(*v)).collect::<Vec<_>>();
        cluster
            .shard_collection(NSS, shard_key, &split_at)
            .expect("shard collection");

        let catalog = Arc::new(CatalogCache::new(cluster.clone()));
        let balancer = Arc::new(BalancerConfiguration::with_settings(cluster.clone(), settings));
        let splitter = Arc::new(AutoSplitter::new(
            balancer,
            catalog.clone(),
            cluster.clone(),
            AutoSplitConfig {
                max_concurrent_splits,
            },
        ));
        Self {
            cluster,
            catalog,
            splitter,
        }
    }

    pub async fn routing(&self) -> Arc<ChunkManager> {
        self.catalog
            .get_collection_routing_info(NSS)
            .await
            .expect("routing info")
            .expect("sharded collection")
    }

    /// Insert `count` documents of `doc_bytes` with keys `first..first + count`.
    pub fn insert_range(&self, first: i64, count: i64, doc_bytes: u64) {
        for key in first..first + count {
            self.cluster
                .insert_key(NSS, ShardKey::int(key), doc_bytes)
                .expect("insert");
        }
    }
}

pub fn pattern() -> ShardKeyPattern {
    ShardKeyPattern::ascending(&["a"]).expect("pattern")
}

/// 1 MiB chunks, auto-split on, balancing for auto-split as given.
pub fn small_chunk_settings(balance_for_auto_split: bool) -> BalancerSettings {
    BalancerSettings {
        max_chunk_size_bytes: MIB,
        should_auto_split: true,
        balance_for_auto_split,
    }
}
