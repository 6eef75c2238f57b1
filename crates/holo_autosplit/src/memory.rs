//! In-memory cluster implementing the routing, settings and sharding-client
//! contracts.
//!
//! Used by tests and by the `holo-ctl autosplit-sim` command. Documents are
//! tracked only by shard key and size. Chunk metadata changes follow the
//! same version rules as a real config server:
//! - A split bumps the minor version once per resulting chunk.
//! - A migration bumps the major version of the moved chunk.
//! - Mutations against a changed epoch or range fail with `StaleShardVersion`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;

use crate::balancer::{BalancerSettings, BalancerSettingsSource};
use crate::catalog::{CollectionRoutingInfo, RoutingTableSource};
use crate::chunk::{ChunkType, ShardId};
use crate::client::{ShardingClient, StaleShardVersion};
use crate::key::{ChunkRange, ShardKey, ShardKeyPattern};
use crate::version::ChunkVersion;

/// Cluster operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterOp {
    LoadCollection,
    LoadBalancerSettings,
    SelectSplitPoints,
    SplitChunk,
    FindExtremeKey,
    RebalanceChunk,
    CollectionAllowsBalance,
}

/// A one-shot failure returned by the next call of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InjectedFault {
    /// Fail with `StaleShardVersion`.
    StaleRouting,
    /// Fail with a plain error carrying this message.
    Unavailable(String),
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallCounts {
    pub load_collection: u64,
    pub load_balancer_settings: u64,
    pub select_split_points: u64,
    pub split_chunk: u64,
    pub find_extreme_key: u64,
    pub rebalance_chunk: u64,
    pub collection_allows_balance: u64,
}

#[derive(Default, Debug, Clone, Copy)]
struct DocStats {
    count: u64,
    bytes: u64,
}

struct CollectionState {
    pattern: ShardKeyPattern,
    epoch: u64,
    chunks: BTreeMap<ShardKey, ChunkType>,
    docs: BTreeMap<ShardKey, DocStats>,
    allow_balance: bool,
}

impl CollectionState {
    fn version(&self) -> ChunkVersion {
        self.chunks
            .values()
            .map(|chunk| chunk.version)
            .max_by_key(|version| (version.major, version.minor))
            .unwrap_or_else(ChunkVersion::unsharded)
    }

    fn owner_of(&self, key: &ShardKey) -> Option<&ShardId> {
        self.chunks
            .range(..=key.clone())
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.range.contains_key(key))
            .map(|chunk| &chunk.shard)
    }

    fn docs_in(&self, range: &ChunkRange) -> impl Iterator<Item = (&ShardKey, &DocStats)> {
        self.docs.range(range.min.clone()..range.max.clone())
    }

    fn stale(&self, nss: &str, received: ChunkVersion) -> anyhow::Error {
        StaleShardVersion {
            nss: nss.to_string(),
            wanted: self.version(),
            received,
        }
        .into()
    }
}

struct ClusterState {
    shards: Vec<ShardId>,
    collections: HashMap<String, CollectionState>,
    settings: BalancerSettings,
    faults: HashMap<ClusterOp, VecDeque<InjectedFault>>,
    calls: CallCounts,
    next_epoch: u64,
}

impl ClusterState {
    fn collection(&self, nss: &str) -> anyhow::Result<&CollectionState> {
        self.collections
            .get(nss)
            .ok_or_else(|| anyhow::anyhow!("collection {nss} is not sharded"))
    }

    fn collection_mut(&mut self, nss: &str) -> anyhow::Result<&mut CollectionState> {
        self.collections
            .get_mut(nss)
            .ok_or_else(|| anyhow::anyhow!("collection {nss} is not sharded"))
    }

    /// Count the call and fire the next injected fault for `op`, if any.
    fn enter(&mut self, op: ClusterOp, nss: Option<&str>) -> anyhow::Result<()> {
        let calls = &mut self.calls;
        let counter = match op {
            ClusterOp::LoadCollection => &mut calls.load_collection,
            ClusterOp::LoadBalancerSettings => &mut calls.load_balancer_settings,
            ClusterOp::SelectSplitPoints => &mut calls.select_split_points,
            ClusterOp::SplitChunk => &mut calls.split_chunk,
            ClusterOp::FindExtremeKey => &mut calls.find_extreme_key,
            ClusterOp::RebalanceChunk => &mut calls.rebalance_chunk,
            ClusterOp::CollectionAllowsBalance => &mut calls.collection_allows_balance,
        };
        *counter += 1;

        let Some(fault) = self.faults.get_mut(&op).and_then(VecDeque::pop_front) else {
            return Ok(());
        };
        match fault {
            InjectedFault::StaleRouting => {
                let nss = nss.unwrap_or_default();
                let wanted = self
                    .collections
                    .get(nss)
                    .map(CollectionState::version)
                    .unwrap_or_else(ChunkVersion::unsharded);
                Err(StaleShardVersion {
                    nss: nss.to_string(),
                    wanted,
                    received: ChunkVersion::unsharded(),
                }
                .into())
            }
            InjectedFault::Unavailable(message) => Err(anyhow::anyhow!(message)),
        }
    }
}

pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

impl InMemoryCluster {
    pub fn new(shards: Vec<ShardId>, settings: BalancerSettings) -> Self {
        Self {
            state: Mutex::new(ClusterState {
                shards,
                collections: HashMap::new(),
                settings,
                faults: HashMap::new(),
                calls: CallCounts::default(),
                next_epoch: 1,
            }),
        }
    }

    fn state(&self) -> anyhow::Result<MutexGuard<'_, ClusterState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("in-memory cluster lock poisoned"))
    }

    /// Shard `nss` on `pattern` with chunk boundaries at `split_at`.
    ///
    /// Chunks are assigned to shards round-robin, starting at the first shard.
    pub fn shard_collection(
        &self,
        nss: &str,
        pattern: ShardKeyPattern,
        split_at: &[ShardKey],
    ) -> anyhow::Result<ChunkVersion> {
        let mut state = self.state()?;
        if state.shards.is_empty() {
            anyhow::bail!("cannot shard {nss} on a cluster without shards");
        }
        if state.collections.contains_key(nss) {
            anyhow::bail!("collection {nss} is already sharded");
        }
        let epoch = state.next_epoch;
        state.next_epoch += 1;

        let mut bounds = Vec::with_capacity(split_at.len() + 2);
        bounds.push(pattern.global_min());
        bounds.extend(split_at.iter().cloned());
        bounds.push(pattern.global_max());

        let mut chunks = BTreeMap::new();
        let mut version = ChunkVersion::new(1, 0, epoch);
        for (idx, window) in bounds.windows(2).enumerate() {
            let range = ChunkRange::new(window[0].clone(), window[1].clone())?;
            let shard = state.shards[idx % state.shards.len()].clone();
            chunks.insert(
                range.min.clone(),
                ChunkType {
                    range,
                    shard,
                    version,
                    jumbo: false,
                },
            );
            version.inc_minor()?;
        }

        let collection = CollectionState {
            pattern,
            epoch,
            chunks,
            docs: BTreeMap::new(),
            allow_balance: true,
        };
        let created = collection.version();
        state.collections.insert(nss.to_string(), collection);
        tracing::debug!(nss, version = %created, "sharded collection");
        Ok(created)
    }

    /// Store a document of `bytes` size and return its shard key.
    pub fn insert(&self, nss: &str, doc: &serde_json::Value, bytes: u64) -> anyhow::Result<ShardKey> {
        let key = {
            let state = self.state()?;
            let collection = state.collection(nss)?;
            collection
                .pattern
                .extract_key_from_doc(doc)
                .ok_or_else(|| anyhow::anyhow!("document is missing shard key {}", collection.pattern))?
        };
        self.insert_key(nss, key.clone(), bytes)?;
        Ok(key)
    }

    /// Store a document with shard key `key` and size `bytes`.
    pub fn insert_key(&self, nss: &str, key: ShardKey, bytes: u64) -> anyhow::Result<()> {
        let mut state = self.state()?;
        let collection = state.collection_mut(nss)?;
        if key.values().len() != collection.pattern.fields().len() {
            anyhow::bail!("shard key {key} does not match pattern {}", collection.pattern);
        }
        let stats = collection.docs.entry(key).or_default();
        stats.count += 1;
        stats.bytes += bytes;
        Ok(())
    }

    pub fn chunks(&self, nss: &str) -> anyhow::Result<Vec<ChunkType>> {
        let state = self.state()?;
        Ok(state.collection(nss)?.chunks.values().cloned().collect())
    }

    pub fn collection_version(&self, nss: &str) -> anyhow::Result<ChunkVersion> {
        let state = self.state()?;
        Ok(state.collection(nss)?.version())
    }

    /// Number of chunks owned by each shard, including shards with none.
    pub fn chunk_counts_by_shard(&self, nss: &str) -> anyhow::Result<BTreeMap<ShardId, usize>> {
        let state = self.state()?;
        let collection = state.collection(nss)?;
        let mut counts: BTreeMap<ShardId, usize> =
            state.shards.iter().map(|shard| (shard.clone(), 0)).collect();
        for chunk in collection.chunks.values() {
            *counts.entry(chunk.shard.clone()).or_default() += 1;
        }
        Ok(counts)
    }

    pub fn set_allow_balance(&self, nss: &str, allow: bool) -> anyhow::Result<()> {
        let mut state = self.state()?;
        state.collection_mut(nss)?.allow_balance = allow;
        Ok(())
    }

    pub fn set_balancer_settings(&self, settings: BalancerSettings) -> anyhow::Result<()> {
        self.state()?.settings = settings;
        Ok(())
    }

    /// Make the next call of `op` fail with `fault`. Faults queue up per op.
    pub fn inject_fault(&self, op: ClusterOp, fault: InjectedFault) -> anyhow::Result<()> {
        self.state()?.faults.entry(op).or_default().push_back(fault);
        Ok(())
    }

    pub fn call_counts(&self) -> anyhow::Result<CallCounts> {
        Ok(self.state()?.calls)
    }
}

#[async_trait]
impl RoutingTableSource for InMemoryCluster {
    async fn load_collection(&self, nss: &str) -> anyhow::Result<Option<CollectionRoutingInfo>> {
        let mut state = self.state()?;
        state.enter(ClusterOp::LoadCollection, Some(nss))?;
        Ok(state.collections.get(nss).map(|collection| CollectionRoutingInfo {
            shard_key_pattern: collection.pattern.clone(),
            chunks: collection.chunks.values().cloned().collect(),
        }))
    }
}

#[async_trait]
impl BalancerSettingsSource for InMemoryCluster {
    async fn load_balancer_settings(&self) -> anyhow::Result<BalancerSettings> {
        let mut state = self.state()?;
        state.enter(ClusterOp::LoadBalancerSettings, None)?;
        Ok(state.settings)
    }
}

#[async_trait]
impl ShardingClient for InMemoryCluster {
    async fn select_chunk_split_points(
        &self,
        shard: &ShardId,
        nss: &str,
        _pattern: &ShardKeyPattern,
        range: &ChunkRange,
        chunk_size_bytes: u64,
    ) -> anyhow::Result<Vec<ShardKey>> {
        let mut state = self.state()?;
        state.enter(ClusterOp::SelectSplitPoints, Some(nss))?;
        let collection = state.collection(nss)?;
        if collection.owner_of(&range.min) != Some(shard) {
            anyhow::bail!("shard {shard} does not own {nss} {range}");
        }

        // A split key every half chunk of data, like the split-vector command.
        let step = (chunk_size_bytes / 2).max(1);
        let mut points = Vec::new();
        let mut accumulated = 0u64;
        for (key, stats) in collection.docs_in(range) {
            if accumulated >= step && range.is_strictly_inside(key) {
                points.push(key.clone());
                accumulated = 0;
            }
            accumulated += stats.bytes;
        }
        Ok(points)
    }

    async fn split_chunk_at_multiple_points(
        &self,
        shard: &ShardId,
        nss: &str,
        _pattern: &ShardKeyPattern,
        collection_version: ChunkVersion,
        range: &ChunkRange,
        split_points: &[ShardKey],
    ) -> anyhow::Result<Option<ChunkRange>> {
        let mut state = self.state()?;
        state.enter(ClusterOp::SplitChunk, Some(nss))?;
        let collection = state.collection_mut(nss)?;

        if collection.epoch != collection_version.epoch {
            return Err(collection.stale(nss, collection_version));
        }
        let Some(existing) = collection.chunks.get(&range.min).cloned() else {
            return Err(collection.stale(nss, collection_version));
        };
        if existing.range != *range || existing.shard != *shard {
            return Err(collection.stale(nss, collection_version));
        }
        if split_points.is_empty() {
            anyhow::bail!("split of {nss} {range} needs at least one split point");
        }
        for window in split_points.windows(2) {
            if window[0] >= window[1] {
                anyhow::bail!("split points for {nss} {range} are not strictly ascending");
            }
        }
        if !split_points.iter().all(|point| range.is_strictly_inside(point)) {
            anyhow::bail!("split points for {nss} must fall strictly inside {range}");
        }

        let mut version = collection.version();
        let mut bounds = Vec::with_capacity(split_points.len() + 2);
        bounds.push(range.min.clone());
        bounds.extend(split_points.iter().cloned());
        bounds.push(range.max.clone());
        let mut pieces = Vec::with_capacity(bounds.len() - 1);
        for window in bounds.windows(2) {
            version.inc_minor()?;
            let piece = ChunkType {
                range: ChunkRange::new(window[0].clone(), window[1].clone())?,
                shard: existing.shard.clone(),
                version,
                jumbo: false,
            };
            collection.chunks.insert(piece.range.min.clone(), piece.clone());
            pieces.push(piece.range);
        }

        let single_doc = |piece: &ChunkRange| {
            collection
                .docs_in(piece)
                .map(|(_, stats)| stats.count)
                .sum::<u64>()
                == 1
        };
        let global_max = collection.pattern.global_max();
        let global_min = collection.pattern.global_min();
        let suggested = match (pieces.first(), pieces.last()) {
            (_, Some(back)) if back.max == global_max && single_doc(back) => Some(back.clone()),
            (Some(front), _) if front.min == global_min && single_doc(front) => Some(front.clone()),
            _ => None,
        };
        tracing::debug!(
            nss,
            range = %range,
            parts = pieces.len(),
            version = %version,
            "committed chunk split"
        );
        Ok(suggested)
    }

    async fn find_extreme_key_for_shard(
        &self,
        nss: &str,
        shard: &ShardId,
        _pattern: &ShardKeyPattern,
        want_lowest: bool,
    ) -> anyhow::Result<Option<ShardKey>> {
        let mut state = self.state()?;
        state.enter(ClusterOp::FindExtremeKey, Some(nss))?;
        let collection = state.collection(nss)?;
        let mut on_shard = collection
            .docs
            .iter()
            .filter(|(key, _)| collection.owner_of(key) == Some(shard));

        if want_lowest {
            // Skip one document so the lower piece ends up with exactly one.
            let mut skip = 1u64;
            for (key, stats) in on_shard {
                if stats.count > skip {
                    return Ok(Some(key.clone()));
                }
                skip -= stats.count.min(skip);
            }
            Ok(None)
        } else {
            Ok(on_shard.next_back().map(|(key, _)| key.clone()))
        }
    }

    async fn rebalance_chunk(&self, nss: &str, chunk: &ChunkType) -> anyhow::Result<()> {
        let mut state = self.state()?;
        state.enter(ClusterOp::RebalanceChunk, Some(nss))?;
        let shards = state.shards.clone();
        let collection = state.collection_mut(nss)?;

        let Some(current) = collection.chunks.get(&chunk.range.min).cloned() else {
            return Err(collection.stale(nss, chunk.version));
        };
        if current.range != chunk.range || !current.version.is_strictly_equal_to(&chunk.version) {
            return Err(collection.stale(nss, chunk.version));
        }

        let mut loads: BTreeMap<&ShardId, usize> = shards.iter().map(|shard| (shard, 0)).collect();
        for owned in collection.chunks.values() {
            if let Some(load) = loads.get_mut(&owned.shard) {
                *load += 1;
            }
        }
        let Some(target) = loads
            .into_iter()
            .filter(|(shard, _)| **shard != current.shard)
            .min_by_key(|(_, load)| *load)
            .map(|(shard, _)| shard.clone())
        else {
            tracing::debug!(nss, chunk = %chunk.range, "no other shard to move chunk to");
            return Ok(());
        };

        let mut version = collection.version();
        version.inc_major()?;
        if let Some(moved) = collection.chunks.get_mut(&chunk.range.min) {
            moved.shard = target.clone();
            moved.version = version;
        }
        tracing::info!(
            nss,
            chunk = %chunk.range,
            from = %current.shard,
            to = %target,
            version = %version,
            "moved chunk"
        );
        Ok(())
    }

    async fn collection_allows_balance(&self, nss: &str) -> anyhow::Result<bool> {
        let mut state = self.state()?;
        state.enter(ClusterOp::CollectionAllowsBalance, Some(nss))?;
        Ok(state.collection(nss)?.allow_balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NSS: &str = "db.coll";

    fn cluster() -> InMemoryCluster {
        let cluster = InMemoryCluster::new(
            vec!["s0".to_string(), "s1".to_string()],
            BalancerSettings::default(),
        );
        cluster
            .shard_collection(NSS, ShardKeyPattern::ascending(&["a"]).expect("pattern"), &[])
            .expect("shard collection");
        cluster
    }

    fn whole_range() -> ChunkRange {
        let pattern = ShardKeyPattern::ascending(&["a"]).expect("pattern");
        ChunkRange::new(pattern.global_min(), pattern.global_max()).expect("range")
    }

    #[tokio::test]
    async fn split_points_every_half_chunk() {
        let cluster = cluster();
        for i in 0..10 {
            cluster.insert_key(NSS, ShardKey::int(i), 100).expect("insert");
        }
        let pattern = ShardKeyPattern::ascending(&["a"]).expect("pattern");
        let points = cluster
            .select_chunk_split_points(&"s0".to_string(), NSS, &pattern, &whole_range(), 400)
            .await
            .expect("split points");
        assert_eq!(points, vec![ShardKey::int(2), ShardKey::int(4), ShardKey::int(6), ShardKey::int(8)]);
    }

    #[tokio::test]
    async fn split_bumps_minor_and_suggests_single_doc_top_chunk() {
        let cluster = cluster();
        for i in 0..10 {
            cluster.insert_key(NSS, ShardKey::int(i), 100).expect("insert");
        }
        let pattern = ShardKeyPattern::ascending(&["a"]).expect("pattern");
        let before = cluster.collection_version(NSS).expect("version");
        let suggested = cluster
            .split_chunk_at_multiple_points(
                &"s0".to_string(),
                NSS,
                &pattern,
                before,
                &whole_range(),
                &[ShardKey::int(5), ShardKey::int(9)],
            )
            .await
            .expect("split");
        assert_eq!(
            suggested,
            Some(ChunkRange::new(ShardKey::int(9), pattern.global_max()).expect("range"))
        );
        let after = cluster.collection_version(NSS).expect("version");
        assert_eq!(after, ChunkVersion::new(before.major, before.minor + 3, before.epoch));
        assert_eq!(cluster.chunks(NSS).expect("chunks").len(), 3);

        // The old range no longer exists: a second attempt is stale.
        let err = cluster
            .split_chunk_at_multiple_points(
                &"s0".to_string(),
                NSS,
                &pattern,
                after,
                &whole_range(),
                &[ShardKey::int(3)],
            )
            .await
            .expect_err("stale split");
        assert!(crate::client::is_stale_sharding_error(&err));
    }

    #[tokio::test]
    async fn extreme_key_skips_lowest_document() {
        let cluster = cluster();
        for i in [3, 7, 11] {
            cluster.insert_key(NSS, ShardKey::int(i), 10).expect("insert");
        }
        let pattern = ShardKeyPattern::ascending(&["a"]).expect("pattern");
        let s0 = "s0".to_string();
        let lowest = cluster
            .find_extreme_key_for_shard(NSS, &s0, &pattern, true)
            .await
            .expect("lowest");
        assert_eq!(lowest, Some(ShardKey::int(7)));
        let highest = cluster
            .find_extreme_key_for_shard(NSS, &s0, &pattern, false)
            .await
            .expect("highest");
        assert_eq!(highest, Some(ShardKey::int(11)));
        let none = cluster
            .find_extreme_key_for_shard(NSS, &"s1".to_string(), &pattern, true)
            .await
            .expect("empty shard");
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn rebalance_moves_chunk_with_major_bump() {
        let cluster = cluster();
        let chunk = cluster.chunks(NSS).expect("chunks").remove(0);
        cluster.rebalance_chunk(NSS, &chunk).await.expect("rebalance");
        let moved = cluster.chunks(NSS).expect("chunks").remove(0);
        assert_eq!(moved.shard, "s1");
        assert_eq!(moved.version.major, chunk.version.major + 1);
        assert_eq!(moved.version.minor, 0);

        // The old descriptor is now stale.
        let err = cluster.rebalance_chunk(NSS, &chunk).await.expect_err("stale");
        assert!(crate::client::is_stale_sharding_error(&err));
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let cluster = cluster();
        cluster
            .inject_fault(ClusterOp::LoadCollection, InjectedFault::Unavailable("down".into()))
            .expect("inject");
        assert!(cluster.load_collection(NSS).await.is_err());
        assert!(cluster.load_collection(NSS).await.expect("load").is_some());
        assert_eq!(cluster.call_counts().expect("counts").load_collection, 2);
    }
}
