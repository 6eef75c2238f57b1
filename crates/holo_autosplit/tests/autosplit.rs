//! Auto-split decision tests against the in-memory cluster.
//!
//! Chunks are 1 MiB and documents 64 KiB, so the shard proposes a split point
//! every 8 documents.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{small_chunk_settings, Harness, KIB, MIB, NSS};
use holo_autosplit::{
    AutoSplitConfig, AutoSplitOutcome, AutoSplitter, BalancerConfiguration, ChunkManager,
    ChunkRange, ChunkType, ChunkVersion, ClusterOp, InMemoryCluster, InjectedFault,
    NamespaceNotSharded, ShardId, ShardKey, ShardKeyPattern, ShardingClient, TargeterStats,
};

const DOC_BYTES: u64 = 64 * KIB;

#[tokio::test]
async fn small_writes_accumulate_without_splitting() {
    let h = Harness::new(small_chunk_settings(false), 5, &[]);
    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(0))
        .expect("chunk");

    let mut last = 0;
    for _ in 0..5 {
        let outcome = h
            .splitter
            .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 10_000)
            .await;
        assert_eq!(outcome, AutoSplitOutcome::BelowThreshold);
        assert!(chunk.bytes_written() > last);
        last = chunk.bytes_written();
    }
    assert_eq!(last, 50_000);
    let calls = h.cluster.call_counts().expect("calls");
    assert_eq!(calls.select_split_points, 0);
    assert_eq!(calls.load_balancer_settings, 0);
}

#[tokio::test]
async fn one_split_point_resets_counter_without_splitting() {
    let h = Harness::new(small_chunk_settings(false), 5, &[0, 1000]);
    h.insert_range(0, 10, DOC_BYTES);
    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(5))
        .expect("chunk");
    assert_eq!(chunk.shard_id(), "shard1");

    let outcome = h
        .splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 300 * KIB)
        .await;
    assert_eq!(outcome, AutoSplitOutcome::NotEnoughSplitPoints);
    assert_eq!(chunk.bytes_written(), 0);

    let calls = h.cluster.call_counts().expect("calls");
    assert_eq!(calls.select_split_points, 1);
    assert_eq!(calls.split_chunk, 0);
    assert_eq!(h.cluster.chunks(NSS).expect("chunks").len(), 3);
}

#[tokio::test]
async fn lowest_open_ended_chunk_splits_at_the_data_edge() {
    let h = Harness::new(small_chunk_settings(false), 5, &[1000]);
    h.insert_range(0, 40, DOC_BYTES);
    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(0))
        .expect("chunk");
    let before = h.cluster.collection_version(NSS).expect("version");

    let outcome = h
        .splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 300 * KIB)
        .await;
    let global_min = routing.shard_key_pattern().global_min();
    assert_eq!(
        outcome,
        AutoSplitOutcome::Split {
            parts: 5,
            suggested_migration: Some(
                ChunkRange::new(global_min.clone(), ShardKey::int(1)).expect("range")
            ),
            migrated: false,
        }
    );

    let chunks = h.cluster.chunks(NSS).expect("chunks");
    let bounds = chunks
        .iter()
        .map(|c| c.range.max.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        &bounds[..5],
        &[
            ShardKey::int(1),
            ShardKey::int(16),
            ShardKey::int(24),
            ShardKey::int(32),
            ShardKey::int(1000)
        ]
    );
    assert!(bounds.windows(2).all(|w| w[0] < w[1]));
    assert!(before.is_older_than(&h.cluster.collection_version(NSS).expect("version")));

    // Open-ended chunks keep their counter so the next write re-checks.
    assert_eq!(chunk.bytes_written(), 300 * KIB);
    assert_eq!(h.cluster.call_counts().expect("calls").rebalance_chunk, 0);
}

#[tokio::test]
async fn bounded_chunk_split_resets_the_counter() {
    let h = Harness::new(small_chunk_settings(true), 5, &[0, 1000]);
    h.insert_range(0, 40, DOC_BYTES);
    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(5))
        .expect("chunk");

    let outcome = h
        .splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 300 * KIB)
        .await;
    assert_eq!(
        outcome,
        AutoSplitOutcome::Split {
            parts: 5,
            suggested_migration: None,
            migrated: false,
        }
    );
    assert_eq!(chunk.bytes_written(), 0);

    let calls = h.cluster.call_counts().expect("calls");
    assert_eq!(calls.find_extreme_key, 0);
    assert_eq!(calls.rebalance_chunk, 0);
    let bounds = h
        .cluster
        .chunks(NSS)
        .expect("chunks")
        .iter()
        .map(|c| c.range.max.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        &bounds[1..6],
        &[
            ShardKey::int(8),
            ShardKey::int(16),
            ShardKey::int(24),
            ShardKey::int(32),
            ShardKey::int(1000)
        ]
    );
}

#[tokio::test]
async fn hashed_open_ended_chunk_keeps_shard_split_points() {
    let h = Harness::with_pattern(
        small_chunk_settings(false),
        5,
        ShardKeyPattern::hashed("a").expect("pattern"),
        &[],
    );
    // Keys stand in for already hashed values.
    h.insert_range(0, 40, DOC_BYTES);
    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(0))
        .expect("chunk");

    let outcome = h
        .splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 300 * KIB)
        .await;
    assert_eq!(
        outcome,
        AutoSplitOutcome::Split {
            parts: 5,
            suggested_migration: None,
            migrated: false,
        }
    );
    assert_eq!(h.cluster.call_counts().expect("calls").find_extreme_key, 0);
    assert_eq!(chunk.bytes_written(), 300 * KIB);

    let bounds = h
        .cluster
        .chunks(NSS)
        .expect("chunks")
        .iter()
        .map(|c| c.range.max.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        &bounds[..4],
        &[
            ShardKey::int(8),
            ShardKey::int(16),
            ShardKey::int(24),
            ShardKey::int(32)
        ]
    );
}

/// Delegates to the in-memory cluster and remembers the chunk size of every
/// split point request.
struct ChunkSizeRecorder {
    cluster: Arc<InMemoryCluster>,
    chunk_sizes: Mutex<Vec<u64>>,
}

#[async_trait]
impl ShardingClient for ChunkSizeRecorder {
    async fn select_chunk_split_points(
        &self,
        shard: &ShardId,
        nss: &str,
        pattern: &ShardKeyPattern,
        range: &ChunkRange,
        chunk_size_bytes: u64,
    ) -> anyhow::Result<Vec<ShardKey>> {
        self.chunk_sizes
            .lock()
            .expect("chunk sizes lock")
            .push(chunk_size_bytes);
        self.cluster
            .select_chunk_split_points(shard, nss, pattern, range, chunk_size_bytes)
            .await
    }

    async fn split_chunk_at_multiple_points(
        &self,
        shard: &ShardId,
        nss: &str,
        pattern: &ShardKeyPattern,
        collection_version: ChunkVersion,
        range: &ChunkRange,
        split_points: &[ShardKey],
    ) -> anyhow::Result<Option<ChunkRange>> {
        self.cluster
            .split_chunk_at_multiple_points(
                shard,
                nss,
                pattern,
                collection_version,
                range,
                split_points,
            )
            .await
    }

    async fn find_extreme_key_for_shard(
        &self,
        nss: &str,
        shard: &ShardId,
        pattern: &ShardKeyPattern,
        want_lowest: bool,
    ) -> anyhow::Result<Option<ShardKey>> {
        self.cluster
            .find_extreme_key_for_shard(nss, shard, pattern, want_lowest)
            .await
    }

    async fn rebalance_chunk(&self, nss: &str, chunk: &ChunkType) -> anyhow::Result<()> {
        self.cluster.rebalance_chunk(nss, chunk).await
    }

    async fn collection_allows_balance(&self, nss: &str) -> anyhow::Result<bool> {
        self.cluster.collection_allows_balance(nss).await
    }
}

#[tokio::test]
async fn write_bursts_widen_the_requested_chunk_size() {
    let h = Harness::new(small_chunk_settings(false), 5, &[0, 1000]);
    h.insert_range(0, 40, DOC_BYTES);
    let recorder = Arc::new(ChunkSizeRecorder {
        cluster: h.cluster.clone(),
        chunk_sizes: Mutex::new(Vec::new()),
    });
    let splitter = AutoSplitter::new(
        Arc::new(BalancerConfiguration::with_settings(
            h.cluster.clone(),
            small_chunk_settings(false),
        )),
        h.catalog.clone(),
        recorder.clone(),
        AutoSplitConfig::default(),
    );

    // The refresh inside the attempt raises the max chunk size to 4 MiB.
    let mut larger = small_chunk_settings(false);
    larger.max_chunk_size_bytes = 4 * MIB;
    h.cluster.set_balancer_settings(larger).expect("settings");

    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(5))
        .expect("chunk");

    // 3 MiB against a 1 MiB desired size estimates 6 split points: widen to
    // the bytes written.
    let outcome = splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 3 * MIB)
        .await;
    assert_eq!(outcome, AutoSplitOutcome::NotEnoughSplitPoints);
    assert_eq!(chunk.bytes_written(), 0);

    // 1 MiB against the refreshed 4 MiB desired size: no widening.
    let outcome = splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, MIB)
        .await;
    assert_eq!(outcome, AutoSplitOutcome::NotEnoughSplitPoints);

    let chunk_sizes = recorder.chunk_sizes.lock().expect("chunk sizes lock").clone();
    assert_eq!(chunk_sizes, vec![3 * MIB, 4 * MIB]);
}

#[tokio::test]
async fn highest_open_ended_chunk_moves_top_chunk_to_other_shard() {
    let h = Harness::new(small_chunk_settings(true), 5, &[-1000]);
    h.insert_range(0, 40, DOC_BYTES);
    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(0))
        .expect("chunk");
    assert_eq!(chunk.shard_id(), "shard1");

    let outcome = h
        .splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 300 * KIB)
        .await;
    let global_max = routing.shard_key_pattern().global_max();
    let top = ChunkRange::new(ShardKey::int(39), global_max).expect("range");
    assert_eq!(
        outcome,
        AutoSplitOutcome::Split {
            parts: 5,
            suggested_migration: Some(top.clone()),
            migrated: true,
        }
    );

    let chunks = h.cluster.chunks(NSS).expect("chunks");
    let moved = chunks.last().expect("top chunk");
    assert_eq!(moved.range, top);
    assert_eq!(moved.shard, "shard0");
    assert_eq!(moved.version.major, 2);
    assert_eq!(moved.version.minor, 0);

    // The move invalidated the cached table; the next lookup sees it.
    let refreshes = h.catalog.refresh_count();
    let fresh = h.routing().await;
    assert_eq!(h.catalog.refresh_count(), refreshes + 1);
    let fresh_top = fresh
        .find_intersecting_chunk(&ShardKey::int(39))
        .expect("chunk");
    assert_eq!(fresh_top.shard_id(), "shard0");
    assert_eq!(h.splitter.stats_snapshot().migrations, 1);
}

#[tokio::test]
async fn collections_that_disallow_balancing_are_not_moved() {
    let h = Harness::new(small_chunk_settings(true), 5, &[-1000]);
    h.cluster.set_allow_balance(NSS, false).expect("allow balance");
    h.insert_range(0, 40, DOC_BYTES);
    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(0))
        .expect("chunk");

    let outcome = h
        .splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 300 * KIB)
        .await;
    match outcome {
        AutoSplitOutcome::Split {
            suggested_migration,
            migrated,
            ..
        } => {
            assert!(suggested_migration.is_some());
            assert!(!migrated);
        }
        other => panic!("expected a split, got {other:?}"),
    }
    let calls = h.cluster.call_counts().expect("calls");
    assert_eq!(calls.collection_allows_balance, 1);
    assert_eq!(calls.rebalance_chunk, 0);
}

#[tokio::test]
async fn no_ticket_means_no_split_work() {
    let h = Harness::new(small_chunk_settings(false), 1, &[1000]);
    h.insert_range(0, 40, DOC_BYTES);
    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(0))
        .expect("chunk");
    let before = h.cluster.collection_version(NSS).expect("version");

    let _held = h.splitter.throttle().try_acquire().expect("ticket");
    let outcome = h
        .splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 300 * KIB)
        .await;
    assert_eq!(outcome, AutoSplitOutcome::NoTicket);

    let calls = h.cluster.call_counts().expect("calls");
    assert_eq!(calls.select_split_points, 0);
    assert_eq!(calls.split_chunk, 0);
    assert_eq!(h.cluster.collection_version(NSS).expect("version"), before);
    assert_eq!(chunk.bytes_written(), 300 * KIB);
    assert_eq!(h.splitter.stats_snapshot().no_ticket, 1);
}

#[tokio::test]
async fn auto_split_disabled_by_refreshed_settings() {
    let h = Harness::new(small_chunk_settings(false), 5, &[1000]);
    h.insert_range(0, 40, DOC_BYTES);
    let mut disabled = small_chunk_settings(false);
    disabled.should_auto_split = false;
    h.cluster.set_balancer_settings(disabled).expect("settings");

    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(0))
        .expect("chunk");
    let outcome = h
        .splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 300 * KIB)
        .await;
    assert_eq!(outcome, AutoSplitOutcome::AutoSplitDisabled);
    assert!(!h.splitter.balancer().should_auto_split());
    assert_eq!(chunk.bytes_written(), 300 * KIB);

    // The cached flag now short-circuits before any remote call.
    let outcome = h
        .splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, KIB)
        .await;
    assert_eq!(outcome, AutoSplitOutcome::AutoSplitDisabled);
    let calls = h.cluster.call_counts().expect("calls");
    assert_eq!(calls.load_balancer_settings, 1);
    assert_eq!(calls.select_split_points, 0);
}

#[tokio::test]
async fn stale_split_invalidates_routing_table() {
    let h = Harness::new(small_chunk_settings(false), 5, &[1000]);
    h.insert_range(0, 40, DOC_BYTES);
    h.cluster
        .inject_fault(ClusterOp::SplitChunk, InjectedFault::StaleRouting)
        .expect("inject");
    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(0))
        .expect("chunk");

    let outcome = h
        .splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 300 * KIB)
        .await;
    assert_eq!(
        outcome,
        AutoSplitOutcome::Failed {
            stale_routing: true
        }
    );
    assert_eq!(chunk.bytes_written(), 0);

    let refreshes = h.catalog.refresh_count();
    h.routing().await;
    assert_eq!(h.catalog.refresh_count(), refreshes + 1);
    assert_eq!(h.splitter.stats_snapshot().stale_invalidations, 1);
}

#[tokio::test]
async fn concurrent_split_elsewhere_is_detected_as_stale() {
    let h = Harness::new(small_chunk_settings(false), 5, &[1000]);
    h.insert_range(0, 40, DOC_BYTES);
    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(0))
        .expect("chunk");

    // Another router splits the chunk first.
    h.cluster
        .split_chunk_at_multiple_points(
            &chunk.shard_id().to_string(),
            NSS,
            routing.shard_key_pattern(),
            routing.version(),
            chunk.range(),
            &[ShardKey::int(20)],
        )
        .await
        .expect("out-of-band split");

    let outcome = h
        .splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 300 * KIB)
        .await;
    assert_eq!(
        outcome,
        AutoSplitOutcome::Failed {
            stale_routing: true
        }
    );
    assert_eq!(h.routing().await.num_chunks(), 3);
}

#[tokio::test]
async fn other_failures_are_absorbed_without_invalidation() {
    let h = Harness::new(small_chunk_settings(false), 5, &[1000]);
    h.insert_range(0, 40, DOC_BYTES);
    h.cluster
        .inject_fault(
            ClusterOp::SelectSplitPoints,
            InjectedFault::Unavailable("shard0 unreachable".to_string()),
        )
        .expect("inject");
    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(0))
        .expect("chunk");

    let outcome = h
        .splitter
        .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 300 * KIB)
        .await;
    assert_eq!(
        outcome,
        AutoSplitOutcome::Failed {
            stale_routing: false
        }
    );
    assert_eq!(chunk.bytes_written(), 0);

    let refreshes = h.catalog.refresh_count();
    h.routing().await;
    assert_eq!(h.catalog.refresh_count(), refreshes);
    assert_eq!(h.splitter.stats_snapshot().failures, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_split_a_chunk_once() {
    let h = Harness::new(small_chunk_settings(false), 2, &[1000]);
    h.insert_range(0, 40, DOC_BYTES);
    let routing = h.routing().await;
    let chunk = routing
        .find_intersecting_chunk(&ShardKey::int(0))
        .expect("chunk");

    let tasks = (0..16).map(|_| {
        let splitter = Arc::clone(&h.splitter);
        let routing = Arc::clone(&routing);
        let chunk = Arc::clone(&chunk);
        tokio::spawn(async move {
            splitter
                .update_chunk_write_stats_and_split_if_needed(&routing, &chunk, 300 * KIB)
                .await
        })
    });
    let outcomes = futures_util::future::join_all(tasks)
        .await
        .into_iter()
        .map(|res| res.expect("task"))
        .collect::<Vec<_>>();

    assert_eq!(outcomes.len(), 16);
    assert_eq!(outcomes.iter().filter(|o| o.is_split()).count(), 1);
    assert_eq!(h.splitter.stats_snapshot().splits, 1);
    assert_eq!(h.splitter.throttle().available(), 2);

    let chunks = h.cluster.chunks(NSS).expect("chunks");
    ChunkManager::new(NSS, routing.shard_key_pattern().clone(), chunks)
        .expect("chunks still cover the key space");
}

#[tokio::test]
async fn split_if_needed_walks_every_touched_chunk() {
    let h = Harness::new(small_chunk_settings(false), 5, &[1000]);
    let routing = h.routing().await;
    let mut stats = TargeterStats::new();
    for i in 0..40 {
        let key = h
            .cluster
            .insert(NSS, &serde_json::json!({ "a": i, "name": "user" }), DOC_BYTES)
            .expect("insert");
        stats
            .record_document(&routing, &key, DOC_BYTES)
            .expect("record");
    }
    let key = h
        .cluster
        .insert(NSS, &serde_json::json!({ "a": 5000 }), KIB)
        .expect("insert");
    stats.record_document(&routing, &key, KIB).expect("record");

    let outcomes = h.splitter.split_if_needed(NSS, &stats).await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].is_split());
    assert_eq!(outcomes[1], AutoSplitOutcome::BelowThreshold);

    assert!(h
        .splitter
        .split_if_needed("test.unsharded", &stats)
        .await
        .is_empty());
}

#[tokio::test]
async fn refresh_of_unsharded_namespace_fails() {
    let h = Harness::new(small_chunk_settings(false), 5, &[]);
    let err = h
        .catalog
        .get_sharded_collection_routing_info_with_refresh("test.missing")
        .await
        .expect_err("not sharded");
    assert!(err.downcast_ref::<NamespaceNotSharded>().is_some());
    assert!(h
        .catalog
        .get_collection_routing_info("test.missing")
        .await
        .expect("lookup")
        .is_none());
    assert_eq!(h.splitter.balancer().max_chunk_size_bytes(), MIB);
}
