//! Write-driven auto-split decisions.
//!
//! Flow of one `update_chunk_write_stats_and_split_if_needed` call:
//! - Add the batch's bytes to the chunk counter and check the split threshold.
//! - Take a split ticket without waiting; give up if none is free.
//! - Refresh balancer settings, pick a target chunk size and ask the owning
//!   shard for split points.
//! - Move the outermost split point to the real edge of the data for
//!   open-ended chunks of ordered shard keys.
//! - Commit the split through the versioned sharding client, reload routing,
//!   and optionally ask the balancer to move the suggested top chunk.
//!
//! Failure model:
//! - Nothing is returned as an error. Every failure resets the chunk counter
//!   and is reported as `AutoSplitOutcome::Failed`.
//! - Stale-routing failures also invalidate the cached routing table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::balancer::BalancerConfiguration;
use crate::catalog::CatalogCache;
use crate::chunk::Chunk;
use crate::client::{is_stale_sharding_error, ShardingClient};
use crate::key::{ChunkRange, ShardKey};
use crate::routing::ChunkManager;
use crate::throttle::{AutoSplitThrottle, DEFAULT_MAX_CONCURRENT_SPLITS};

/// When the estimated number of split points reaches this, the target chunk
/// size is widened so one burst of writes does not produce many tiny chunks.
pub const TOO_MANY_SPLIT_POINTS: u64 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSplitConfig {
    pub max_concurrent_splits: usize,
}

impl Default for AutoSplitConfig {
    fn default() -> Self {
        Self {
            max_concurrent_splits: DEFAULT_MAX_CONCURRENT_SPLITS,
        }
    }
}

/// Where one auto-split attempt stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AutoSplitOutcome {
    /// Not enough writes yet; the counter keeps accumulating.
    BelowThreshold,
    /// Auto-split is turned off in the balancer settings.
    AutoSplitDisabled,
    /// Every split ticket was taken.
    NoTicket,
    /// The shard returned at most one split point; the counter was reset.
    NotEnoughSplitPoints,
    /// The chunk was split into `parts` chunks.
    Split {
        parts: usize,
        suggested_migration: Option<ChunkRange>,
        migrated: bool,
    },
    /// The attempt failed and was absorbed.
    Failed { stale_routing: bool },
}

impl AutoSplitOutcome {
    pub fn is_split(&self) -> bool {
        matches!(self, AutoSplitOutcome::Split { .. })
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AutoSplitStatsSnapshot {
    pub attempts: u64,
    pub no_ticket: u64,
    pub not_enough_split_points: u64,
    pub splits: u64,
    pub chunks_created: u64,
    pub migrations: u64,
    pub failures: u64,
    pub stale_invalidations: u64,
}

#[derive(Default)]
struct AutoSplitStats {
    attempts: AtomicU64,
    no_ticket: AtomicU64,
    not_enough_split_points: AtomicU64,
    splits: AtomicU64,
    chunks_created: AtomicU64,
    migrations: AtomicU64,
    failures: AtomicU64,
    stale_invalidations: AtomicU64,
}

impl AutoSplitStats {
    fn snapshot(&self) -> AutoSplitStatsSnapshot {
        AutoSplitStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            no_ticket: self.no_ticket.load(Ordering::Relaxed),
            not_enough_split_points: self.not_enough_split_points.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            chunks_created: self.chunks_created.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            stale_invalidations: self.stale_invalidations.load(Ordering::Relaxed),
        }
    }
}

/// Auto-split decision context shared by all write paths of one router.
pub struct AutoSplitter {
    balancer: Arc<BalancerConfiguration>,
    catalog: Arc<CatalogCache>,
    client: Arc<dyn ShardingClient>,
    throttle: AutoSplitThrottle,
    stats: AutoSplitStats,
}

impl AutoSplitter {
    pub fn new(
        balancer: Arc<BalancerConfiguration>,
        catalog: Arc<CatalogCache>,
        client: Arc<dyn ShardingClient>,
        config: AutoSplitConfig,
    ) -> Self {
        Self {
            balancer,
            catalog,
            client,
            throttle: AutoSplitThrottle::new(config.max_concurrent_splits),
            stats: AutoSplitStats::default(),
        }
    }

    pub fn balancer(&self) -> &BalancerConfiguration {
        &self.balancer
    }

    pub fn catalog(&self) -> &CatalogCache {
        &self.catalog
    }

    pub fn throttle(&self) -> &AutoSplitThrottle {
        &self.throttle
    }

    pub fn stats_snapshot(&self) -> AutoSplitStatsSnapshot {
        self.stats.snapshot()
    }

    /// Account `bytes_written` to `chunk` and split it if it has grown enough.
    ///
    /// Inputs:
    /// - `manager`: routing table `chunk` belongs to.
    /// - `chunk`: target chunk of the write batch.
    /// - `bytes_written`: estimated size of the batch's writes to `chunk`.
    ///
    /// Output:
    /// - Which step ended the attempt. Never fails the caller.
    pub async fn update_chunk_write_stats_and_split_if_needed(
        &self,
        manager: &ChunkManager,
        chunk: &Chunk,
        bytes_written: u64,
    ) -> AutoSplitOutcome {
        let pattern = manager.shard_key_pattern();
        let min_is_inf = chunk.min() == &pattern.global_min();
        let max_is_inf = chunk.max() == &pattern.global_max();
        let chunk_bytes_written = chunk.add_bytes_written(bytes_written);
        let desired_chunk_size = self.balancer.max_chunk_size_bytes();

        if !self.balancer.should_auto_split() {
            return AutoSplitOutcome::AutoSplitDisabled;
        }
        if !chunk.should_split(desired_chunk_size, min_is_inf, max_is_inf) {
            return AutoSplitOutcome::BelowThreshold;
        }

        let Some(_ticket) = self.throttle.try_acquire() else {
            self.stats.no_ticket.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(nss = manager.nss(), "won't auto split because not enough tickets");
            return AutoSplitOutcome::NoTicket;
        };
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);

        let split = SplitAttempt {
            manager,
            chunk,
            chunk_bytes_written,
            desired_chunk_size,
            min_is_inf,
            max_is_inf,
        };
        match self.split_chunk(&split).await {
            Ok(outcome) => outcome,
            Err(err) => {
                chunk.clear_bytes_written();
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                let stale_routing = is_stale_sharding_error(&err);
                if stale_routing {
                    tracing::warn!(
                        nss = manager.nss(),
                        range = %chunk.range(),
                        error = ?err,
                        "unable to auto-split chunk, invalidating routing table entry"
                    );
                    self.catalog.invalidate_sharded_collection(manager.nss());
                    self.stats.stale_invalidations.fetch_add(1, Ordering::Relaxed);
                } else {
                    tracing::info!(
                        nss = manager.nss(),
                        range = %chunk.range(),
                        error = ?err,
                        "unable to auto-split chunk"
                    );
                }
                AutoSplitOutcome::Failed { stale_routing }
            }
        }
    }

    async fn split_chunk(&self, split: &SplitAttempt<'_>) -> anyhow::Result<AutoSplitOutcome> {
        let SplitAttempt {
            manager,
            chunk,
            chunk_bytes_written,
            desired_chunk_size,
            min_is_inf,
            max_is_inf,
        } = *split;
        let nss = manager.nss();
        let pattern = manager.shard_key_pattern();
        let range = chunk.range().clone();
        let shard = chunk.shard_id().to_string();

        self.balancer.refresh_and_check().await?;
        if !self.balancer.should_auto_split() {
            return Ok(AutoSplitOutcome::AutoSplitDisabled);
        }

        tracing::debug!(
            nss,
            chunk = %chunk,
            data_written = chunk_bytes_written,
            desired_chunk_size,
            "about to initiate autosplit"
        );

        let chunk_size = chunk_size_to_use(
            chunk_bytes_written,
            desired_chunk_size,
            self.balancer.max_chunk_size_bytes(),
        );
        let mut split_points = self
            .client
            .select_chunk_split_points(&shard, nss, pattern, &range, chunk_size)
            .await
            .with_context(|| format!("select split points for {nss} {range}"))?;

        if split_points.len() <= 1 {
            // Zero points: not enough data. One point: between half and a full
            // chunk, not worth splitting yet.
            chunk.clear_bytes_written();
            self.stats
                .not_enough_split_points
                .fetch_add(1, Ordering::Relaxed);
            return Ok(AutoSplitOutcome::NotEnoughSplitPoints);
        }

        // Open-ended chunks keep counting so the other side is checked soon.
        if !min_is_inf && !max_is_inf {
            chunk.clear_bytes_written();
        }

        if pattern.is_ordered() && (min_is_inf || max_is_inf) {
            let want_lowest = min_is_inf;
            let extreme = self
                .client
                .find_extreme_key_for_shard(nss, &shard, pattern, want_lowest)
                .await
                .with_context(|| format!("find extreme key for {nss} on {shard}"))?;
            if let Some(key) = extreme {
                extend_to_extreme_key(&mut split_points, &range, key, want_lowest);
            }
        }

        let suggested_migration = self
            .client
            .split_chunk_at_multiple_points(
                &shard,
                nss,
                pattern,
                manager.version(),
                &range,
                &split_points,
            )
            .await
            .with_context(|| format!("split {nss} {range} at {} points", split_points.len()))?;

        let parts = split_points.len() + 1;
        self.stats.splits.fetch_add(1, Ordering::Relaxed);
        self.stats
            .chunks_created
            .fetch_add(split_points.len() as u64, Ordering::Relaxed);

        let should_balance = self.should_balance(nss).await;
        tracing::info!(
            nss,
            chunk = %chunk,
            parts,
            desired_chunk_size,
            migrate_suggested = suggested_migration.is_some(),
            should_balance,
            "autosplitted chunk"
        );

        let routing = self
            .catalog
            .get_sharded_collection_routing_info_with_refresh(nss)
            .await?;

        let Some(suggested) = suggested_migration.clone() else {
            return Ok(AutoSplitOutcome::Split {
                parts,
                suggested_migration,
                migrated: false,
            });
        };
        if !should_balance {
            return Ok(AutoSplitOutcome::Split {
                parts,
                suggested_migration,
                migrated: false,
            });
        }

        // Move the top chunk off this shard using the post-split routing table,
        // so the hot spot does not stay on a single shard.
        let to_move = routing.find_intersecting_chunk(&suggested.min)?;
        self.client
            .rebalance_chunk(nss, &to_move.descriptor())
            .await
            .with_context(|| format!("rebalance {nss} chunk {}", to_move.range()))?;
        self.catalog.invalidate_sharded_collection(nss);
        self.stats.migrations.fetch_add(1, Ordering::Relaxed);

        Ok(AutoSplitOutcome::Split {
            parts,
            suggested_migration,
            migrated: true,
        })
    }

    async fn should_balance(&self, nss: &str) -> bool {
        if !self.balancer.should_balance_for_auto_split() {
            return false;
        }
        match self.client.collection_allows_balance(nss).await {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::info!(nss, error = ?err, "auto-split failed to load collection metadata");
                false
            }
        }
    }
}

#[derive(Clone, Copy)]
struct SplitAttempt<'a> {
    manager: &'a ChunkManager,
    chunk: &'a Chunk,
    chunk_bytes_written: u64,
    desired_chunk_size: u64,
    min_is_inf: bool,
    max_is_inf: bool,
}

/// Target chunk size for split point selection.
///
/// When the written bytes would yield `TOO_MANY_SPLIT_POINTS` or more split
/// points at the desired size, use the written bytes (capped at the max chunk
/// size) instead.
pub fn chunk_size_to_use(chunk_bytes_written: u64, desired_chunk_size: u64, max_chunk_size: u64) -> u64 {
    if desired_chunk_size == 0 {
        return max_chunk_size;
    }
    let est_num_split_points = chunk_bytes_written / desired_chunk_size * 2;
    if est_num_split_points >= TOO_MANY_SPLIT_POINTS {
        chunk_bytes_written.min(max_chunk_size)
    } else {
        desired_chunk_size
    }
}

/// Replace the first (`want_lowest`) or last split point with `extreme`.
///
/// The substitution is skipped if it would leave the points out of ascending
/// order or put one on or outside the chunk boundary. Returns whether the
/// points changed.
pub fn extend_to_extreme_key(
    split_points: &mut [ShardKey],
    range: &ChunkRange,
    extreme: ShardKey,
    want_lowest: bool,
) -> bool {
    if split_points.is_empty() || !range.is_strictly_inside(&extreme) {
        return false;
    }
    let last = split_points.len() - 1;
    let (idx, keeps_order) = if want_lowest {
        (0, split_points.get(1).map_or(true, |next| &extreme < next))
    } else {
        (
            last,
            last.checked_sub(1)
                .and_then(|prev| split_points.get(prev))
                .map_or(true, |prev| prev < &extreme),
        )
    };
    if !keeps_order {
        return false;
    }
    split_points[idx] = extreme;
    true
}
