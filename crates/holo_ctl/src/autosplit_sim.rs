//! `autosplit-sim`: write batches through the auto-splitter against an
//! in-memory cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use holo_autosplit::{
    AutoSplitConfig, AutoSplitOutcome, AutoSplitStatsSnapshot, AutoSplitter,
    BalancerConfiguration, BalancerSettings, CallCounts, CatalogCache, InMemoryCluster, ShardId,
    ShardKeyPattern, TargeterStats,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

const NSS: &str = "sim.docs";
const MIB: u64 = 1024 * 1024;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPattern {
    /// Monotonically increasing keys: every insert hits the top chunk.
    Ascending,
    /// Uniformly random keys.
    Random,
}

#[derive(Parser, Debug, Clone)]
pub struct SimArgs {
    /// Number of documents to insert.
    #[arg(long, default_value_t = 20_000)]
    pub docs: u64,

    /// Size accounted for each document.
    #[arg(long, default_value_t = 1024)]
    pub doc_bytes: u64,

    /// Documents per write batch.
    #[arg(long, default_value_t = 100)]
    pub batch: u64,

    /// Number of shards in the cluster.
    #[arg(long, default_value_t = 3)]
    pub shards: usize,

    /// Balancer max chunk size in MiB.
    #[arg(long, env = "HOLO_MAX_CHUNK_SIZE_MB", default_value_t = 1)]
    pub max_chunk_size_mb: u64,

    /// Whether auto-split is enabled.
    #[arg(long, env = "HOLO_AUTOSPLIT_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_split: bool,

    /// Whether the top chunk of an auto-split may be moved to another shard.
    #[arg(long, env = "HOLO_BALANCE_FOR_AUTOSPLIT", default_value_t = true, action = clap::ArgAction::Set)]
    pub balance_for_auto_split: bool,

    /// Maximum number of concurrent split attempts.
    #[arg(long, env = "HOLO_MAX_CONCURRENT_SPLITS", default_value_t = 5)]
    pub max_concurrent_splits: usize,

    /// Shard key distribution of inserted documents.
    #[arg(long, value_enum, default_value_t = KeyPattern::Ascending)]
    pub pattern: KeyPattern,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkView {
    pub range: String,
    pub shard: ShardId,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub docs: u64,
    pub batches: u64,
    pub pattern: KeyPattern,
    pub seed: u64,
    pub settings: BalancerSettings,
    pub collection_version: String,
    pub chunk_count: usize,
    pub chunks_per_shard: BTreeMap<ShardId, usize>,
    pub outcomes: BTreeMap<&'static str, u64>,
    pub stats: AutoSplitStatsSnapshot,
    pub calls: CallCounts,
    pub chunks: Vec<ChunkView>,
}

fn outcome_label(outcome: &AutoSplitOutcome) -> &'static str {
    match outcome {
        AutoSplitOutcome::BelowThreshold => "below_threshold",
        AutoSplitOutcome::AutoSplitDisabled => "auto_split_disabled",
        AutoSplitOutcome::NoTicket => "no_ticket",
        AutoSplitOutcome::NotEnoughSplitPoints => "not_enough_split_points",
        AutoSplitOutcome::Split { migrated: true, .. } => "split_and_migrated",
        AutoSplitOutcome::Split { .. } => "split",
        AutoSplitOutcome::Failed { stale_routing: true } => "failed_stale_routing",
        AutoSplitOutcome::Failed { .. } => "failed",
    }
}

pub async fn run(args: SimArgs) -> anyhow::Result<SimReport> {
    anyhow::ensure!(args.shards > 0, "--shards must be at least 1");
    anyhow::ensure!(args.batch > 0, "--batch must be at least 1");
    let settings = BalancerSettings {
        max_chunk_size_bytes: args.max_chunk_size_mb.saturating_mul(MIB),
        should_auto_split: args.auto_split,
        balance_for_auto_split: args.balance_for_auto_split,
    };
    settings.validate().context("invalid --max-chunk-size-mb")?;

    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let mut rng = SmallRng::seed_from_u64(seed);

    let shards = (0..args.shards)
        .map(|idx| format!("shard{idx}"))
        .collect::<Vec<_>>();
    let cluster = Arc::new(InMemoryCluster::new(shards, settings));
    cluster.shard_collection(NSS, ShardKeyPattern::ascending(&["_id"])?, &[])?;

    let catalog = Arc::new(CatalogCache::new(cluster.clone()));
    let balancer = Arc::new(BalancerConfiguration::with_settings(cluster.clone(), settings));
    let splitter = AutoSplitter::new(
        balancer,
        catalog.clone(),
        cluster.clone(),
        AutoSplitConfig {
            max_concurrent_splits: args.max_concurrent_splits,
        },
    );
    tracing::info!(
        docs = args.docs,
        doc_bytes = args.doc_bytes,
        shards = args.shards,
        max_chunk_size_bytes = settings.max_chunk_size_bytes,
        pattern = ?args.pattern,
        seed,
        "starting auto-split simulation"
    );

    let key_space = i64::try_from(args.docs).unwrap_or(i64::MAX).saturating_mul(8).max(1);
    let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut inserted = 0u64;
    let mut batches = 0u64;
    while inserted < args.docs {
        let routing = catalog
            .get_collection_routing_info(NSS)
            .await?
            .with_context(|| format!("{NSS} is not sharded"))?;
        let mut stats = TargeterStats::new();
        let batch_end = (inserted + args.batch).min(args.docs);
        for seq in inserted..batch_end {
            let id = match args.pattern {
                KeyPattern::Ascending => i64::try_from(seq).unwrap_or(i64::MAX),
                KeyPattern::Random => rng.gen_range(0..key_space),
            };
            let doc = serde_json::json!({ "_id": id, "seq": seq });
            let key = cluster.insert(NSS, &doc, args.doc_bytes)?;
            stats.record_document(&routing, &key, args.doc_bytes)?;
        }
        inserted = batch_end;
        batches += 1;

        for outcome in splitter.split_if_needed(NSS, &stats).await {
            *outcomes.entry(outcome_label(&outcome)).or_default() += 1;
        }
    }

    let chunks = cluster.chunks(NSS)?;
    let report = SimReport {
        docs: inserted,
        batches,
        pattern: args.pattern,
        seed,
        settings,
        collection_version: cluster.collection_version(NSS)?.to_string(),
        chunk_count: chunks.len(),
        chunks_per_shard: cluster.chunk_counts_by_shard(NSS)?,
        outcomes,
        stats: splitter.stats_snapshot(),
        calls: cluster.call_counts()?,
        chunks: chunks
            .into_iter()
            .map(|chunk| ChunkView {
                range: chunk.range.to_string(),
                shard: chunk.shard,
                version: chunk.version.to_string(),
            })
            .collect(),
    };
    tracing::info!(
        chunks = report.chunk_count,
        splits = report.stats.splits,
        migrations = report.stats.migrations,
        "auto-split simulation finished"
    );
    Ok(report)
}
