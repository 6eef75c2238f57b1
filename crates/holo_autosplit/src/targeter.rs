//! Per-batch write accounting and the write-path auto-split entry point.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::key::ShardKey;
use crate::routing::ChunkManager;
use crate::splitter::{AutoSplitOutcome, AutoSplitter};

/// Bytes a write batch sent to each chunk, keyed by a key inside the chunk
/// (normally the chunk's min key).
#[derive(Clone, Debug, Default, Serialize)]
pub struct TargeterStats {
    pub chunk_size_delta: BTreeMap<ShardKey, u64>,
}

impl TargeterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&mut self, chunk_key: ShardKey, bytes: u64) {
        let delta = self.chunk_size_delta.entry(chunk_key).or_insert(0);
        *delta = delta.saturating_add(bytes);
    }

    /// Route `doc_key` through `manager` and account `bytes` to its chunk.
    pub fn record_document(
        &mut self,
        manager: &ChunkManager,
        doc_key: &ShardKey,
        bytes: u64,
    ) -> anyhow::Result<()> {
        let chunk = manager.find_intersecting_chunk(doc_key)?;
        self.record_write(chunk.min().clone(), bytes);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_size_delta.is_empty()
    }
}

impl AutoSplitter {
    /// Feed a finished batch's write stats to the split decider, chunk by
    /// chunk.
    ///
    /// Routing lookup failures are logged and end the pass; the write that
    /// produced `stats` has already succeeded.
    pub async fn split_if_needed(&self, nss: &str, stats: &TargeterStats) -> Vec<AutoSplitOutcome> {
        let routing = match self.catalog().get_collection_routing_info(nss).await {
            Ok(Some(routing)) => routing,
            Ok(None) => return Vec::new(),
            Err(err) => {
                tracing::info!(
                    nss,
                    error = ?err,
                    "failed to get collection information while checking for auto-split"
                );
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(stats.chunk_size_delta.len());
        for (key, bytes) in &stats.chunk_size_delta {
            let chunk = match routing.find_intersecting_chunk(key) {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::warn!(
                        nss,
                        error = ?err,
                        "could not find chunk while checking for auto-split"
                    );
                    return outcomes;
                }
            };
            outcomes.push(
                self.update_chunk_write_stats_and_split_if_needed(&routing, &chunk, *bytes)
                    .await,
            );
        }
        outcomes
    }
}
