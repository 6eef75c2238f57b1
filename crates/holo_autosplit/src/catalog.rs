//! Routing table cache.
//!
//! Routing tables are loaded lazily from a `RoutingTableSource` and cached per
//! namespace. A cached table stays in use until it is invalidated (typically
//! after a stale-routing error) or a caller explicitly asks for a refresh.
//! When a table is reloaded, write counters of chunks whose range did not
//! change are carried over so accumulated writes are not forgotten.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkType;
use crate::key::ShardKeyPattern;
use crate::routing::ChunkManager;
use crate::version::ChunkVersion;

/// Authoritative sharding metadata for one collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionRoutingInfo {
    pub shard_key_pattern: ShardKeyPattern,
    pub chunks: Vec<ChunkType>,
}

/// Where routing tables come from (the config server in a real cluster).
#[async_trait]
pub trait RoutingTableSource: Send + Sync + 'static {
    /// Current routing metadata for `nss`, or `None` when it is not sharded.
    async fn load_collection(&self, nss: &str) -> anyhow::Result<Option<CollectionRoutingInfo>>;
}

/// Returned when a caller needs a sharded collection but `nss` is not sharded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceNotSharded {
    pub nss: String,
}

impl fmt::Display for NamespaceNotSharded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collection {} is not sharded", self.nss)
    }
}

impl std::error::Error for NamespaceNotSharded {}

#[derive(Default)]
struct CachedCollection {
    manager: Option<Arc<ChunkManager>>,
    needs_refresh: bool,
}

pub struct CatalogCache {
    source: Arc<dyn RoutingTableSource>,
    entries: RwLock<HashMap<String, CachedCollection>>,
    refreshes: AtomicU64,
}

impl CatalogCache {
    pub fn new(source: Arc<dyn RoutingTableSource>) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Cached routing table for `nss`, loading it if absent or invalidated.
    /// `None` means the collection is not sharded.
    pub async fn get_collection_routing_info(
        &self,
        nss: &str,
    ) -> anyhow::Result<Option<Arc<ChunkManager>>> {
        {
            let entries = self
                .entries
                .read()
                .map_err(|_| anyhow::anyhow!("catalog cache lock poisoned"))?;
            if let Some(cached) = entries.get(nss) {
                if !cached.needs_refresh {
                    return Ok(cached.manager.clone());
                }
            }
        }
        self.refresh(nss).await
    }

    /// Force a reload of `nss` and return the fresh routing table.
    ///
    /// Fails with `NamespaceNotSharded` if the collection is no longer
    /// sharded.
    pub async fn get_sharded_collection_routing_info_with_refresh(
        &self,
        nss: &str,
    ) -> anyhow::Result<Arc<ChunkManager>> {
        self.invalidate_sharded_collection(nss);
        match self.get_collection_routing_info(nss).await? {
            Some(manager) => Ok(manager),
            None => Err(NamespaceNotSharded {
                nss: nss.to_string(),
            }
            .into()),
        }
    }

    /// Mark the cached routing table for `nss` stale. The next lookup reloads.
    pub fn invalidate_sharded_collection(&self, nss: &str) {
        match self.entries.write() {
            Ok(mut entries) => {
                entries.entry(nss.to_string()).or_default().needs_refresh = true;
            }
            Err(_) => {
                tracing::warn!(nss, "catalog cache lock poisoned, routing table not invalidated");
            }
        }
    }

    /// Number of routing table loads performed so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    async fn refresh(&self, nss: &str) -> anyhow::Result<Option<Arc<ChunkManager>>> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        let loaded = self
            .source
            .load_collection(nss)
            .await
            .with_context(|| format!("load routing table for {nss}"))?;
        let manager = match loaded {
            Some(info) => Some(Arc::new(
                ChunkManager::new(nss, info.shard_key_pattern, info.chunks)
                    .with_context(|| format!("build routing table for {nss}"))?,
            )),
            None => None,
        };

        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("catalog cache lock poisoned"))?;
        let cached = entries.entry(nss.to_string()).or_default();
        if let (Some(previous), Some(fresh)) = (cached.manager.as_ref(), manager.as_ref()) {
            // A slower concurrent load must not replace a newer table.
            if fresh.version().is_older_than(&previous.version()) {
                tracing::debug!(
                    nss,
                    loaded = %fresh.version(),
                    cached = %previous.version(),
                    "discarding routing table older than the cached one"
                );
                return Ok(Some(previous.clone()));
            }
            fresh.carry_over_write_stats(previous);
        }
        cached.manager = manager.clone();
        cached.needs_refresh = false;
        tracing::debug!(
            nss,
            version = %manager
                .as_ref()
                .map(|m| m.version())
                .unwrap_or_else(ChunkVersion::unsharded),
            "refreshed routing table"
        );
        Ok(manager)
    }
}
