//! Balancer settings as seen by the router.
//!
//! `BalancerConfiguration` keeps the last valid settings in atomics so the
//! write path can read them without locking. `refresh_and_check` reloads them
//! from a `BalancerSettingsSource`; invalid or unreadable settings leave the
//! previous values in place.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

pub const DEFAULT_MAX_CHUNK_SIZE_BYTES: u64 = 64 * MIB;
pub const MIN_MAX_CHUNK_SIZE_BYTES: u64 = MIB;
pub const MAX_MAX_CHUNK_SIZE_BYTES: u64 = 1024 * MIB;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerSettings {
    pub max_chunk_size_bytes: u64,
    pub should_auto_split: bool,
    pub balance_for_auto_split: bool,
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            max_chunk_size_bytes: DEFAULT_MAX_CHUNK_SIZE_BYTES,
            should_auto_split: true,
            balance_for_auto_split: true,
        }
    }
}

impl BalancerSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(MIN_MAX_CHUNK_SIZE_BYTES..=MAX_MAX_CHUNK_SIZE_BYTES).contains(&self.max_chunk_size_bytes)
        {
            anyhow::bail!(
                "max chunk size {} must be between {} and {} bytes",
                self.max_chunk_size_bytes,
                MIN_MAX_CHUNK_SIZE_BYTES,
                MAX_MAX_CHUNK_SIZE_BYTES
            );
        }
        Ok(())
    }
}

/// Where balancer settings are stored (the config server in a real cluster).
#[async_trait]
pub trait BalancerSettingsSource: Send + Sync + 'static {
    async fn load_balancer_settings(&self) -> anyhow::Result<BalancerSettings>;
}

pub struct BalancerConfiguration {
    source: Arc<dyn BalancerSettingsSource>,
    max_chunk_size_bytes: AtomicU64,
    should_auto_split: AtomicBool,
    balance_for_auto_split: AtomicBool,
}

impl BalancerConfiguration {
    pub fn new(source: Arc<dyn BalancerSettingsSource>) -> Self {
        Self::with_settings(source, BalancerSettings::default())
    }

    pub fn with_settings(source: Arc<dyn BalancerSettingsSource>, settings: BalancerSettings) -> Self {
        Self {
            source,
            max_chunk_size_bytes: AtomicU64::new(settings.max_chunk_size_bytes),
            should_auto_split: AtomicBool::new(settings.should_auto_split),
            balance_for_auto_split: AtomicBool::new(settings.balance_for_auto_split),
        }
    }

    pub fn max_chunk_size_bytes(&self) -> u64 {
        self.max_chunk_size_bytes.load(Ordering::Relaxed)
    }

    pub fn should_auto_split(&self) -> bool {
        self.should_auto_split.load(Ordering::Relaxed)
    }

    pub fn should_balance_for_auto_split(&self) -> bool {
        self.balance_for_auto_split.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> BalancerSettings {
        BalancerSettings {
            max_chunk_size_bytes: self.max_chunk_size_bytes(),
            should_auto_split: self.should_auto_split(),
            balance_for_auto_split: self.should_balance_for_auto_split(),
        }
    }

    /// Reload settings from the source.
    ///
    /// Output:
    /// - `Ok(())` when fresh valid settings were applied.
    /// - `Err` when loading or validation failed; current settings are kept.
    pub async fn refresh_and_check(&self) -> anyhow::Result<()> {
        let fresh = self
            .source
            .load_balancer_settings()
            .await
            .context("load balancer settings")?;
        fresh.validate().context("invalid balancer settings")?;

        let current = self.settings();
        if current != fresh {
            tracing::info!(
                max_chunk_size_bytes = fresh.max_chunk_size_bytes,
                should_auto_split = fresh.should_auto_split,
                balance_for_auto_split = fresh.balance_for_auto_split,
                "balancer settings changed"
            );
        }
        self.max_chunk_size_bytes
            .store(fresh.max_chunk_size_bytes, Ordering::Relaxed);
        self.should_auto_split
            .store(fresh.should_auto_split, Ordering::Relaxed);
        self.balance_for_auto_split
            .store(fresh.balance_for_auto_split, Ordering::Relaxed);
        Ok(())
    }
}
