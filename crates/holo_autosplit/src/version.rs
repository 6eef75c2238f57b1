//! Chunk versions: optimistic-concurrency tokens for chunk metadata.
//!
//! A version is `major|minor||epoch`. The epoch identifies one generation of
//! the collection's sharding (it changes when the collection is dropped and
//! resharded). Splits bump the minor component, migrations bump the major
//! component. Versions from different epochs are never ordered.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub major: u32,
    pub minor: u32,
    pub epoch: u64,
}

impl ChunkVersion {
    pub const fn new(major: u32, minor: u32, epoch: u64) -> Self {
        Self {
            major,
            minor,
            epoch,
        }
    }

    /// Version of a collection that is not sharded.
    pub const fn unsharded() -> Self {
        Self::new(0, 0, 0)
    }

    /// Bump the major component and reset minor to zero.
    pub fn inc_major(&mut self) -> anyhow::Result<()> {
        self.major = self
            .major
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("chunk version major component overflow: {self}"))?;
        self.minor = 0;
        Ok(())
    }

    pub fn inc_minor(&mut self) -> anyhow::Result<()> {
        self.minor = self
            .minor
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("chunk version minor component overflow: {self}"))?;
        Ok(())
    }

    /// Same epoch and a lower `(major, minor)` pair.
    pub fn is_older_than(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch && (self.major, self.minor) < (other.major, other.minor)
    }

    pub fn is_strictly_equal_to(&self, other: &ChunkVersion) -> bool {
        self == other
    }

    /// Writes routed with `self` are still valid against a shard at `other`
    /// when the epoch and the major component agree.
    pub fn is_write_compatible_with(&self, other: &ChunkVersion) -> bool {
        self.epoch == other.epoch && self.major == other.major
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}
