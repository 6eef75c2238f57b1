//! Split tickets: a non-blocking cap on concurrent auto-split attempts.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_MAX_CONCURRENT_SPLITS: usize = 5;

#[derive(Debug, Clone)]
pub struct AutoSplitThrottle {
    tickets: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the duration of one split attempt; released on drop.
#[derive(Debug)]
pub struct SplitTicket {
    _permit: OwnedSemaphorePermit,
}

impl AutoSplitThrottle {
    pub fn new(capacity: usize) -> Self {
        Self {
            tickets: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a ticket if one is free. Never waits.
    pub fn try_acquire(&self) -> Option<SplitTicket> {
        self.tickets
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| SplitTicket { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.tickets.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AutoSplitThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_SPLITS)
    }
}
