//! Single-entry lookahead over the local oplog.

use super::types::{OplogIterator, OplogValue};

/// Stateful cursor that remembers the last entry read from an oplog.
///
/// The common-point scan compares one local entry against successive remote
/// entries, so the current local entry has to survive across calls. `peek`
/// returns it without moving; `advance` replaces it with the next older one.
/// When the log runs out, the last entry read stays in place for diagnostics.
pub struct LocalOplogCursor<'a> {
    iter: Box<dyn OplogIterator + 'a>,
    current: Option<OplogValue>,
}

impl<'a> LocalOplogCursor<'a> {
    pub fn new(iter: Box<dyn OplogIterator + 'a>) -> Self {
        Self {
            iter,
            current: None,
        }
    }

    /// Entry the cursor currently sits on, `None` before the first advance.
    pub fn peek(&self) -> Option<&OplogValue> {
        self.current.as_ref()
    }

    pub fn is_primed(&self) -> bool {
        self.current.is_some()
    }

    /// Move to the next older entry.
    ///
    /// Output:
    /// - `Ok(true)` when a new entry was read.
    /// - `Ok(false)` when the log is exhausted; the previous entry is kept.
    /// - `Err` when the underlying read failed.
    pub fn advance(&mut self) -> anyhow::Result<bool> {
        match self.iter.next()? {
            Some(value) => {
                self.current = Some(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
