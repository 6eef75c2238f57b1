//! Rollback module wiring.
//!
//! `types` defines the log entry model and the oplog/undo contracts, `cursor`
//! holds the single-entry lookahead over the local log, `finder` contains the
//! common-point scan and its driver, and `memory` provides an in-memory oplog.

mod cursor;
mod finder;
mod memory;
mod types;

pub use cursor::LocalOplogCursor;
pub use finder::{
    sync_rollback_local_operations, sync_rollback_local_operations_with_config,
    RollBackLocalOperations,
};
pub use memory::{InMemoryOplog, InMemoryOplogIterator};
pub use types::{
    NeedMoreReason, OpTime, OplogEntry, OplogInterface, OplogIterator, OplogSide, OplogValue,
    RecordId, RollbackCommonPoint, RollbackConfig, RollbackError, ScanStep, Timestamp, UndoError,
    DEFAULT_MAX_ROLLBACK_WINDOW_SECS, UNINITIALIZED_TERM,
};
