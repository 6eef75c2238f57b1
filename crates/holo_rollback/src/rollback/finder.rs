//! Common-point scan between a local and a remote oplog.
//!
//! Both logs are walked newest-first, like a two-pointer merge over two
//! descending sequences:
//! - the local pointer moves every time a local entry is found to be newer
//!   than the current remote entry (that entry is handed to the undo callback),
//!   or when timestamps match but hashes differ;
//! - the remote pointer moves only when the scan asks for more remote input.
//!
//! The first local/remote pair with equal timestamp and equal hash is the
//! common point. Exhausting either log first is fatal.

use super::cursor::LocalOplogCursor;
use super::types::{
    NeedMoreReason, OplogEntry, OplogInterface, OplogSide, OplogValue, RollbackCommonPoint,
    RollbackConfig, RollbackError, ScanStep, UndoError,
};

/// Finder state for one rollback attempt.
///
/// Inputs:
/// - the local oplog, read through a lookahead cursor it owns;
/// - `rollback_operation`: undo callback invoked once per local entry that is
///   newer than the common point, newest first.
///
/// Output:
/// - fed remote entries one at a time through `on_remote_operation`.
pub struct RollBackLocalOperations<'a, F> {
    local: LocalOplogCursor<'a>,
    rollback_operation: F,
    max_rollback_window_secs: i64,
    scanned: u64,
    rolled_back: u64,
}

impl<'a, F> RollBackLocalOperations<'a, F>
where
    F: FnMut(&OplogEntry) -> Result<(), UndoError>,
{
    pub fn new(local_oplog: &'a dyn OplogInterface, rollback_operation: F) -> Self {
        Self::with_config(local_oplog, rollback_operation, &RollbackConfig::default())
    }

    pub fn with_config(
        local_oplog: &'a dyn OplogInterface,
        rollback_operation: F,
        cfg: &RollbackConfig,
    ) -> Self {
        Self {
            local: LocalOplogCursor::new(local_oplog.make_iterator()),
            rollback_operation,
            max_rollback_window_secs: cfg.max_rollback_window_secs,
            scanned: 0,
            rolled_back: 0,
        }
    }

    /// Number of local entries examined so far.
    pub fn scanned(&self) -> u64 {
        self.scanned
    }

    /// Number of local entries handed to the undo callback so far.
    pub fn rolled_back(&self) -> u64 {
        self.rolled_back
    }

    /// Feed the next remote entry (newest-first) into the scan.
    ///
    /// Output:
    /// - `ScanStep::Found` with the common point.
    /// - `ScanStep::NeedMoreRemote` when the next older remote entry is needed.
    /// - `RollbackError` on any fatal condition; the finder must not be fed again.
    pub fn on_remote_operation(&mut self, remote: &OplogEntry) -> Result<ScanStep, RollbackError> {
        if !self.local.is_primed() {
            self.prime(remote)?;
        }

        while self.local_value()?.entry.ts > remote.ts {
            self.scanned += 1;
            self.undo_current()?;
            self.advance_local(remote)?;
        }

        let local = self.local_value()?;
        let (local_ts, local_hash) = (local.entry.ts, local.entry.h);
        let common_point = RollbackCommonPoint {
            op_time: local.entry.op_time(),
            record_id: local.record_id,
        };
        if local_ts == remote.ts {
            self.scanned += 1;
            if local_hash == remote.h {
                return Ok(ScanStep::Found(common_point));
            }

            self.undo_current()?;
            self.advance_local(remote)?;
            return Ok(ScanStep::NeedMoreRemote(
                NeedMoreReason::SameTimestampDifferentHash,
            ));
        }

        // Local entry is older than the remote one: ask for an older remote entry.
        self.scanned += 1;
        Ok(ScanStep::NeedMoreRemote(NeedMoreReason::RemoteAhead))
    }

    /// Read the newest local entry and apply the rollback window guard.
    fn prime(&mut self, remote: &OplogEntry) -> Result<(), RollbackError> {
        match self.local.advance() {
            Ok(true) => {}
            Ok(false) => return Err(RollbackError::OplogStartMissing { source: None }),
            Err(err) => return Err(RollbackError::OplogStartMissing { source: Some(err) }),
        }
        let local = self.local_value()?;

        // Can be positive, negative or zero.
        let diff_secs = i64::from(local.entry.ts.secs) - i64::from(remote.ts.secs);
        tracing::info!(our_last_optime = %local.entry.ts, "our last optime");
        tracing::info!(their_last_optime = %remote.ts, "their last optime");
        tracing::info!(diff_secs, "diff in end of log times");
        if diff_secs > self.max_rollback_window_secs {
            tracing::error!(
                diff_secs,
                limit_secs = self.max_rollback_window_secs,
                "rollback too long a time period for a rollback"
            );
            return Err(RollbackError::ExceededTimeLimit {
                diff_secs,
                limit_secs: self.max_rollback_window_secs,
            });
        }
        Ok(())
    }

    fn local_value(&self) -> Result<&OplogValue, RollbackError> {
        self.local
            .peek()
            .ok_or(RollbackError::OplogStartMissing { source: None })
    }

    /// Hand the current local entry to the undo callback.
    fn undo_current(&mut self) -> Result<(), RollbackError> {
        let Some(local) = self.local.peek() else {
            return Err(RollbackError::OplogStartMissing { source: None });
        };
        tracing::debug!(
            ts = %local.entry.ts,
            op = %local.entry.op,
            ns = %local.entry.ns,
            "local oplog entry to roll back"
        );
        match (self.rollback_operation)(&local.entry) {
            Ok(()) => {}
            Err(UndoError::NothingToUndo) => {
                tracing::debug!(ts = %local.entry.ts, "local oplog entry needs no further undo");
            }
            Err(UndoError::Failed(err)) => return Err(RollbackError::UndoFailed(err)),
        }
        self.rolled_back += 1;
        Ok(())
    }

    fn advance_local(&mut self, remote: &OplogEntry) -> Result<(), RollbackError> {
        match self.local.advance() {
            Ok(true) => Ok(()),
            Ok(false) => {
                let our_time = self.local.peek().map(|value| value.entry.ts);
                tracing::error!(
                    scanned = self.scanned,
                    their_time = %remote.ts,
                    our_time = ?our_time,
                    "rollback error RS101 reached beginning of local oplog"
                );
                Err(RollbackError::NoMatchingDocument {
                    side: OplogSide::Local,
                    scanned: self.scanned,
                })
            }
            Err(err) => Err(RollbackError::OplogRead {
                side: OplogSide::Local,
                source: err,
            }),
        }
    }
}

/// Find the common point of `local_oplog` and `remote_oplog` with default tuning.
///
/// `rollback_operation` is invoked on every local entry newer than the
/// common point, newest first, and never on the common point itself.
pub fn sync_rollback_local_operations<F>(
    local_oplog: &dyn OplogInterface,
    remote_oplog: &dyn OplogInterface,
    rollback_operation: F,
) -> Result<RollbackCommonPoint, RollbackError>
where
    F: FnMut(&OplogEntry) -> Result<(), UndoError>,
{
    sync_rollback_local_operations_with_config(
        local_oplog,
        remote_oplog,
        rollback_operation,
        &RollbackConfig::default(),
    )
}

/// Drive the common-point scan over the whole remote oplog.
///
/// Inputs:
/// - `local_oplog` / `remote_oplog`: both read newest-first.
/// - `rollback_operation`: undo callback for local-only entries.
/// - `cfg`: rollback window and optional shutdown flag.
///
/// Output:
/// - the common point, or the first fatal `RollbackError`. The transient
///   "need more remote entries" signal never escapes this loop.
pub fn sync_rollback_local_operations_with_config<F>(
    local_oplog: &dyn OplogInterface,
    remote_oplog: &dyn OplogInterface,
    rollback_operation: F,
    cfg: &RollbackConfig,
) -> Result<RollbackCommonPoint, RollbackError>
where
    F: FnMut(&OplogEntry) -> Result<(), UndoError>,
{
    let mut remote_iter = remote_oplog.make_iterator();
    let mut remote = match remote_iter.next() {
        Ok(Some(value)) => value,
        Ok(None) => return Err(RollbackError::InvalidSyncSource),
        Err(err) => {
            tracing::warn!(error = ?err, remote = %remote_oplog.describe(), "failed reading remote oplog");
            return Err(RollbackError::InvalidSyncSource);
        }
    };

    let mut finder = RollBackLocalOperations::with_config(local_oplog, rollback_operation, cfg);
    loop {
        if cfg.shutdown_requested() {
            tracing::info!(scanned = finder.scanned(), "rollback common point search interrupted");
            return Err(RollbackError::ShutdownInProgress);
        }

        let their_time = remote.entry.ts;
        match finder.on_remote_operation(&remote.entry)? {
            ScanStep::Found(point) => {
                tracing::info!(
                    common_point = %point.op_time,
                    scanned = finder.scanned(),
                    rolled_back = finder.rolled_back(),
                    "rollback common point found"
                );
                return Ok(point);
            }
            ScanStep::NeedMoreRemote(_) => {}
        }

        remote = match remote_iter.next() {
            Ok(Some(value)) => value,
            Ok(None) => {
                tracing::error!(
                    them = %remote_oplog.describe(),
                    their_time = %their_time,
                    "rollback error RS100 reached beginning of remote oplog"
                );
                return Err(RollbackError::NoMatchingDocument {
                    side: OplogSide::Remote,
                    scanned: finder.scanned(),
                });
            }
            Err(err) => {
                return Err(RollbackError::OplogRead {
                    side: OplogSide::Remote,
                    source: err,
                })
            }
        };
    }
}
