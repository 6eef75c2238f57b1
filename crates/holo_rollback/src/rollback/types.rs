//! Shared types for the rollback common-point search.
//!
//! These types are kept free of any storage dependency: the local and remote
//! logs are reached through `OplogInterface`, and entries are plain serde
//! structs so callers can feed them from disk, the network, or tests.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Term reported for entries written before terms were recorded.
pub const UNINITIALIZED_TERM: i64 = -1;
/// Largest gap, in seconds, between the newest local and newest remote entry
/// that a rollback is allowed to undo.
pub const DEFAULT_MAX_ROLLBACK_WINDOW_SECS: i64 = 1800;

/// Logical clock value stamped on every log entry.
///
/// Ordered by `(secs, inc)`; `inc` disambiguates entries written within the
/// same second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

impl Timestamp {
    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Position of an entry in the replicated history: timestamp plus election term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpTime {
    pub ts: Timestamp,
    pub term: i64,
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ts: {}, t: {} }}", self.ts, self.term)
    }
}

/// One operation log entry.
///
/// Field names follow the persisted document layout: `ts` timestamp, `t`
/// term, `h` content hash, `op` operation kind, `ns` namespace and `o` the
/// operation payload. Only `ts` and `h` take part in the common-point search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub ts: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<i64>,
    pub h: i64,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub ns: String,
    #[serde(default)]
    pub o: serde_json::Value,
}

impl OplogEntry {
    /// Minimal entry carrying only what the common-point search compares.
    pub fn new(ts: Timestamp, hash: i64) -> Self {
        Self {
            ts,
            t: None,
            h: hash,
            op: "n".to_string(),
            ns: String::new(),
            o: serde_json::Value::Null,
        }
    }

    /// Parse an entry from its raw document form.
    pub fn from_document(doc: serde_json::Value) -> anyhow::Result<Self> {
        serde_json::from_value(doc).context("malformed oplog entry")
    }

    pub fn op_time(&self) -> OpTime {
        OpTime {
            ts: self.ts,
            term: self.t.unwrap_or(UNINITIALIZED_TERM),
        }
    }
}

/// Storage handle of an entry inside the log it was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

/// One value yielded by an oplog iterator: the entry and its optional handle.
#[derive(Clone, Debug, PartialEq)]
pub struct OplogValue {
    pub entry: OplogEntry,
    pub record_id: Option<RecordId>,
}

impl OplogValue {
    pub fn new(entry: OplogEntry, record_id: Option<RecordId>) -> Self {
        Self { entry, record_id }
    }
}

/// Cursor over an oplog, newest entry first.
///
/// `Ok(None)` means the log is exhausted; `Err` is a read failure.
pub trait OplogIterator {
    fn next(&mut self) -> anyhow::Result<Option<OplogValue>>;
}

/// Read access to one operation log.
pub trait OplogInterface {
    /// Start a new cursor at the newest entry.
    fn make_iterator(&self) -> Box<dyn OplogIterator + '_>;

    /// Short human-readable identity of the log, used in diagnostics.
    fn describe(&self) -> String;
}

/// The newest point both logs agree on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RollbackCommonPoint {
    pub op_time: OpTime,
    pub record_id: Option<RecordId>,
}

/// Why the scan needs another remote entry before it can decide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeedMoreReason {
    /// The remote entry is newer than the current local entry.
    RemoteAhead,
    /// Both entries share a timestamp but their hashes differ.
    SameTimestampDifferentHash,
}

/// Non-fatal result of feeding one remote entry into the scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanStep {
    Found(RollbackCommonPoint),
    NeedMoreRemote(NeedMoreReason),
}

/// Which log a failure refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OplogSide {
    Local,
    Remote,
}

impl fmt::Display for OplogSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OplogSide::Local => f.write_str("local"),
            OplogSide::Remote => f.write_str("remote"),
        }
    }
}

/// Fatal outcomes of a common-point search.
#[derive(Debug)]
pub enum RollbackError {
    /// The remote log had no readable entry at all.
    InvalidSyncSource,
    /// The local log had no readable entry at all.
    OplogStartMissing { source: Option<anyhow::Error> },
    /// The newest local entry is too far ahead of the newest remote entry.
    ExceededTimeLimit { diff_secs: i64, limit_secs: i64 },
    /// One side was exhausted before a common point was found.
    NoMatchingDocument { side: OplogSide, scanned: u64 },
    /// A log failed mid-scan for a reason other than exhaustion.
    OplogRead { side: OplogSide, source: anyhow::Error },
    /// The undo callback failed; the scan stopped after partial undo.
    UndoFailed(anyhow::Error),
    /// The scan was abandoned because shutdown was requested.
    ShutdownInProgress,
}

impl RollbackError {
    /// Stable error code name for logs and operator tooling.
    pub fn code(&self) -> &'static str {
        match self {
            RollbackError::InvalidSyncSource => "InvalidSyncSource",
            RollbackError::OplogStartMissing { .. } => "OplogStartMissing",
            RollbackError::ExceededTimeLimit { .. } => "ExceededTimeLimit",
            RollbackError::NoMatchingDocument { .. } => "NoMatchingDocument",
            RollbackError::OplogRead { .. } => "OplogRead",
            RollbackError::UndoFailed(_) => "UndoFailed",
            RollbackError::ShutdownInProgress => "ShutdownInProgress",
        }
    }
}

impl fmt::Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackError::InvalidSyncSource => f.write_str("remote oplog empty or unreadable"),
            RollbackError::OplogStartMissing { .. } => f.write_str("no oplog during initsync"),
            RollbackError::ExceededTimeLimit {
                diff_secs,
                limit_secs,
            } => write!(
                f,
                "rollback error: not willing to roll back more than {limit_secs} seconds of data \
                 (diff in end of log times: {diff_secs} seconds)"
            ),
            RollbackError::NoMatchingDocument {
                side: OplogSide::Local,
                scanned,
            } => write!(f, "RS101 reached beginning of local oplog (scanned {scanned})"),
            RollbackError::NoMatchingDocument {
                side: OplogSide::Remote,
                scanned,
            } => write!(f, "RS100 reached beginning of remote oplog (scanned {scanned})"),
            RollbackError::OplogRead { side, source } => {
                write!(f, "failed reading {side} oplog: {source:#}")
            }
            RollbackError::UndoFailed(err) => write!(f, "rollback of local operation failed: {err:#}"),
            RollbackError::ShutdownInProgress => f.write_str("rollback interrupted by shutdown"),
        }
    }
}

impl std::error::Error for RollbackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RollbackError::OplogStartMissing { source: Some(err) }
            | RollbackError::OplogRead { source: err, .. }
            | RollbackError::UndoFailed(err) => Some(&**err),
            _ => None,
        }
    }
}

/// Failure reported by the undo callback.
#[derive(Debug)]
pub enum UndoError {
    /// The document behind this entry needs no further undo work. The scan
    /// carries on as if the undo succeeded.
    NothingToUndo,
    /// Anything else; aborts the scan.
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for UndoError {
    fn from(value: anyhow::Error) -> Self {
        Self::Failed(value)
    }
}

/// Tuning for one common-point search.
#[derive(Clone, Debug)]
pub struct RollbackConfig {
    /// Refuse to roll back when the local log leads the remote log by more
    /// than this many seconds.
    pub max_rollback_window_secs: i64,
    /// Checked before each remote entry is fed into the scan.
    pub shutdown: Option<Arc<AtomicBool>>,
}

impl RollbackConfig {
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_rollback_window_secs: DEFAULT_MAX_ROLLBACK_WINDOW_SECS,
            shutdown: None,
        }
    }
}
