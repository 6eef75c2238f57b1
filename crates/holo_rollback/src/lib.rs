//! Rollback common-point search.
//!
//! When a replica diverges from its sync source it has to find the newest
//! operation both logs agree on before it can undo its local-only writes.
//! This crate walks the local log backward against the remote log, hands
//! every local entry that must be undone to a caller-supplied callback, and
//! returns the common point. Storage of the logs and the undo work itself
//! stay with the caller, behind `OplogInterface` and the undo callback.

pub mod rollback;
