//! Operator tooling for the rollback and auto-split engines.
//!
//! - `rollback`: find the common point of two JSON oplog files and list the
//!   local entries that would be undone.
//! - `autosplit-sim`: drive write batches through the auto-splitter against
//!   an in-memory cluster and report the resulting chunk layout.

mod autosplit_sim;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_rollback::rollback::{
    sync_rollback_local_operations_with_config, InMemoryOplog, OplogEntry, RollbackConfig,
    Timestamp, DEFAULT_MAX_ROLLBACK_WINDOW_SECS,
};
use serde::Serialize;

use crate::autosplit_sim::SimArgs;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-ctl")]
#[command(about = "Rollback and auto-split tooling", long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Find the rollback common point between a local and a remote oplog.
    Rollback(RollbackArgs),
    /// Simulate write-driven chunk auto-splitting on an in-memory cluster.
    AutosplitSim(SimArgs),
}

#[derive(Parser, Debug, Clone)]
struct RollbackArgs {
    /// JSON array of local oplog entries.
    #[arg(long)]
    local: PathBuf,

    /// JSON array of remote (sync source) oplog entries.
    #[arg(long)]
    remote: PathBuf,

    /// Refuse to roll back more than this many seconds of local history.
    #[arg(long, env = "HOLO_ROLLBACK_MAX_WINDOW_SECS", default_value_t = DEFAULT_MAX_ROLLBACK_WINDOW_SECS)]
    max_window_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
struct CommonPointView {
    ts: Timestamp,
    term: i64,
    record_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
struct RollbackReport {
    common_point: CommonPointView,
    rolled_back: Vec<OplogEntry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable JSON.
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Rollback(args) => {
            let report = run_rollback(&args)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::AutosplitSim(args) => {
            let report = autosplit_sim::run(args).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

/// Read a JSON array of oplog documents. Order in the file does not matter.
fn load_oplog(path: &Path, name: &str) -> anyhow::Result<InMemoryOplog> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read oplog file {}", path.display()))?;
    let docs: Vec<serde_json::Value> = serde_json::from_str(&text)
        .with_context(|| format!("parse oplog file {}", path.display()))?;
    let entries = docs
        .into_iter()
        .enumerate()
        .map(|(idx, doc)| {
            OplogEntry::from_document(doc)
                .with_context(|| format!("entry {idx} of {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(InMemoryOplog::from_entries(name, entries))
}

fn run_rollback(args: &RollbackArgs) -> anyhow::Result<RollbackReport> {
    let local = load_oplog(&args.local, "local")?;
    let remote = load_oplog(&args.remote, "remote")?;
    tracing::info!(
        local_entries = local.len(),
        remote_entries = remote.len(),
        max_window_secs = args.max_window_secs,
        "searching for rollback common point"
    );

    let cfg = RollbackConfig {
        max_rollback_window_secs: args.max_window_secs,
        shutdown: None,
    };
    let mut rolled_back = Vec::new();
    let result = sync_rollback_local_operations_with_config(
        &local,
        &remote,
        |entry: &OplogEntry| {
            rolled_back.push(entry.clone());
            Ok(())
        },
        &cfg,
    );
    let point = match result {
        Ok(point) => point,
        Err(err) => {
            let code = err.code();
            return Err(anyhow::Error::new(err)).context(format!("rollback failed ({code})"));
        }
    };

    Ok(RollbackReport {
        common_point: CommonPointView {
            ts: point.op_time.ts,
            term: point.op_time.term,
            record_id: point.record_id.map(|id| id.0),
        },
        rolled_back,
    })
}
