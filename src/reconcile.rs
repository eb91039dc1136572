//! Reconciliation dispatcher.
//!
//! Drives the external row-reconciliation and checksum engines as
//! subprocesses. Their diff/merge algorithms are black boxes: this module
//! only builds command lines, enforces a timeout, logs their stdout as an
//! advisory report, and reads the exit code as the success signal.
//! Diagnostic output on stderr is never classified as failure on its own.

use crate::config::SyncConfig;
use crate::endpoint::Endpoint;
use crate::error::SyncError;
use clap::ValueEnum;
use serde::Serialize;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

/// Per-deployment reconciliation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Invoke the sync tool only for tables the comparator reported as
    /// diverged.
    Direct,
    /// Always invoke the checksum tool, then replicate divergent chunks
    /// from the ledger. Bounded memory; scales to large tables.
    Checksum,
    /// Bootstrap asynchronous replication first, then converge once via
    /// the checksum pair; replication carries ongoing changes.
    Replicated,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::Direct => "direct",
            Strategy::Checksum => "checksum",
            Strategy::Replicated => "replicated",
        };
        f.write_str(s)
    }
}

/// How the direct strategy resolves rows that diverged on both endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Bidirectional sync preferring the most-recently-modified row, as
    /// ordered by the operator-supplied conflict column.
    NewestWins,
    /// One-directional sync from source to target.
    SourceWins,
    /// One-directional sync from target to source.
    TargetWins,
}

/// Successful reconciliation of one table.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub table: String,
    pub strategy: Strategy,
    /// Human-readable report from the external tool; logged, not parsed.
    pub report: String,
}

/// Reconcile one table between the two endpoints according to the
/// configured strategy. Both endpoints must be database-bound.
pub async fn reconcile(
    table: &str,
    source: &Endpoint,
    target: &Endpoint,
    config: &SyncConfig,
) -> Result<ReconcileOutcome, SyncError> {
    let report = match config.strategy {
        Strategy::Direct => {
            let argv = direct_command(config, source, target, table);
            run_tool(&argv, config.timeout_secs, table, config.strategy).await?
        }
        // The replicated strategy reuses the checksum pair for its one-off
        // initial convergence; steady-state changes flow over replication.
        Strategy::Checksum | Strategy::Replicated => {
            let checksum = checksum_command(config, source, table);
            let checksum_report =
                run_tool(&checksum, config.timeout_secs, table, config.strategy).await?;

            let sync = ledger_sync_command(config, source, target, table);
            let sync_report = run_tool(&sync, config.timeout_secs, table, config.strategy).await?;

            format!("{checksum_report}{sync_report}")
        }
    };

    Ok(ReconcileOutcome {
        table: table.to_string(),
        strategy: config.strategy,
        report,
    })
}

/// Build the direct sync command line: the sync tool, a mode flag, and a
/// DSN pair ordered so the authoritative side comes first.
pub(crate) fn direct_command(
    config: &SyncConfig,
    source: &Endpoint,
    target: &Endpoint,
    table: &str,
) -> Vec<String> {
    let mut argv = vec![config.sync_tool.clone(), mode_flag(config)];

    match config.conflict_policy {
        ConflictPolicy::NewestWins => {
            argv.push("--bidirectional".to_string());
            argv.push("--conflict-column".to_string());
            // validate() guarantees presence for this policy.
            argv.push(config.conflict_column.clone().unwrap_or_default());
            argv.push("--conflict-comparison".to_string());
            argv.push("newest".to_string());
            argv.push(source.dsn(table));
            argv.push(target.dsn(table));
        }
        ConflictPolicy::SourceWins => {
            argv.push(source.dsn(table));
            argv.push(target.dsn(table));
        }
        ConflictPolicy::TargetWins => {
            argv.push(target.dsn(table));
            argv.push(source.dsn(table));
        }
    }

    argv
}

/// Build the checksum-generation command line. The engine materializes
/// per-chunk checksums into the ledger table on the source, recreating
/// and emptying it at the start of each run.
pub(crate) fn checksum_command(config: &SyncConfig, source: &Endpoint, table: &str) -> Vec<String> {
    let database = source.database.clone().unwrap_or_default();
    vec![
        config.checksum_tool.clone(),
        format!("--host={}", source.host),
        format!("--port={}", source.port),
        format!("--user={}", source.user),
        format!("--password={}", source.password),
        "--databases".to_string(),
        database.clone(),
        "--tables".to_string(),
        table.to_string(),
        "--replicate".to_string(),
        ledger_table(&database),
        format!("--chunk-size={}", config.chunk_size),
        "--create-replicate-table".to_string(),
        "--empty-replicate-table".to_string(),
        "--no-check-binlog-format".to_string(),
    ]
}

/// Build the ledger-consuming sync command line: replicate only the
/// chunks the checksum pass flagged as divergent onto the target.
pub(crate) fn ledger_sync_command(
    config: &SyncConfig,
    source: &Endpoint,
    target: &Endpoint,
    table: &str,
) -> Vec<String> {
    let database = source.database.clone().unwrap_or_default();
    vec![
        config.sync_tool.clone(),
        mode_flag(config),
        "--replicate".to_string(),
        ledger_table(&database),
        "--sync-to-master".to_string(),
        target.dsn(table),
    ]
}

/// Name of the engine-owned checksum ledger table.
pub(crate) const LEDGER_TABLE: &str = "checksums";

/// Ledger table name, derived deterministically from the source database.
fn ledger_table(database: &str) -> String {
    format!("{database}.{LEDGER_TABLE}")
}

fn mode_flag(config: &SyncConfig) -> String {
    if config.print_only {
        "--print".to_string()
    } else {
        "--execute".to_string()
    }
}

/// Run one external tool invocation to completion, killing it on timeout.
/// Returns captured stdout on success.
async fn run_tool(
    argv: &[String],
    timeout_secs: u64,
    table: &str,
    strategy: Strategy,
) -> Result<String, SyncError> {
    let failure = |message: String| SyncError::ReconciliationFailure {
        table: table.to_string(),
        strategy,
        message,
    };

    let (program, args) = argv
        .split_first()
        .ok_or_else(|| failure("empty command line".to_string()))?;

    info!("Running {program} for table `{table}` ({strategy})");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| failure(format!("failed to launch {program}: {e}")))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let finished = async {
        let stdout_read = async {
            let mut buf = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                pipe.read_to_string(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let stderr_read = async {
            let mut buf = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                pipe.read_to_string(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let (stdout, stderr) = tokio::try_join!(stdout_read, stderr_read)?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, stdout, stderr))
    };

    let (status, stdout, stderr) =
        match tokio::time::timeout(Duration::from_secs(timeout_secs), finished).await {
            Ok(result) => result.map_err(|e| failure(format!("i/o error running {program}: {e}")))?,
            Err(_) => {
                return Err(SyncError::ReconciliationTimeout {
                    table: table.to_string(),
                    strategy,
                    timeout_secs,
                });
            }
        };

    if !stdout.is_empty() {
        info!("{program} report for `{table}`:\n{}", stdout.trim_end());
    }
    // Progress logging from the tool; advisory, never fatal by itself.
    if !stderr.is_empty() {
        warn!("{program} stderr for `{table}`:\n{}", stderr.trim_end());
    }

    if status.success() {
        Ok(stdout)
    } else {
        Err(failure(format!(
            "{program} exited with {status}: {}",
            stderr.trim_end()
        )))
    }
}
