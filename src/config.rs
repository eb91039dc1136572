//! Run configuration.
//!
//! The CLI resolves flags and environment once at startup into a
//! [`SyncConfig`] that is passed by reference to every component; no
//! component reads process environment directly.

use crate::reconcile::{ConflictPolicy, Strategy};
use crate::replication::BootstrapOpts;
use anyhow::Context;
use std::path::PathBuf;

/// Configuration for one orchestrator run.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Reconciliation strategy applied to every table.
    pub strategy: Strategy,
    /// Worker-pool size; at most this many table pipelines run at once.
    pub workers: usize,
    /// Per-subprocess timeout in seconds.
    pub timeout_secs: u64,
    /// Chunk size for the checksum strategy.
    pub chunk_size: u32,
    /// Conflict column for bidirectional direct reconciliation.
    /// Operator-supplied and unvalidated; never inferred from the schema.
    pub conflict_column: Option<String>,
    /// Conflict policy for the direct strategy.
    pub conflict_policy: ConflictPolicy,
    /// Pass --print instead of --execute to the sync tool.
    pub print_only: bool,
    /// Path of the external row-reconciliation tool.
    pub sync_tool: String,
    /// Path of the external checksum tool.
    pub checksum_tool: String,
    /// Where to write the machine-readable run summary, if anywhere.
    pub summary_json: Option<PathBuf>,
    /// Replication bootstrap parameters; required by the replicated
    /// strategy, unused otherwise.
    pub bootstrap: Option<BootstrapOpts>,
}

impl SyncConfig {
    /// Reject option combinations the external tools would fail on later.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("worker count must be at least 1");
        }
        if self.strategy == Strategy::Direct
            && self.conflict_policy == ConflictPolicy::NewestWins
            && self.conflict_column.is_none()
        {
            anyhow::bail!(
                "the newest-wins conflict policy requires --conflict-column; \
                 no default is inferred from the schema"
            );
        }
        if self.strategy == Strategy::Replicated && self.bootstrap.is_none() {
            anyhow::bail!("the replicated strategy requires replication bootstrap options");
        }
        Ok(())
    }
}

/// Parse a duration string like "1h", "30m", "300s", "300" into seconds.
/// Supports:
/// - Plain numbers (interpreted as seconds): "300"
/// - Seconds suffix: "300s"
/// - Minutes suffix: "30m"
/// - Hours suffix: "1h"
pub fn parse_duration_to_secs(s: &str) -> anyhow::Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    if let Some(num_str) = s.strip_suffix('h') {
        let hours: u64 = num_str
            .parse()
            .with_context(|| format!("Invalid hours value: {num_str}"))?;
        return Ok(hours * 3600);
    }
    if let Some(num_str) = s.strip_suffix('m') {
        let minutes: u64 = num_str
            .parse()
            .with_context(|| format!("Invalid minutes value: {num_str}"))?;
        return Ok(minutes * 60);
    }
    if let Some(num_str) = s.strip_suffix('s') {
        let secs: u64 = num_str
            .parse()
            .with_context(|| format!("Invalid seconds value: {num_str}"))?;
        return Ok(secs);
    }

    s.parse::<u64>()
        .with_context(|| format!("Invalid duration value: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        SyncConfig {
            strategy: Strategy::Direct,
            workers: 4,
            timeout_secs: 600,
            chunk_size: 1000,
            conflict_column: None,
            conflict_policy: ConflictPolicy::SourceWins,
            print_only: false,
            sync_tool: "pt-table-sync".to_string(),
            checksum_tool: "pt-table-checksum".to_string(),
            summary_json: None,
            bootstrap: None,
        }
    }

    #[test]
    fn parses_plain_seconds() {
        assert_eq!(parse_duration_to_secs("300").unwrap(), 300);
        assert_eq!(parse_duration_to_secs("300s").unwrap(), 300);
    }

    #[test]
    fn parses_minutes_and_hours() {
        assert_eq!(parse_duration_to_secs("30m").unwrap(), 1800);
        assert_eq!(parse_duration_to_secs("2h").unwrap(), 7200);
    }

    #[test]
    fn rejects_garbage_durations() {
        assert!(parse_duration_to_secs("").is_err());
        assert!(parse_duration_to_secs("abc").is_err());
        assert!(parse_duration_to_secs("10x").is_err());
    }

    #[test]
    fn newest_wins_requires_conflict_column() {
        let mut cfg = config();
        cfg.conflict_policy = ConflictPolicy::NewestWins;
        assert!(cfg.validate().is_err());

        cfg.conflict_column = Some("updated_at".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn replicated_requires_bootstrap_opts() {
        let mut cfg = config();
        cfg.strategy = Strategy::Replicated;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_workers_rejected() {
        let mut cfg = config();
        cfg.workers = 0;
        assert!(cfg.validate().is_err());
    }
}
