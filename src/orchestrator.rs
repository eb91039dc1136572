//! Table synchronization orchestrator.
//!
//! Sequences the per-table pipeline (replicate schema, compare,
//! conditionally reconcile) over a bounded worker pool, aggregates every
//! table's outcome into a run summary, and runs the replication
//! bootstrapper up front for the replicated strategy.

use crate::compare::{compare, ComparisonResult};
use crate::config::SyncConfig;
use crate::connect::{connect, prepare_target};
use crate::endpoint::Endpoint;
use crate::error::SyncError;
use crate::reconcile::{reconcile, Strategy};
use crate::replication::{Bootstrapper, MysqlReplicaAdmin};
use crate::schema::{list_tables, replicate_schema, SchemaStatus};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mysql_async::Pool;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How one table's reconciliation ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ReconcileStatus {
    /// The comparator found the contents identical; the engine was not
    /// invoked.
    NotNeeded,
    Succeeded,
    Failed { message: String },
    TimedOut { timeout_secs: u64 },
}

/// Everything that happened to one table, for the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub table: String,
    pub schema: Option<SchemaStatus>,
    /// Comparator verdict; None when the strategy delegates divergence
    /// detection to the checksum engine.
    pub identical: Option<bool>,
    pub reconcile: Option<ReconcileStatus>,
    /// Schema replication or comparison failure that ended the pipeline
    /// early for this table.
    pub error: Option<String>,
}

impl TableOutcome {
    fn new(table: &str) -> Self {
        TableOutcome {
            table: table.to_string(),
            schema: None,
            identical: None,
            reconcile: None,
            error: None,
        }
    }

    /// Whether this table finished its pipeline without failure.
    pub fn ok(&self) -> bool {
        self.error.is_none()
            && !matches!(
                self.reconcile,
                Some(ReconcileStatus::Failed { .. }) | Some(ReconcileStatus::TimedOut { .. })
            )
    }

    /// One-line operator-facing description.
    pub fn describe(&self) -> String {
        if let Some(err) = &self.error {
            return format!("failed: {err}");
        }

        let mut parts = Vec::new();
        match self.schema {
            Some(SchemaStatus::Created) => parts.push("schema created".to_string()),
            Some(SchemaStatus::Existed) => parts.push("schema existed".to_string()),
            None => {}
        }
        match self.identical {
            Some(true) => parts.push("identical".to_string()),
            Some(false) => parts.push("diverged".to_string()),
            None => {}
        }
        match &self.reconcile {
            Some(ReconcileStatus::NotNeeded) => {}
            Some(ReconcileStatus::Succeeded) => parts.push("reconciled".to_string()),
            Some(ReconcileStatus::Failed { message }) => {
                parts.push(format!("reconciliation failed: {message}"))
            }
            Some(ReconcileStatus::TimedOut { timeout_secs }) => {
                parts.push(format!("reconciliation timed out after {timeout_secs}s"))
            }
            None => {}
        }
        parts.join(", ")
    }
}

/// Aggregated result of one orchestrator run. Produced even when some
/// tables failed, so operators can re-run targeted at the failed subset.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub strategy: Strategy,
    pub outcomes: Vec<TableOutcome>,
}

impl RunSummary {
    pub fn failed_tables(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.ok())
            .map(|o| o.table.as_str())
            .collect()
    }

    /// Log every table's outcome and a final tally.
    pub fn log(&self) {
        for outcome in &self.outcomes {
            if outcome.ok() {
                info!("{}: {}", outcome.table, outcome.describe());
            } else {
                error!("{}: {}", outcome.table, outcome.describe());
            }
        }

        let failed = self.failed_tables();
        if failed.is_empty() {
            info!("All {} tables processed successfully", self.outcomes.len());
        } else {
            warn!(
                "{} of {} tables failed: {}",
                failed.len(),
                self.outcomes.len(),
                failed.join(", ")
            );
        }
    }

    pub fn write_json(&self, path: &std::path::Path) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write run summary to {path:?}"))?;
        info!("Wrote run summary to {path:?}");
        Ok(())
    }
}

/// One table's schema-replicate → compare → reconcile sequence. The
/// production pipeline talks to MySQL and the external engines; tests
/// substitute mocks to exercise the worker pool.
#[async_trait]
pub trait TablePipeline: Send + Sync {
    async fn process(&self, table: &str) -> TableOutcome;
}

/// Production pipeline over a shared pool pair. Workers check out their
/// own connections per table, so no handle is ever interleaved across
/// tables.
pub struct MysqlPipeline {
    config: SyncConfig,
    source: Endpoint,
    target: Endpoint,
    source_pool: Pool,
    target_pool: Pool,
}

#[async_trait]
impl TablePipeline for MysqlPipeline {
    async fn process(&self, table: &str) -> TableOutcome {
        let mut outcome = TableOutcome::new(table);

        let mut src = match self.source_pool.get_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                outcome.error = Some(format!("source connection failed: {e}"));
                return outcome;
            }
        };
        let mut tgt = match self.target_pool.get_conn().await {
            Ok(conn) => conn,
            Err(e) => {
                outcome.error = Some(format!("target connection failed: {e}"));
                return outcome;
            }
        };

        // Without a valid target schema, comparison is meaningless; the
        // table is skipped and reported.
        match replicate_schema(table, &mut src, &mut tgt).await {
            Ok(status) => outcome.schema = Some(status),
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        }

        let comparison = match self.config.strategy {
            Strategy::Direct => match compare(table, &mut src, &mut tgt).await {
                Ok(result) => Some(result),
                Err(e) => {
                    outcome.error = Some(format!("comparison failed: {e:#}"));
                    return outcome;
                }
            },
            // Divergence detection is delegated to the checksum engine;
            // no in-memory comparison of the full row sets.
            Strategy::Checksum | Strategy::Replicated => None,
        };
        outcome.identical = comparison.as_ref().map(|c| c.identical);

        outcome.reconcile = Some(
            if needs_reconciliation(self.config.strategy, comparison.as_ref()) {
                self.dispatch(table).await
            } else {
                ReconcileStatus::NotNeeded
            },
        );

        outcome
    }
}

/// Whether the external engine must run for a table, given the strategy
/// and the comparator's verdict. Direct dispatches only on divergence;
/// the checksum strategies always dispatch and let the engine detect
/// divergence itself.
fn needs_reconciliation(strategy: Strategy, comparison: Option<&ComparisonResult>) -> bool {
    match strategy {
        Strategy::Direct => comparison.is_some_and(|c| !c.identical),
        Strategy::Checksum | Strategy::Replicated => true,
    }
}

impl MysqlPipeline {
    async fn dispatch(&self, table: &str) -> ReconcileStatus {
        match reconcile(table, &self.source, &self.target, &self.config).await {
            Ok(_) => ReconcileStatus::Succeeded,
            Err(SyncError::ReconciliationTimeout { timeout_secs, .. }) => {
                ReconcileStatus::TimedOut { timeout_secs }
            }
            Err(e) => ReconcileStatus::Failed {
                message: e.to_string(),
            },
        }
    }
}

/// Drain a queue of table names through `workers` concurrent pipelines.
///
/// At most `workers` pipelines are in flight at any moment. Once the
/// cancellation token is raised, in-flight tables finish but no new ones
/// are dispatched.
pub async fn run_table_workers(
    tables: Vec<String>,
    workers: usize,
    cancel: CancellationToken,
    pipeline: Arc<dyn TablePipeline>,
) -> Vec<TableOutcome> {
    let (tx, rx) = mpsc::unbounded_channel();
    for table in tables {
        // The receiver outlives this loop; send cannot fail here.
        let _ = tx.send(table);
    }
    drop(tx);
    let rx = Arc::new(Mutex::new(rx));

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let rx = Arc::clone(&rx);
        let cancel = cancel.clone();
        let pipeline = Arc::clone(&pipeline);

        handles.push(tokio::spawn(async move {
            let mut outcomes = Vec::new();
            loop {
                if cancel.is_cancelled() {
                    debug!("Worker {worker} stopping: cancellation requested");
                    break;
                }
                let table = { rx.lock().await.recv().await };
                let Some(table) = table else { break };

                debug!("Worker {worker} processing table `{table}`");
                outcomes.push(pipeline.process(&table).await);
            }
            outcomes
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(outcomes) => all.extend(outcomes),
            Err(e) => error!("Worker task panicked: {e}"),
        }
    }
    all
}

/// Run the full orchestration: connect, prepare the target database,
/// bootstrap replication when the strategy calls for it, then drain the
/// discovered tables through the worker pool.
///
/// Returns Ok with a summary even when individual tables failed; only
/// setup and bootstrap errors propagate.
pub async fn run(
    config: &SyncConfig,
    source: &Endpoint,
    target: &Endpoint,
    cancel: CancellationToken,
) -> anyhow::Result<RunSummary> {
    let started_at = Utc::now();

    let source_pool = connect(source).await?;
    info!("Connected to source {source}");

    let database = target
        .database
        .clone()
        .or_else(|| source.database.clone())
        .context("No target database name; pass --tgt-db or --src-db")?;
    let (target, target_pool) = prepare_target(target, &database).await?;

    if config.strategy == Strategy::Replicated {
        let opts = config
            .bootstrap
            .clone()
            .context("Replicated strategy requires replication bootstrap options")?;

        let src_conn = source_pool
            .get_conn()
            .await
            .map_err(|e| connection_error(source, e))?;
        let tgt_conn = target_pool
            .get_conn()
            .await
            .map_err(|e| connection_error(&target, e))?;

        let mut src_admin = MysqlReplicaAdmin::new(src_conn);
        let mut tgt_admin = MysqlReplicaAdmin::new(tgt_conn);
        Bootstrapper::new(opts)
            .run(&mut src_admin, &mut tgt_admin, source, &cancel)
            .await?;
    }

    let mut conn = source_pool
        .get_conn()
        .await
        .map_err(|e| connection_error(source, e))?;
    // Only the checksum strategies materialize a ledger table worth
    // hiding from discovery.
    let tables = list_tables(&mut conn, config.strategy != Strategy::Direct).await?;
    drop(conn);
    info!("Discovered {} tables on {source}", tables.len());

    let pipeline = Arc::new(MysqlPipeline {
        config: config.clone(),
        source: source.clone(),
        target: target.clone(),
        source_pool: source_pool.clone(),
        target_pool: target_pool.clone(),
    });

    let mut outcomes = run_table_workers(tables, config.workers, cancel, pipeline).await;
    outcomes.sort_by(|a, b| a.table.cmp(&b.table));

    if let Err(e) = source_pool.disconnect().await {
        warn!("Error disconnecting source pool: {e}");
    }
    if let Err(e) = target_pool.disconnect().await {
        warn!("Error disconnecting target pool: {e}");
    }

    Ok(RunSummary {
        started_at,
        finished_at: Utc::now(),
        strategy: config.strategy,
        outcomes,
    })
}

fn connection_error(endpoint: &Endpoint, source: mysql_async::Error) -> SyncError {
    SyncError::Connection {
        endpoint: endpoint.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comparison(identical: bool) -> ComparisonResult {
        ComparisonResult {
            table: "users".to_string(),
            identical,
        }
    }

    #[test]
    fn identical_tables_skip_the_engine_under_direct() {
        assert!(!needs_reconciliation(
            Strategy::Direct,
            Some(&comparison(true))
        ));
    }

    #[test]
    fn diverged_tables_are_dispatched_under_direct() {
        assert!(needs_reconciliation(
            Strategy::Direct,
            Some(&comparison(false))
        ));
    }

    #[test]
    fn checksum_strategies_always_dispatch() {
        assert!(needs_reconciliation(Strategy::Checksum, None));
        assert!(needs_reconciliation(Strategy::Replicated, None));
    }

    #[test]
    fn describe_reports_the_healthy_path() {
        let mut outcome = TableOutcome::new("users");
        outcome.schema = Some(SchemaStatus::Created);
        outcome.identical = Some(true);
        outcome.reconcile = Some(ReconcileStatus::NotNeeded);
        assert_eq!(outcome.describe(), "schema created, identical");
        assert!(outcome.ok());
    }

    #[test]
    fn describe_reports_reconciled_divergence() {
        let mut outcome = TableOutcome::new("orders");
        outcome.schema = Some(SchemaStatus::Existed);
        outcome.identical = Some(false);
        outcome.reconcile = Some(ReconcileStatus::Succeeded);
        assert_eq!(outcome.describe(), "schema existed, diverged, reconciled");
        assert!(outcome.ok());
    }

    #[test]
    fn timed_out_table_is_not_ok() {
        let mut outcome = TableOutcome::new("orders");
        outcome.schema = Some(SchemaStatus::Existed);
        outcome.reconcile = Some(ReconcileStatus::TimedOut { timeout_secs: 60 });
        assert!(!outcome.ok());
        assert!(outcome.describe().contains("timed out after 60s"));
    }

    #[test]
    fn failed_tables_lists_only_failures() {
        let ok = TableOutcome {
            table: "users".to_string(),
            schema: Some(SchemaStatus::Existed),
            identical: Some(true),
            reconcile: Some(ReconcileStatus::NotNeeded),
            error: None,
        };
        let failed = TableOutcome {
            table: "orders".to_string(),
            schema: Some(SchemaStatus::Existed),
            identical: Some(false),
            reconcile: Some(ReconcileStatus::Failed {
                message: "engine exited with 2".to_string(),
            }),
            error: None,
        };
        let summary = RunSummary {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            strategy: Strategy::Direct,
            outcomes: vec![ok, failed],
        };
        assert_eq!(summary.failed_tables(), vec!["orders"]);
    }

    #[test]
    fn summary_serializes_to_json() {
        let summary = RunSummary {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            strategy: Strategy::Checksum,
            outcomes: vec![TableOutcome::new("users")],
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"strategy\":\"checksum\""));
        assert!(json.contains("\"table\":\"users\""));
    }

    #[test]
    fn summary_json_is_written_to_disk() {
        let summary = RunSummary {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            strategy: Strategy::Direct,
            outcomes: vec![TableOutcome::new("users")],
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        summary.write_json(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"table\": \"users\""));
    }
}
