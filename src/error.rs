//! Error taxonomy for the orchestrator.
//!
//! Connection and bootstrap errors are fatal for the whole run; schema and
//! reconciliation errors are fatal only for the table they occurred on and
//! are aggregated into the run summary instead of propagating.

use crate::reconcile::Strategy;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Network or auth failure against an endpoint. Not retried here;
    /// the caller decides retry policy.
    #[error("connection to {endpoint} failed: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: mysql_async::Error,
    },

    /// The source definition could not be parsed, or the target rejected
    /// the create statement for a reason other than "already exists".
    #[error("schema replication failed for table {table}: {message}")]
    SchemaReplication { table: String, message: String },

    /// The external reconciliation engine exited non-zero or could not
    /// be launched.
    #[error("reconciliation of table {table} failed ({strategy}): {message}")]
    ReconciliationFailure {
        table: String,
        strategy: Strategy,
        message: String,
    },

    /// The external reconciliation engine did not exit within the
    /// configured timeout and was killed.
    #[error("reconciliation of table {table} ({strategy}) timed out after {timeout_secs}s")]
    ReconciliationTimeout {
        table: String,
        strategy: Strategy,
        timeout_secs: u64,
    },

    /// Replication bootstrap failed; the target's apply thread is left
    /// stopped, never half-configured.
    #[error("replication bootstrap failed during {stage}: {message}")]
    Bootstrap {
        stage: &'static str,
        message: String,
    },
}
