//! table-sync
//!
//! A library and CLI for reconciling the contents and schema of a set of
//! tables between a source and a target MySQL server.
//!
//! # Features
//!
//! - Schema replication: discover source tables and create missing ones
//!   on the target from their canonical definitions
//! - Row-level diff with delegated reconciliation: compare table contents
//!   and hand diverged tables to pt-table-sync
//! - Checksum-based reconciliation: bounded-memory convergence for large
//!   tables via pt-table-checksum's chunk ledger
//! - Replication bootstrap: provision a replication principal, capture
//!   binlog coordinates, and wire the target as an asynchronous replica
//!
//! # CLI Usage
//!
//! ```bash
//! # One-shot reconciliation, diffing each table before delegating
//! table-sync sync --strategy direct \
//!   --src-host db1 --src-db shop \
//!   --tgt-host db2
//!
//! # Checksum-based reconciliation for large tables
//! table-sync sync --strategy checksum --chunk-size 1000 \
//!   --src-host db1 --src-db shop \
//!   --tgt-host db2
//!
//! # Bootstrap the target as a replica, then converge once
//! table-sync sync --strategy replicated \
//!   --src-host db1 --src-db shop \
//!   --tgt-host db2 \
//!   --repl-user repl --repl-password secret
//!
//! # Replication wiring only
//! table-sync bootstrap \
//!   --src-host db1 --src-db shop \
//!   --tgt-host db2 \
//!   --repl-user repl --repl-password secret
//! ```

use clap::Parser;

pub mod compare;
pub mod config;
pub mod connect;
pub mod endpoint;
pub mod error;
pub mod orchestrator;
pub mod reconcile;
pub mod replication;
pub mod schema;

pub use config::SyncConfig;
pub use endpoint::Endpoint;
pub use error::SyncError;
pub use orchestrator::{RunSummary, TableOutcome, TablePipeline};
pub use reconcile::{ConflictPolicy, Strategy};
pub use replication::{BootstrapOpts, BootstrapState, Bootstrapper};

/// Source server connection options
#[derive(Parser, Clone, Debug)]
pub struct SourceOpts {
    /// Source server hostname
    #[arg(long, default_value = "127.0.0.1", env = "SRC_HOST")]
    pub src_host: String,

    /// Source server port
    #[arg(long, default_value = "3306", env = "SRC_PORT")]
    pub src_port: u16,

    /// Source server user
    #[arg(long, default_value = "root", env = "SRC_USER")]
    pub src_user: String,

    /// Source server password
    #[arg(long, env = "SRC_PASSWORD")]
    pub src_password: String,

    /// Source database to synchronize from
    #[arg(long = "src-db", env = "SRC_DB")]
    pub src_database: String,
}

impl SourceOpts {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.src_host.clone(),
            port: self.src_port,
            user: self.src_user.clone(),
            password: self.src_password.clone(),
            database: Some(self.src_database.clone()),
        }
    }
}

/// Target server connection options
#[derive(Parser, Clone, Debug)]
pub struct TargetOpts {
    /// Target server hostname
    #[arg(long, default_value = "127.0.0.1", env = "TGT_HOST")]
    pub tgt_host: String,

    /// Target server port
    #[arg(long, default_value = "3306", env = "TGT_PORT")]
    pub tgt_port: u16,

    /// Target server user
    #[arg(long, default_value = "root", env = "TGT_USER")]
    pub tgt_user: String,

    /// Target server password
    #[arg(long, env = "TGT_PASSWORD")]
    pub tgt_password: String,

    /// Target database; created if absent, defaults to the source
    /// database name
    #[arg(long = "tgt-db", env = "TGT_DB")]
    pub tgt_database: Option<String>,
}

impl TargetOpts {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.tgt_host.clone(),
            port: self.tgt_port,
            user: self.tgt_user.clone(),
            password: self.tgt_password.clone(),
            database: self.tgt_database.clone(),
        }
    }
}
