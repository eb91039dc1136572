//! Command-line interface for table-sync
//!
//! # Usage Examples
//!
//! ## One-shot reconciliation
//! ```bash
//! # Diff every table and delegate diverged ones to pt-table-sync
//! table-sync sync --strategy direct \
//!   --src-host db1 --src-password secret --src-db shop \
//!   --tgt-host db2 --tgt-password secret
//!
//! # Bidirectional with an operator-chosen conflict column
//! table-sync sync --strategy direct \
//!   --conflict-policy newest-wins --conflict-column updated_at \
//!   --src-host db1 --src-password secret --src-db shop \
//!   --tgt-host db2 --tgt-password secret
//! ```
//!
//! ## Checksum-based reconciliation
//! ```bash
//! table-sync sync --strategy checksum --chunk-size 1000 --timeout 30m \
//!   --src-host db1 --src-password secret --src-db shop \
//!   --tgt-host db2 --tgt-password secret
//! ```
//!
//! ## Replication bootstrap
//! ```bash
//! table-sync bootstrap \
//!   --src-host db1 --src-password secret --src-db shop \
//!   --tgt-host db2 --tgt-password secret \
//!   --repl-user repl --repl-password replsecret
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use table_sync::replication::MysqlReplicaAdmin;
use table_sync::{
    config, connect, orchestrator, BootstrapOpts, Bootstrapper, ConflictPolicy, SourceOpts,
    Strategy, SyncConfig, TargetOpts,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "table-sync")]
#[command(about = "Reconcile MySQL tables between a source and a target server")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover source tables, replicate missing schemas, and reconcile
    /// table contents onto the target
    Sync {
        /// Source server connection options
        #[command(flatten)]
        source: SourceOpts,

        /// Target server connection options
        #[command(flatten)]
        target: TargetOpts,

        /// Reconciliation strategy
        #[arg(long, value_enum, default_value = "direct")]
        strategy: Strategy,

        /// Worker-pool size; at most this many table pipelines run
        /// concurrently
        #[arg(long, default_value = "4")]
        workers: usize,

        /// Per-subprocess timeout
        /// Format: duration in seconds or with units like "30m", "2h"
        #[arg(long, default_value = "600")]
        timeout: String,

        /// Chunk size for the checksum strategy
        #[arg(long, default_value = "1000")]
        chunk_size: u32,

        /// Conflict policy for the direct strategy
        #[arg(long, value_enum, default_value = "source-wins")]
        conflict_policy: ConflictPolicy,

        /// Conflict column for the newest-wins policy; operator-supplied,
        /// never inferred from the schema
        #[arg(long)]
        conflict_column: Option<String>,

        /// Print the statements the sync tool would run instead of
        /// executing them
        #[arg(long)]
        print: bool,

        /// Path of the external row-reconciliation tool
        #[arg(long, default_value = "pt-table-sync")]
        sync_tool: String,

        /// Path of the external checksum tool
        #[arg(long, default_value = "pt-table-checksum")]
        checksum_tool: String,

        /// Write a machine-readable run summary to this file
        #[arg(long, value_name = "PATH")]
        summary_json: Option<std::path::PathBuf>,

        /// Replication principal for the replicated strategy
        #[arg(long, required_if_eq("strategy", "replicated"))]
        repl_user: Option<String>,

        /// Replication principal's password
        #[arg(long, required_if_eq("strategy", "replicated"))]
        repl_password: Option<String>,

        /// Reconfigure the target even if it already replicates from a
        /// different master
        #[arg(long)]
        force: bool,
    },

    /// Wire the target as an asynchronous replica of the source without
    /// reconciling table contents
    Bootstrap {
        /// Source server connection options
        #[command(flatten)]
        source: SourceOpts,

        /// Target server connection options
        #[command(flatten)]
        target: TargetOpts,

        /// Replication principal to provision on the source
        #[arg(long)]
        repl_user: String,

        /// Replication principal's password
        #[arg(long)]
        repl_password: String,

        /// Also provision the principal on the target, for bidirectional
        /// replication deployments
        #[arg(long)]
        bidirectional: bool,

        /// Reconfigure the target even if it already replicates from a
        /// different master
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; finishing in-flight tables only");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Sync {
            source,
            target,
            strategy,
            workers,
            timeout,
            chunk_size,
            conflict_policy,
            conflict_column,
            print,
            sync_tool,
            checksum_tool,
            summary_json,
            repl_user,
            repl_password,
            force,
        } => {
            let bootstrap = match (repl_user, repl_password) {
                (Some(repl_user), Some(repl_password)) => Some(BootstrapOpts {
                    repl_user,
                    repl_password,
                    force,
                    bidirectional: false,
                }),
                _ => None,
            };

            let config = SyncConfig {
                strategy,
                workers,
                timeout_secs: config::parse_duration_to_secs(&timeout)
                    .context("Invalid --timeout value")?,
                chunk_size,
                conflict_column,
                conflict_policy,
                print_only: print,
                sync_tool,
                checksum_tool,
                summary_json,
                bootstrap,
            };
            config.validate()?;

            let summary = orchestrator::run(
                &config,
                &source.endpoint(),
                &target.endpoint(),
                cancel,
            )
            .await?;

            summary.log();
            if let Some(path) = &config.summary_json {
                summary.write_json(path)?;
            }

            // Per-table failures are independently retriable and do not
            // fail the process; only setup and bootstrap errors do.
            Ok(())
        }

        Commands::Bootstrap {
            source,
            target,
            repl_user,
            repl_password,
            bidirectional,
            force,
        } => {
            let source = source.endpoint();
            let target = target.endpoint();

            let source_pool = connect::connect(&source).await?;
            let target_pool = connect::connect(&target).await?;

            let mut src_admin = MysqlReplicaAdmin::new(source_pool.get_conn().await?);
            let mut tgt_admin = MysqlReplicaAdmin::new(target_pool.get_conn().await?);

            let mut bootstrapper = Bootstrapper::new(BootstrapOpts {
                repl_user,
                repl_password,
                force,
                bidirectional,
            });
            bootstrapper
                .run(&mut src_admin, &mut tgt_admin, &source, &cancel)
                .await?;

            tracing::info!("Bootstrap reached {:?}", bootstrapper.state());
            Ok(())
        }
    }
}
