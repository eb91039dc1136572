//! Replication bootstrapper.
//!
//! Wires the target as an asynchronous replica of the source: provisions
//! a replication principal, captures the source's binlog coordinates, and
//! reconfigures the target's replication channel. Runs once, before any
//! table-level concurrency, as an explicit state machine. Any failure
//! after the apply thread has been stopped leaves replication stopped,
//! never half-configured.

use crate::endpoint::Endpoint;
use crate::error::SyncError;
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Row};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bootstrap states. Terminal states are `Active` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Idle,
    StoppingApply,
    Provisioning,
    CapturingCoordinates,
    Reconfiguring,
    Starting,
    Active,
    Failed,
}

/// A point in the source's binary log. Captured after the target's apply
/// thread is stopped and consumed immediately by the reconfiguration;
/// the capture is a snapshot read with no lock, so the window between
/// capture and reconfiguration must be kept as small as possible. It is
/// not transactionally exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterCoordinates {
    pub log_file: String,
    pub log_position: u64,
}

/// The target's currently configured replication channel, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaChannel {
    pub master_host: String,
    pub sql_thread_running: bool,
}

/// Parameters for one bootstrap invocation.
#[derive(Debug, Clone)]
pub struct BootstrapOpts {
    /// Name of the replication principal to provision on the source.
    pub repl_user: String,
    pub repl_password: String,
    /// Reconfigure even if the target already replicates from a
    /// different master.
    pub force: bool,
    /// Also provision the principal on the target, for deployments that
    /// will wire replication in both directions.
    pub bidirectional: bool,
}

/// Engine-facing seam for the bootstrap sequence. Production code talks
/// to MySQL through [`MysqlReplicaAdmin`]; tests inject failures through
/// a mock.
#[async_trait]
pub trait ReplicaAdmin: Send {
    /// The currently configured replication channel, or None when the
    /// server has never been configured as a replica.
    async fn replica_channel(&mut self) -> anyhow::Result<Option<ReplicaChannel>>;

    /// Stop the replication apply thread. Idempotent.
    async fn stop_apply(&mut self) -> anyhow::Result<()>;

    /// Enable row-based binlogging and cascading replica updates.
    /// Both settings are idempotent.
    async fn enable_row_binlog(&mut self) -> anyhow::Result<()>;

    async fn user_exists(&mut self, name: &str) -> anyhow::Result<bool>;

    /// Create the replication principal with the minimal replicate-only
    /// grant.
    async fn create_replication_user(&mut self, name: &str, password: &str) -> anyhow::Result<()>;

    /// Read the current binlog file and position.
    async fn master_coordinates(&mut self) -> anyhow::Result<MasterCoordinates>;

    /// Bind this server to the given master in a single statement.
    async fn configure_replica(
        &mut self,
        master_host: &str,
        user: &str,
        password: &str,
        coordinates: &MasterCoordinates,
    ) -> anyhow::Result<()>;

    /// Start the replication threads.
    async fn start_replica(&mut self) -> anyhow::Result<()>;
}

/// Quote a string literal for statements the server refuses to prepare
/// with placeholders (account management, CHANGE MASTER).
fn quote_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "''")
}

/// [`ReplicaAdmin`] backed by a live MySQL connection.
pub struct MysqlReplicaAdmin {
    conn: Conn,
}

impl MysqlReplicaAdmin {
    pub fn new(conn: Conn) -> Self {
        MysqlReplicaAdmin { conn }
    }
}

#[async_trait]
impl ReplicaAdmin for MysqlReplicaAdmin {
    async fn replica_channel(&mut self) -> anyhow::Result<Option<ReplicaChannel>> {
        let row: Option<Row> = self.conn.query_first("SHOW SLAVE STATUS").await?;
        Ok(row.map(|row| ReplicaChannel {
            master_host: row.get("Master_Host").unwrap_or_default(),
            sql_thread_running: row
                .get::<String, _>("Slave_SQL_Running")
                .map(|v| v == "Yes")
                .unwrap_or(false),
        }))
    }

    async fn stop_apply(&mut self) -> anyhow::Result<()> {
        self.conn.query_drop("STOP SLAVE SQL_THREAD").await?;
        Ok(())
    }

    async fn enable_row_binlog(&mut self) -> anyhow::Result<()> {
        self.conn
            .query_drop("SET GLOBAL binlog_format = 'ROW'")
            .await?;
        // log_slave_updates is not dynamic on older servers; a refusal
        // here only matters for cascading topologies, so warn and go on.
        if let Err(e) = self.conn.query_drop("SET GLOBAL log_slave_updates = ON").await {
            warn!("Could not enable log_slave_updates (read-only on this server?): {e}");
        }
        Ok(())
    }

    async fn user_exists(&mut self, name: &str) -> anyhow::Result<bool> {
        let count: Option<i64> = self
            .conn
            .exec_first("SELECT COUNT(*) FROM mysql.user WHERE User = ?", (name,))
            .await?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn create_replication_user(&mut self, name: &str, password: &str) -> anyhow::Result<()> {
        let name = quote_literal(name);
        self.conn
            .query_drop(format!(
                "CREATE USER '{name}'@'%' IDENTIFIED BY '{}'",
                quote_literal(password)
            ))
            .await?;
        self.conn
            .query_drop(format!("GRANT REPLICATION SLAVE ON *.* TO '{name}'@'%'"))
            .await?;
        self.conn.query_drop("FLUSH PRIVILEGES").await?;
        Ok(())
    }

    async fn master_coordinates(&mut self) -> anyhow::Result<MasterCoordinates> {
        let row: Option<Row> = self.conn.query_first("SHOW MASTER STATUS").await?;
        let row = row.ok_or_else(|| {
            anyhow::anyhow!("SHOW MASTER STATUS returned nothing; is binary logging enabled?")
        })?;

        let log_file: String = row
            .get("File")
            .ok_or_else(|| anyhow::anyhow!("master status is missing the File column"))?;
        let log_position: u64 = row
            .get("Position")
            .ok_or_else(|| anyhow::anyhow!("master status is missing the Position column"))?;

        Ok(MasterCoordinates {
            log_file,
            log_position,
        })
    }

    async fn configure_replica(
        &mut self,
        master_host: &str,
        user: &str,
        password: &str,
        coordinates: &MasterCoordinates,
    ) -> anyhow::Result<()> {
        self.conn
            .query_drop(format!(
                "CHANGE MASTER TO MASTER_HOST = '{}', \
                 MASTER_USER = '{}', \
                 MASTER_PASSWORD = '{}', \
                 MASTER_LOG_FILE = '{}', \
                 MASTER_LOG_POS = {}",
                quote_literal(master_host),
                quote_literal(user),
                quote_literal(password),
                quote_literal(&coordinates.log_file),
                coordinates.log_position
            ))
            .await?;
        Ok(())
    }

    async fn start_replica(&mut self) -> anyhow::Result<()> {
        self.conn.query_drop("START SLAVE").await?;
        Ok(())
    }
}

/// The bootstrap state machine. One instance per invocation; no
/// automatic retry.
pub struct Bootstrapper {
    opts: BootstrapOpts,
    state: BootstrapState,
}

impl Bootstrapper {
    pub fn new(opts: BootstrapOpts) -> Self {
        Bootstrapper {
            opts,
            state: BootstrapState::Idle,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Run the bootstrap sequence against the given endpoints.
    ///
    /// Cancellation before the apply thread is stopped aborts cleanly;
    /// cancellation afterwards runs the same compensating path as a
    /// failure, leaving the target's replication stopped.
    pub async fn run(
        &mut self,
        source: &mut dyn ReplicaAdmin,
        target: &mut dyn ReplicaAdmin,
        source_endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Bootstrap {
                stage: "idle",
                message: "cancelled before bootstrap started".to_string(),
            });
        }

        // Never blindly overwrite an already-configured channel.
        let channel = target.replica_channel().await.map_err(|e| {
            self.state = BootstrapState::Failed;
            SyncError::Bootstrap {
                stage: "inspecting",
                message: format!("{e:#}"),
            }
        })?;
        if let Some(channel) = &channel {
            let same_master =
                channel.master_host.is_empty() || channel.master_host == source_endpoint.host;
            // A running channel has its own position; rebinding it to
            // freshly captured coordinates would skip every event between
            // that position and the capture point. So an active channel
            // needs --force even when it already points at the source.
            let configured = channel.sql_thread_running || !same_master;
            if configured && !self.opts.force {
                self.state = BootstrapState::Failed;
                let detail = if channel.sql_thread_running {
                    format!(
                        "target has an active replication channel to {}",
                        channel.master_host
                    )
                } else {
                    format!("target already replicates from {}", channel.master_host)
                };
                return Err(SyncError::Bootstrap {
                    stage: "inspecting",
                    message: format!("{detail}; pass --force to reconfigure"),
                });
            }
            if configured {
                warn!(
                    "Reconfiguring target away from existing channel to {} (forced)",
                    channel.master_host
                );
            }
        }

        self.state = BootstrapState::StoppingApply;
        if let Err(e) = target.stop_apply().await {
            return self.fail(target, "stopping-apply", e).await;
        }
        info!("Target apply thread stopped");

        self.state = BootstrapState::Provisioning;
        if let Err(e) = self.provision(source, target, cancel).await {
            return self.fail(target, "provisioning", e).await;
        }

        if cancel.is_cancelled() {
            return self
                .fail(target, "provisioning", anyhow::anyhow!("cancelled"))
                .await;
        }

        // Captured after the apply thread stopped and consumed right away
        // by the reconfiguration; the window in between must stay small.
        self.state = BootstrapState::CapturingCoordinates;
        let coordinates = match source.master_coordinates().await {
            Ok(c) => c,
            Err(e) => return self.fail(target, "capturing-coordinates", e).await,
        };
        info!(
            "Captured master coordinates {}:{}",
            coordinates.log_file, coordinates.log_position
        );

        self.state = BootstrapState::Reconfiguring;
        if let Err(e) = target
            .configure_replica(
                &source_endpoint.host,
                &self.opts.repl_user,
                &self.opts.repl_password,
                &coordinates,
            )
            .await
        {
            return self.fail(target, "reconfiguring", e).await;
        }

        self.state = BootstrapState::Starting;
        if let Err(e) = target.start_replica().await {
            return self.fail(target, "starting", e).await;
        }

        self.state = BootstrapState::Active;
        info!("Replication bootstrap complete; target is replicating");
        Ok(())
    }

    async fn provision(
        &self,
        source: &mut dyn ReplicaAdmin,
        target: &mut dyn ReplicaAdmin,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        source.enable_row_binlog().await?;
        provision_user(source, &self.opts).await?;

        if cancel.is_cancelled() {
            anyhow::bail!("cancelled");
        }

        if self.opts.bidirectional {
            provision_user(target, &self.opts).await?;
        }
        Ok(())
    }

    /// Compensating path for any failure after the apply thread was
    /// stopped: leave the target's replication stopped, record Failed.
    async fn fail(
        &mut self,
        target: &mut dyn ReplicaAdmin,
        stage: &'static str,
        error: anyhow::Error,
    ) -> Result<(), SyncError> {
        if let Err(e) = target.stop_apply().await {
            warn!("Could not stop target replication while failing bootstrap: {e:#}");
        }
        self.state = BootstrapState::Failed;
        Err(SyncError::Bootstrap {
            stage,
            message: format!("{error:#}"),
        })
    }
}

/// Create the replication principal if it does not already exist.
async fn provision_user(admin: &mut dyn ReplicaAdmin, opts: &BootstrapOpts) -> anyhow::Result<()> {
    if admin.user_exists(&opts.repl_user).await? {
        info!("Replication user '{}' already exists", opts.repl_user);
        return Ok(());
    }
    admin
        .create_replication_user(&opts.repl_user, &opts.repl_password)
        .await?;
    info!("Created replication user '{}'", opts.repl_user);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockAdmin {
        channel: Option<ReplicaChannel>,
        fail_on: Option<&'static str>,
        cancel_on: Option<(&'static str, CancellationToken)>,
        calls: Vec<&'static str>,
        user_present: bool,
        apply_stopped: bool,
        started: bool,
    }

    impl MockAdmin {
        fn failing_at(step: &'static str) -> Self {
            MockAdmin {
                fail_on: Some(step),
                ..Default::default()
            }
        }

        fn check(&mut self, step: &'static str) -> anyhow::Result<()> {
            self.calls.push(step);
            if let Some((cancel_step, token)) = &self.cancel_on {
                if *cancel_step == step {
                    token.cancel();
                }
            }
            if self.fail_on == Some(step) {
                anyhow::bail!("injected failure at {step}");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ReplicaAdmin for MockAdmin {
        async fn replica_channel(&mut self) -> anyhow::Result<Option<ReplicaChannel>> {
            self.check("replica_channel")?;
            Ok(self.channel.clone())
        }

        async fn stop_apply(&mut self) -> anyhow::Result<()> {
            self.check("stop_apply")?;
            self.apply_stopped = true;
            self.started = false;
            Ok(())
        }

        async fn enable_row_binlog(&mut self) -> anyhow::Result<()> {
            self.check("enable_row_binlog")
        }

        async fn user_exists(&mut self, _name: &str) -> anyhow::Result<bool> {
            self.check("user_exists")?;
            Ok(self.user_present)
        }

        async fn create_replication_user(
            &mut self,
            _name: &str,
            _password: &str,
        ) -> anyhow::Result<()> {
            self.check("create_replication_user")
        }

        async fn master_coordinates(&mut self) -> anyhow::Result<MasterCoordinates> {
            self.check("master_coordinates")?;
            Ok(MasterCoordinates {
                log_file: "mysql-bin.000003".to_string(),
                log_position: 107,
            })
        }

        async fn configure_replica(
            &mut self,
            _master_host: &str,
            _user: &str,
            _password: &str,
            _coordinates: &MasterCoordinates,
        ) -> anyhow::Result<()> {
            self.check("configure_replica")
        }

        async fn start_replica(&mut self) -> anyhow::Result<()> {
            self.check("start_replica")?;
            self.started = true;
            Ok(())
        }
    }

    fn opts() -> BootstrapOpts {
        BootstrapOpts {
            repl_user: "repl".to_string(),
            repl_password: "replpw".to_string(),
            force: false,
            bidirectional: false,
        }
    }

    fn source_endpoint() -> Endpoint {
        Endpoint {
            host: "master.example.com".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: "pw".to_string(),
            database: Some("shop".to_string()),
        }
    }

    #[test]
    fn quoted_literals_double_embedded_quotes() {
        assert_eq!(quote_literal("plain"), "plain");
        assert_eq!(quote_literal("repl'er"), "repl''er");
        assert_eq!(quote_literal(r"a\b'c"), r"a\\b''c");
    }

    #[tokio::test]
    async fn successful_run_reaches_active() {
        let mut source = MockAdmin::default();
        let mut target = MockAdmin::default();
        let mut bootstrapper = Bootstrapper::new(opts());

        bootstrapper
            .run(&mut source, &mut target, &source_endpoint(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bootstrapper.state(), BootstrapState::Active);
        assert!(target.started);
        assert_eq!(
            target.calls,
            vec![
                "replica_channel",
                "stop_apply",
                "configure_replica",
                "start_replica"
            ]
        );
        assert_eq!(
            source.calls,
            vec![
                "enable_row_binlog",
                "user_exists",
                "create_replication_user",
                "master_coordinates"
            ]
        );
    }

    #[tokio::test]
    async fn existing_user_is_not_recreated() {
        let mut source = MockAdmin {
            user_present: true,
            ..Default::default()
        };
        let mut target = MockAdmin::default();
        let mut bootstrapper = Bootstrapper::new(opts());

        bootstrapper
            .run(&mut source, &mut target, &source_endpoint(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!source.calls.contains(&"create_replication_user"));
    }

    #[tokio::test]
    async fn bidirectional_bootstrap_provisions_the_target_too() {
        let mut source = MockAdmin::default();
        let mut target = MockAdmin::default();
        let mut bootstrapper = Bootstrapper::new(BootstrapOpts {
            bidirectional: true,
            ..opts()
        });

        bootstrapper
            .run(&mut source, &mut target, &source_endpoint(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(target.calls.contains(&"user_exists"));
        assert!(target.calls.contains(&"create_replication_user"));
    }

    #[tokio::test]
    async fn differing_active_channel_requires_force() {
        let mut source = MockAdmin::default();
        let mut target = MockAdmin {
            channel: Some(ReplicaChannel {
                master_host: "other-master".to_string(),
                sql_thread_running: true,
            }),
            ..Default::default()
        };
        let mut bootstrapper = Bootstrapper::new(opts());

        let err = bootstrapper
            .run(&mut source, &mut target, &source_endpoint(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Bootstrap { stage: "inspecting", .. }));
        assert_eq!(bootstrapper.state(), BootstrapState::Failed);
        // Refused before touching the apply thread.
        assert!(!target.apply_stopped);
    }

    #[tokio::test]
    async fn active_channel_to_the_same_master_requires_force() {
        let mut source = MockAdmin::default();
        let mut target = MockAdmin {
            channel: Some(ReplicaChannel {
                master_host: "master.example.com".to_string(),
                sql_thread_running: true,
            }),
            ..Default::default()
        };
        let mut bootstrapper = Bootstrapper::new(opts());

        let err = bootstrapper
            .run(&mut source, &mut target, &source_endpoint(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Bootstrap { stage: "inspecting", .. }));
        assert_eq!(bootstrapper.state(), BootstrapState::Failed);
        // The running channel is left untouched.
        assert!(!target.apply_stopped);
        assert!(!target.calls.contains(&"configure_replica"));
    }

    #[tokio::test]
    async fn stopped_channel_to_the_same_master_proceeds_without_force() {
        let mut source = MockAdmin::default();
        let mut target = MockAdmin {
            channel: Some(ReplicaChannel {
                master_host: "master.example.com".to_string(),
                sql_thread_running: false,
            }),
            ..Default::default()
        };
        let mut bootstrapper = Bootstrapper::new(opts());

        bootstrapper
            .run(&mut source, &mut target, &source_endpoint(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bootstrapper.state(), BootstrapState::Active);
    }

    #[tokio::test]
    async fn force_overrides_a_differing_channel() {
        let mut source = MockAdmin::default();
        let mut target = MockAdmin {
            channel: Some(ReplicaChannel {
                master_host: "other-master".to_string(),
                sql_thread_running: true,
            }),
            ..Default::default()
        };
        let mut bootstrapper = Bootstrapper::new(BootstrapOpts {
            force: true,
            ..opts()
        });

        bootstrapper
            .run(&mut source, &mut target, &source_endpoint(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bootstrapper.state(), BootstrapState::Active);
    }

    async fn run_with_source_failure(step: &'static str) -> (MockAdmin, BootstrapState) {
        let mut source = MockAdmin::failing_at(step);
        let mut target = MockAdmin::default();
        let mut bootstrapper = Bootstrapper::new(opts());

        let err = bootstrapper
            .run(&mut source, &mut target, &source_endpoint(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Bootstrap { .. }));

        (target, bootstrapper.state())
    }

    #[tokio::test]
    async fn provisioning_failure_leaves_apply_stopped() {
        let (target, state) = run_with_source_failure("enable_row_binlog").await;
        assert_eq!(state, BootstrapState::Failed);
        assert!(target.apply_stopped);
        assert!(!target.started);
    }

    #[tokio::test]
    async fn coordinate_capture_failure_leaves_apply_stopped() {
        let (target, state) = run_with_source_failure("master_coordinates").await;
        assert_eq!(state, BootstrapState::Failed);
        assert!(target.apply_stopped);
        assert!(!target.started);
    }

    #[tokio::test]
    async fn reconfiguration_failure_leaves_apply_stopped() {
        let mut source = MockAdmin::default();
        let mut target = MockAdmin::failing_at("configure_replica");
        let mut bootstrapper = Bootstrapper::new(opts());

        let err = bootstrapper
            .run(&mut source, &mut target, &source_endpoint(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Bootstrap { stage: "reconfiguring", .. }));
        assert_eq!(bootstrapper.state(), BootstrapState::Failed);
        assert!(target.apply_stopped);
        assert!(!target.started);
    }

    #[tokio::test]
    async fn start_failure_stops_replication_again() {
        let mut source = MockAdmin::default();
        let mut target = MockAdmin::failing_at("start_replica");
        let mut bootstrapper = Bootstrapper::new(opts());

        bootstrapper
            .run(&mut source, &mut target, &source_endpoint(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(bootstrapper.state(), BootstrapState::Failed);
        assert!(!target.started);
        assert_eq!(target.calls.last(), Some(&"stop_apply"));
    }

    #[tokio::test]
    async fn cancellation_before_the_run_is_a_clean_abort() {
        let mut source = MockAdmin::default();
        let mut target = MockAdmin::default();
        let mut bootstrapper = Bootstrapper::new(opts());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = bootstrapper
            .run(&mut source, &mut target, &source_endpoint(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Bootstrap { stage: "idle", .. }));
        assert!(target.calls.is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_sequence_leaves_apply_stopped() {
        let cancel = CancellationToken::new();
        let mut source = MockAdmin {
            cancel_on: Some(("user_exists", cancel.clone())),
            ..Default::default()
        };
        let mut target = MockAdmin::default();
        let mut bootstrapper = Bootstrapper::new(opts());

        let err = bootstrapper
            .run(&mut source, &mut target, &source_endpoint(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Bootstrap { .. }));
        assert_eq!(bootstrapper.state(), BootstrapState::Failed);
        assert!(target.apply_stopped);
        assert!(!target.started);
        assert!(!target.calls.contains(&"configure_replica"));
    }
}
