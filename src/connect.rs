//! Connection manager for the source and target endpoints.

use crate::endpoint::Endpoint;
use crate::error::SyncError;
use mysql_async::prelude::*;
use mysql_async::Pool;
use tracing::info;

/// Open a pool against an endpoint, eagerly establishing one connection so
/// that network and auth failures surface here rather than mid-pipeline.
/// Not retried; the caller decides retry policy.
pub async fn connect(endpoint: &Endpoint) -> Result<Pool, SyncError> {
    let pool = Pool::from_url(endpoint.url()).map_err(|source| SyncError::Connection {
        endpoint: endpoint.to_string(),
        source,
    })?;

    let conn = pool
        .get_conn()
        .await
        .map_err(|source| SyncError::Connection {
            endpoint: endpoint.to_string(),
            source,
        })?;
    drop(conn);

    Ok(pool)
}

/// Issue a create-if-absent statement for the given database. Idempotent;
/// safe to call on every run.
pub async fn ensure_database(pool: &Pool, endpoint: &Endpoint, name: &str) -> Result<(), SyncError> {
    let mut conn = pool
        .get_conn()
        .await
        .map_err(|source| SyncError::Connection {
            endpoint: endpoint.to_string(),
            source,
        })?;

    conn.query_drop(format!("CREATE DATABASE IF NOT EXISTS `{name}`"))
        .await
        .map_err(|source| SyncError::Connection {
            endpoint: endpoint.to_string(),
            source,
        })?;

    Ok(())
}

/// Prepare the target endpoint for table-level work: connect, create the
/// database if absent, and reconnect bound to it.
///
/// A pool opened before the database existed cannot be rebound in place,
/// so the pre-creation pool is disconnected and a fresh one is returned
/// together with the database-bound endpoint. All subsequent target
/// operations must use the returned pair.
pub async fn prepare_target(
    endpoint: &Endpoint,
    database: &str,
) -> Result<(Endpoint, Pool), SyncError> {
    let unbound = Endpoint {
        database: None,
        ..endpoint.clone()
    };

    let pool = connect(&unbound).await?;
    ensure_database(&pool, &unbound, database).await?;
    if let Err(e) = pool.disconnect().await {
        // The pool served its purpose; a noisy teardown is not fatal.
        tracing::warn!("Error disconnecting pre-creation target pool: {e}");
    }

    let bound = endpoint.with_database(database);
    let pool = connect(&bound).await?;
    info!("Target database `{database}` ready on {bound}");

    Ok((bound, pool))
}
