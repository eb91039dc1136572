//! Structural comparison of table contents between source and target.

use mysql_async::prelude::*;
use mysql_async::{Conn, Row, Value};
use tracing::debug;

/// Outcome of comparing one table's contents on both endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonResult {
    pub table: String,
    pub identical: bool,
}

/// Fetch the full row set of `table` from both endpoints and test deep,
/// order-sensitive equality.
///
/// Row order as returned by the unordered `SELECT *` is part of the
/// result, so semantically identical but differently ordered tables are
/// reported as diverged. That is intentionally conservative: the cost of
/// a false "diverged" is one delegated reconciliation run, while a false
/// "identical" would leave the tables out of sync.
///
/// Both fetches materialize the whole table in memory; deployments with
/// large tables should use the checksum strategy, which delegates row
/// hashing to the external engine instead. Neither table is mutated.
pub async fn compare(
    table: &str,
    source: &mut Conn,
    target: &mut Conn,
) -> anyhow::Result<ComparisonResult> {
    let source_rows = fetch_rows(source, table).await?;
    let target_rows = fetch_rows(target, table).await?;

    debug!(
        "Compared table `{table}`: {} source rows, {} target rows",
        source_rows.len(),
        target_rows.len()
    );

    Ok(ComparisonResult {
        table: table.to_string(),
        identical: row_sets_identical(&source_rows, &target_rows),
    })
}

async fn fetch_rows(conn: &mut Conn, table: &str) -> anyhow::Result<Vec<Vec<Value>>> {
    let rows: Vec<Row> = conn.query(format!("SELECT * FROM `{table}`")).await?;
    Ok(rows.into_iter().map(Row::unwrap).collect())
}

/// Deep equality over two ordered sequences of rows. Empty-vs-empty is
/// equal; any difference in row count, column values, or row order is not.
pub fn row_sets_identical(source: &[Vec<Value>], target: &[Vec<Value>]) -> bool {
    source == target
}
