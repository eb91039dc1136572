//! Schema discovery and replication.
//!
//! Table definitions travel as DDL text: the column/constraint clause is
//! sliced out of `SHOW CREATE TABLE` output and replayed verbatim on the
//! target inside a create-if-absent statement. The textual slicing is
//! deliberately narrow and unit-tested; it is the fragile part of the
//! pipeline and is kept isolated here.

use crate::error::SyncError;
use crate::reconcile::LEDGER_TABLE;
use mysql_async::prelude::*;
use mysql_async::Conn;
use serde::Serialize;
use tracing::{debug, info};

/// Whether the target table had to be created or was already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchemaStatus {
    Created,
    Existed,
}

/// List the tables of the currently selected database, in whatever order
/// the engine returns them. The order is not stable across runs and is
/// used for display only, never for correctness.
///
/// `exclude_ledger` drops the engine-owned checksum ledger table from
/// discovery. Only the strategies that materialize one should pass it; a
/// user table that happens to be named `checksums` is a genuine table
/// otherwise.
pub async fn list_tables(conn: &mut Conn, exclude_ledger: bool) -> anyhow::Result<Vec<String>> {
    let tables: Vec<String> = conn.query("SHOW TABLES").await?;
    Ok(discovered_tables(tables, exclude_ledger))
}

/// Discovery filter, kept apart from the query for unit testing.
fn discovered_tables(tables: Vec<String>, exclude_ledger: bool) -> Vec<String> {
    if !exclude_ledger {
        return tables;
    }
    tables.into_iter().filter(|t| t != LEDGER_TABLE).collect()
}

/// Slice the column/constraint clause out of a `SHOW CREATE TABLE`
/// definition, i.e. everything after the table-name token.
///
/// Tolerates backtick-quoted and unquoted identifiers (including
/// backticks inside quoted names, which the engine doubles) and makes no
/// assumption about clause order in the remainder.
pub fn extract_column_clause<'a>(ddl: &'a str, table: &str) -> Result<&'a str, SyncError> {
    let quoted = format!("CREATE TABLE `{}`", table.replace('`', "``"));
    let unquoted = format!("CREATE TABLE {table}");

    let rest = ddl
        .split_once(quoted.as_str())
        .or_else(|| ddl.split_once(unquoted.as_str()))
        .map(|(_, rest)| rest.trim_start())
        .ok_or_else(|| SyncError::SchemaReplication {
            table: table.to_string(),
            message: format!("definition does not contain a CREATE TABLE clause for `{table}`"),
        })?;

    if !rest.starts_with('(') {
        return Err(SyncError::SchemaReplication {
            table: table.to_string(),
            message: "definition clause does not start with a column list".to_string(),
        });
    }

    Ok(rest)
}

/// Create `table` on the target if absent, using the source's canonical
/// definition. Returns whether the table was created or already existed;
/// an already-existing table is never an error.
pub async fn replicate_schema(
    table: &str,
    source: &mut Conn,
    target: &mut Conn,
) -> Result<SchemaStatus, SyncError> {
    let schema_err = |message: String| SyncError::SchemaReplication {
        table: table.to_string(),
        message,
    };

    let definition: Option<(String, String)> = source
        .query_first(format!("SHOW CREATE TABLE `{table}`"))
        .await
        .map_err(|e| schema_err(format!("failed to read source definition: {e}")))?;

    let (_, ddl) =
        definition.ok_or_else(|| schema_err("source returned no definition".to_string()))?;

    let clause = extract_column_clause(&ddl, table)?;

    let existed: Option<i64> = target
        .exec_first(
            "SELECT COUNT(*) FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
            (table,),
        )
        .await
        .map_err(|e| schema_err(format!("failed to check target table existence: {e}")))?;
    let existed = existed.unwrap_or(0) > 0;

    target
        .query_drop(format!("CREATE TABLE IF NOT EXISTS `{table}` {clause}"))
        .await
        .map_err(|e| schema_err(format!("target rejected create statement: {e}")))?;

    if existed {
        debug!("Table `{table}` already exists on target");
        Ok(SchemaStatus::Existed)
    } else {
        info!("Created table `{table}` on target");
        Ok(SchemaStatus::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USERS_DDL: &str = "CREATE TABLE `users` (\n  `id` int NOT NULL AUTO_INCREMENT,\n  `name` varchar(255) DEFAULT NULL,\n  PRIMARY KEY (`id`)\n) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

    #[test]
    fn extracts_clause_from_backticked_definition() {
        let clause = extract_column_clause(USERS_DDL, "users").unwrap();
        assert!(clause.starts_with("(\n  `id` int"));
        assert!(clause.ends_with("CHARSET=utf8mb4"));
    }

    #[test]
    fn extracts_clause_from_unquoted_definition() {
        let ddl = "CREATE TABLE orders (id int, total decimal(10,2)) ENGINE=InnoDB";
        let clause = extract_column_clause(ddl, "orders").unwrap();
        assert_eq!(clause, "(id int, total decimal(10,2)) ENGINE=InnoDB");
    }

    #[test]
    fn handles_backtick_inside_table_name() {
        // The engine doubles embedded backticks in quoted identifiers.
        let ddl = "CREATE TABLE `odd``name` (`id` int) ENGINE=InnoDB";
        let clause = extract_column_clause(ddl, "odd`name").unwrap();
        assert_eq!(clause, "(`id` int) ENGINE=InnoDB");
    }

    #[test]
    fn table_name_prefixing_a_column_is_not_confused() {
        // `users` must match the table-name token, not the `users_id` column.
        let clause = extract_column_clause(USERS_DDL, "users").unwrap();
        assert!(clause.contains("`name` varchar"));
    }

    #[test]
    fn rejects_definition_for_a_different_table() {
        let err = extract_column_clause(USERS_DDL, "orders").unwrap_err();
        assert!(matches!(err, SyncError::SchemaReplication { .. }));
    }

    #[test]
    fn ledger_table_is_excluded_only_when_asked() {
        let tables = vec!["checksums".to_string(), "users".to_string()];
        assert_eq!(discovered_tables(tables.clone(), true), vec!["users"]);
        assert_eq!(discovered_tables(tables, false), vec!["checksums", "users"]);
    }

    #[test]
    fn rejects_definition_without_column_list() {
        let ddl = "CREATE TABLE `v` AS SELECT 1";
        let err = extract_column_clause(ddl, "v").unwrap_err();
        assert!(matches!(err, SyncError::SchemaReplication { .. }));
    }
}
