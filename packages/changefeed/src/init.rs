//! Trigger bootstrap: schema discovery, coordination tables, monitor launch.

use sha2::{Digest, Sha256};
use sqlx::mssql::{Mssql, MssqlPool};
use sqlx::pool::PoolOptions;
use tracing::{debug, info};

use crate::config::TriggerConfig;
use crate::error::{Result, TriggerError};
use crate::handler::ChangeHandler;
use crate::monitor::ChangeMonitor;
use crate::sql;
use crate::table::UserTable;

/// Bootstrap a trigger and launch its monitor.
///
/// Resolves the user table and its primary key, creates the engine schema,
/// the shared global-state table, and the per-(function,table) worker table
/// (all existence-guarded, in one RepeatableRead transaction), seeds the
/// sync-version row at the table's minimum valid change version, and starts
/// the two monitor loops.
///
/// Re-running bootstrap for the same `(function, table)` pair is harmless:
/// every DDL statement and the seed insert are no-ops when the object
/// already exists, so a new worker joining a running fleet never destabilizes
/// its peers.
pub async fn start<T, H>(config: TriggerConfig, handler: H) -> Result<ChangeMonitor>
where
    T: serde::de::DeserializeOwned + Send + 'static,
    H: ChangeHandler<T> + 'static,
{
    config.validate()?;

    let pool = PoolOptions::<Mssql>::new()
        .max_connections(5)
        .connect(&config.connection_string)
        .await?;

    let table = UserTable::resolve(&pool, &config.table_name).await?;
    let function_id = function_id_hash(&config.function_id);
    let worker_table = sql::worker_table_name(&function_id, table.object_id);

    debug!(
        table = %table.qualified_name(),
        object_id = table.object_id,
        worker_table = %worker_table,
        pk_columns = table.pk_len(),
        "resolved user table"
    );

    bootstrap_tables(&pool, &table, &function_id, &worker_table).await?;

    info!(
        table = %table.qualified_name(),
        function_id = %function_id,
        "trigger initialized"
    );

    Ok(ChangeMonitor::start(
        pool,
        table,
        worker_table,
        function_id,
        config,
        handler,
    ))
}

async fn bootstrap_tables(
    pool: &MssqlPool,
    table: &UserTable,
    function_id: &str,
    worker_table: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(sql::SET_REPEATABLE_READ)
        .execute(&mut tx)
        .await?;

    sqlx::query(&sql::create_schema_sql()).execute(&mut tx).await?;
    sqlx::query(&sql::create_global_state_table_sql())
        .execute(&mut tx)
        .await?;

    let min_valid: Option<i64> =
        sqlx::query_scalar(&sql::min_valid_version_sql(table.object_id))
            .fetch_one(&mut tx)
            .await?;
    let min_valid = min_valid.ok_or_else(|| TriggerError::ChangeTrackingNotEnabled {
        table: table.qualified_name(),
    })?;

    sqlx::query(&sql::seed_global_state_sql())
        .bind(function_id)
        .bind(table.object_id)
        .bind(min_valid)
        .execute(&mut tx)
        .await?;

    sqlx::query(&sql::create_worker_table_sql(worker_table, table))
        .execute(&mut tx)
        .await?;

    tx.commit().await?;

    debug!(
        worker_table = %worker_table,
        min_valid_version = min_valid,
        "coordination tables ready"
    );
    Ok(())
}

/// 16-char identifier derived from the user-supplied function id: safe to
/// embed in table names, and stable across every worker sharing the id.
fn function_id_hash(function_id: &str) -> String {
    let digest = Sha256::digest(function_id.as_bytes());
    digest
        .iter()
        .take(8)
        .map(|byte| format!("{:02X}", byte))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_id_hash_is_16_hex_chars() {
        let hash = function_id_hash("process-orders");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(hash.chars().all(|c| !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_function_id_hash_is_stable() {
        assert_eq!(
            function_id_hash("process-orders"),
            function_id_hash("process-orders")
        );
        assert_ne!(
            function_id_hash("process-orders"),
            function_id_hash("process-refunds")
        );
    }
}
