//! SQL text builders for the trigger's coordination statements.
//!
//! Everything here is pure string assembly, so statement shape is covered by
//! unit tests without a database. Identifiers come from the catalog
//! (bracket-quoted), numeric literals from typed integers, and every
//! primary-key VALUE travels as a bound `@pN` parameter, never interpolated.
//! Parameters are numbered row-major across the batch; each value is
//! declared once and its name referenced everywhere that row needs it.

use std::fmt::Write;

use crate::row::ChangeRow;
use crate::table::{quote_ident, UserTable};

/// Schema owned by the engine; never dropped.
pub(crate) const RESERVED_SCHEMA: &str = "changefeed";

/// Issued as the first statement of every coordination transaction.
pub(crate) const SET_REPEATABLE_READ: &str =
    "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ";

pub(crate) fn global_state_table() -> String {
    format!("[{}].[GlobalState]", RESERVED_SCHEMA)
}

/// `[changefeed].[Worker_<fnId16>_<tableId>]` — per-(function,table)
/// coordination table.
pub(crate) fn worker_table_name(function_id: &str, object_id: i32) -> String {
    format!(
        "[{}].[Worker_{}_{}]",
        RESERVED_SCHEMA, function_id, object_id
    )
}

// ---------------------------------------------------------------------------
// Bootstrap DDL
// ---------------------------------------------------------------------------

pub(crate) fn create_schema_sql() -> String {
    format!(
        "IF SCHEMA_ID(N'{0}') IS NULL EXEC(N'CREATE SCHEMA [{0}]')",
        RESERVED_SCHEMA
    )
}

pub(crate) fn create_global_state_table_sql() -> String {
    format!(
        "IF OBJECT_ID(N'{table}', 'U') IS NULL \
         CREATE TABLE {table} (\n\
             UserFunctionID char(16) NOT NULL,\n\
             UserTableID int NOT NULL,\n\
             LastSyncVersion bigint NOT NULL,\n\
             PRIMARY KEY (UserFunctionID, UserTableID)\n\
         )",
        table = global_state_table()
    )
}

/// Seed the sync-state row. `@p1` = function id, `@p2` = table id,
/// `@p3` = the table's minimum valid change version.
pub(crate) fn seed_global_state_sql() -> String {
    format!(
        "IF NOT EXISTS (SELECT 1 FROM {table} WHERE UserFunctionID = @p1 AND UserTableID = @p2) \
         INSERT INTO {table} (UserFunctionID, UserTableID, LastSyncVersion) \
         VALUES (@p1, @p2, @p3)",
        table = global_state_table()
    )
}

pub(crate) fn create_worker_table_sql(worker_table: &str, table: &UserTable) -> String {
    let mut columns = String::new();
    for pk in &table.pk_columns {
        let _ = write!(
            columns,
            "{} {} NOT NULL,\n",
            quote_ident(&pk.name),
            pk.sql_type
        );
    }
    let pk_list = table
        .pk_columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "IF OBJECT_ID(N'{worker_table}', 'U') IS NULL \
         CREATE TABLE {worker_table} (\n\
             {columns}\
             ChangeVersion bigint NOT NULL,\n\
             AttemptCount int NOT NULL,\n\
             LeaseExpirationTime datetime2,\n\
             PRIMARY KEY ({pk_list})\n\
         )",
        worker_table = worker_table,
        columns = columns,
        pk_list = pk_list
    )
}

// ---------------------------------------------------------------------------
// Global-state reads and writes
// ---------------------------------------------------------------------------

/// `@p1` = function id, `@p2` = table id.
pub(crate) fn get_last_sync_version_sql() -> String {
    format!(
        "SELECT LastSyncVersion FROM {table} WHERE UserFunctionID = @p1 AND UserTableID = @p2",
        table = global_state_table()
    )
}

pub(crate) fn min_valid_version_sql(object_id: i32) -> String {
    format!("SELECT CHANGE_TRACKING_MIN_VALID_VERSION({})", object_id)
}

/// Monotonic update: `@p1` = new version, `@p2` = function id, `@p3` = table
/// id. A no-op when the stored version is already at or past `@p1`.
pub(crate) fn update_last_sync_version_sql() -> String {
    format!(
        "UPDATE {table} SET LastSyncVersion = @p1 \
         WHERE UserFunctionID = @p2 AND UserTableID = @p3 AND LastSyncVersion < @p1",
        table = global_state_table()
    )
}

// ---------------------------------------------------------------------------
// Candidate selection and lease handling
// ---------------------------------------------------------------------------

fn pk_join_condition(table: &UserTable, left: &str, right: &str) -> String {
    table
        .pk_columns
        .iter()
        .map(|c| {
            let ident = quote_ident(&c.name);
            format!("{}.{} = {}.{}", left, ident, right, ident)
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// The shared eligibility predicate: a change is claimable when no worker
/// row exists, or the worker row finished an older version and holds no
/// lease, or its lease has expired; and the attempt budget is not exhausted
/// (no worker row counts as zero attempts).
fn eligibility_predicate(max_attempt_count: u32) -> String {
    format!(
        "(w.ChangeVersion IS NULL \
          OR (w.ChangeVersion < c.SYS_CHANGE_VERSION AND w.LeaseExpirationTime IS NULL) \
          OR w.LeaseExpirationTime < SYSUTCDATETIME()) \
         AND (w.AttemptCount IS NULL OR w.AttemptCount < {})",
        max_attempt_count
    )
}

/// Top-of-batch candidate select. `@p1` = the current last-sync version.
///
/// Column values are converted to their string rendering in the select list;
/// non-key columns come from the user table and are NULL for deletes.
pub(crate) fn select_changes_sql(
    table: &UserTable,
    worker_table: &str,
    batch_size: u32,
    max_attempt_count: u32,
) -> String {
    let mut select_list = String::from("c.SYS_CHANGE_VERSION, c.SYS_CHANGE_OPERATION");
    for pk in &table.pk_columns {
        let ident = quote_ident(&pk.name);
        let _ = write!(
            select_list,
            ", CONVERT(NVARCHAR(MAX), c.{ident}) AS {ident}",
            ident = ident
        );
    }
    for column in &table.other_columns {
        let ident = quote_ident(column);
        let _ = write!(
            select_list,
            ", CONVERT(NVARCHAR(MAX), u.{ident}) AS {ident}",
            ident = ident
        );
    }

    format!(
        "SELECT TOP ({batch_size}) {select_list} \
         FROM CHANGETABLE(CHANGES {user_table}, @p1) AS c \
         LEFT OUTER JOIN {worker_table} AS w WITH (TABLOCKX) ON {worker_join} \
         LEFT OUTER JOIN {user_table} AS u ON {user_join} \
         WHERE {predicate} \
         ORDER BY c.SYS_CHANGE_VERSION ASC",
        batch_size = batch_size,
        select_list = select_list,
        user_table = table.qualified_name(),
        worker_table = worker_table,
        worker_join = pk_join_condition(table, "c", "w"),
        user_join = pk_join_condition(table, "c", "u"),
        predicate = eligibility_predicate(max_attempt_count),
    )
}

/// The pk match for batch row `index`, referencing that row's `@pN` set.
/// Parameter numbering is row-major: row i, pk column j binds `@p{i*n+j+1}`.
fn pk_match_for_row(table: &UserTable, index: usize) -> String {
    let pk_len = table.pk_columns.len();
    table
        .pk_columns
        .iter()
        .enumerate()
        .map(|(j, c)| {
            format!(
                "{} = @p{}",
                quote_ident(&c.name),
                index * pk_len + j + 1
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Claim or refresh a lease for every batch row. Bind order: each row's pk
/// values, row-major. The attempt count is incremented on acquisition, ahead
/// of the handler running, so retries stay bounded even when a worker dies
/// mid-batch.
pub(crate) fn acquire_leases_sql(
    table: &UserTable,
    worker_table: &str,
    rows: &[ChangeRow],
    lease_interval_secs: u64,
) -> String {
    let pk_len = table.pk_columns.len();
    let pk_columns = table
        .pk_columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = String::new();
    for (i, row) in rows.iter().enumerate() {
        let pk_match = pk_match_for_row(table, i);
        let pk_params = (0..pk_len)
            .map(|j| format!("@p{}", i * pk_len + j + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(
            sql,
            "IF NOT EXISTS (SELECT 1 FROM {w} WITH (TABLOCKX) WHERE {pk_match})\n\
             BEGIN\n\
                 INSERT INTO {w} WITH (TABLOCKX) ({pk_columns}, ChangeVersion, AttemptCount, LeaseExpirationTime)\n\
                 VALUES ({pk_params}, {version}, 1, DATEADD(second, {lease}, SYSUTCDATETIME()));\n\
             END\n\
             ELSE\n\
             BEGIN\n\
                 UPDATE {w} WITH (TABLOCKX)\n\
                 SET ChangeVersion = {version},\n\
                     AttemptCount = AttemptCount + 1,\n\
                     LeaseExpirationTime = DATEADD(second, {lease}, SYSUTCDATETIME())\n\
                 WHERE {pk_match};\n\
             END\n",
            w = worker_table,
            pk_match = pk_match,
            pk_columns = pk_columns,
            pk_params = pk_params,
            version = row.version,
            lease = lease_interval_secs,
        );
    }
    sql
}

/// Extend the lease of every batch row. Bind order: row-major pk values.
pub(crate) fn renew_leases_sql(
    table: &UserTable,
    worker_table: &str,
    rows: &[ChangeRow],
    lease_interval_secs: u64,
) -> String {
    let mut sql = String::new();
    for (i, _) in rows.iter().enumerate() {
        let _ = write!(
            sql,
            "UPDATE {w} WITH (TABLOCKX) \
             SET LeaseExpirationTime = DATEADD(second, {lease}, SYSUTCDATETIME()) \
             WHERE {pk_match};\n",
            w = worker_table,
            lease = lease_interval_secs,
            pk_match = pk_match_for_row(table, i),
        );
    }
    sql
}

/// Mark every batch row processed at its change version: attempts reset,
/// lease cleared. Guarded so a newer claim (higher `ChangeVersion`) written
/// by a competing worker is never rolled back. Bind order: row-major pk
/// values.
pub(crate) fn release_rows_sql(
    table: &UserTable,
    worker_table: &str,
    rows: &[ChangeRow],
) -> String {
    let mut sql = String::new();
    for (i, row) in rows.iter().enumerate() {
        let _ = write!(
            sql,
            "UPDATE {w} WITH (TABLOCKX) \
             SET ChangeVersion = {version}, AttemptCount = 0, LeaseExpirationTime = NULL \
             WHERE {pk_match} AND ChangeVersion <= {version};\n",
            w = worker_table,
            version = row.version,
            pk_match = pk_match_for_row(table, i),
        );
    }
    sql
}

/// Count candidates at or below `new_last_sync` that some worker still has
/// to process — the same eligibility predicate as polling. `@p1` = the
/// stored last-sync version. A zero count is what permits advancing.
pub(crate) fn unprocessed_changes_sql(
    table: &UserTable,
    worker_table: &str,
    new_last_sync: i64,
    max_attempt_count: u32,
) -> String {
    format!(
        "SELECT COUNT_BIG(*) \
         FROM CHANGETABLE(CHANGES {user_table}, @p1) AS c \
         LEFT OUTER JOIN {worker_table} AS w WITH (TABLOCKX) ON {worker_join} \
         WHERE c.SYS_CHANGE_VERSION <= {new_last_sync} AND {predicate}",
        user_table = table.qualified_name(),
        worker_table = worker_table,
        worker_join = pk_join_condition(table, "c", "w"),
        new_last_sync = new_last_sync,
        predicate = eligibility_predicate(max_attempt_count),
    )
}

/// Garbage-collect worker rows fully covered by the advanced version.
pub(crate) fn delete_processed_worker_rows_sql(
    worker_table: &str,
    new_last_sync: i64,
) -> String {
    format!(
        "DELETE FROM {w} WITH (TABLOCKX) WHERE ChangeVersion <= {version}",
        w = worker_table,
        version = new_last_sync
    )
}
