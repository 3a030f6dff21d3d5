//! The change monitor: polling, lease renewal, release, and advancement.
//!
//! Two cooperating loops share one batch cell:
//!
//! ```text
//! polling loop                          renewal loop
//!     │                                      │
//!     ├─► acquire tx (RepeatableRead)        │  every lease/2:
//!     │     floor-bump LastSyncVersion       ├─► lock batch cell
//!     │     select candidates (TOP n)        │     renew leases of batch rows
//!     │     claim/refresh leases (TABLOCKX)  │     count renewal; at the
//!     ├─► state ─► ProcessingChanges         │     budget, cancel executor
//!     ├─► decode batch ─► handler            └─► unlock
//!     ├─► on success: release + advance
//!     └─► state ─► CheckingForChanges, sleep
//! ```
//!
//! The cell's mutex is held for every mutation of the batch, the renewal
//! counter, and the state, but never across the handler call — that is what
//! lets renewal run while a handler grinds. Any number of peer processes may
//! run monitors against the same table; they coordinate only through the
//! worker table's exclusive locks, so two peers can both see a candidate but
//! exactly one claims it per lease period.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use sqlx::mssql::{Mssql, MssqlArguments, MssqlPool};
use sqlx::query::Query;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::change::SqlChange;
use crate::config::TriggerConfig;
use crate::error::{Result, TriggerError};
use crate::handler::ChangeHandler;
use crate::row::ChangeRow;
use crate::sql;
use crate::table::UserTable;

/// Monitor states. `ProcessingChanges` spans handler execution and release;
/// there is no stopped state — shutdown is the polling token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    CheckingForChanges,
    ProcessingChanges,
}

/// Shared between the two loops, guarded by one mutex.
struct BatchState {
    state: MonitorState,
    rows: Vec<ChangeRow>,
    lease_renewal_count: u32,
    /// Trips the in-flight handler. Replaced with a fresh token after a
    /// stuck-handler cancellation so later batches get their own.
    executor_cancel: CancellationToken,
}

impl BatchState {
    fn new() -> Self {
        Self {
            state: MonitorState::CheckingForChanges,
            rows: Vec::new(),
            lease_renewal_count: 0,
            executor_cancel: CancellationToken::new(),
        }
    }

    /// Back to `CheckingForChanges` with an empty batch. Callers hold the
    /// batch mutex by construction.
    fn clear(&mut self) {
        self.rows.clear();
        self.lease_renewal_count = 0;
        self.state = MonitorState::CheckingForChanges;
    }

    /// Bookkeeping after one renewal attempt (success or failure). Returns
    /// true when the renewal budget ran out and the executor was cancelled.
    fn note_renewal(&mut self, max_lease_renewal_count: u32, loop_cancelled: bool) -> bool {
        if self.state != MonitorState::ProcessingChanges {
            return false;
        }
        self.lease_renewal_count += 1;
        if self.lease_renewal_count == max_lease_renewal_count && !loop_cancelled {
            self.executor_cancel.cancel();
            self.executor_cancel = CancellationToken::new();
            return true;
        }
        false
    }
}

/// Handle to a running monitor.
///
/// Dropping the handle does not stop the loops; call [`stop`] for a
/// fire-and-forget shutdown or [`shutdown`] to also await quiescence.
///
/// [`stop`]: ChangeMonitor::stop
/// [`shutdown`]: ChangeMonitor::shutdown
pub struct ChangeMonitor {
    id: Uuid,
    poll_cancel: CancellationToken,
    poll_handle: JoinHandle<()>,
    renewal_handle: JoinHandle<()>,
}

impl ChangeMonitor {
    pub(crate) fn start<T, H>(
        pool: MssqlPool,
        table: UserTable,
        worker_table: String,
        function_id: String,
        config: TriggerConfig,
        handler: H,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        H: ChangeHandler<T> + 'static,
    {
        let id = Uuid::new_v4();
        let poll_cancel = CancellationToken::new();
        let renewal_cancel = CancellationToken::new();

        let select_changes = sql::select_changes_sql(
            &table,
            &worker_table,
            config.batch_size,
            config.max_attempt_count,
        );
        let runtime = Arc::new(MonitorRuntime {
            id,
            pool,
            table,
            worker_table,
            function_id,
            select_changes,
            config,
            handler,
            batch: Mutex::new(BatchState::new()),
            _payload: PhantomData,
        });

        info!(
            monitor_id = %id,
            table = %runtime.table.qualified_name(),
            batch_size = runtime.config.batch_size,
            "change monitor starting"
        );

        let poll_handle = tokio::spawn(run_change_consumption(
            Arc::clone(&runtime),
            poll_cancel.clone(),
            renewal_cancel.clone(),
        ));
        let renewal_handle = tokio::spawn(run_lease_renewal(runtime, renewal_cancel));

        Self {
            id,
            poll_cancel,
            poll_handle,
            renewal_handle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Request shutdown and return immediately.
    ///
    /// Only the polling token is cancelled here; the renewal loop is
    /// cancelled by the polling loop's terminal cleanup so the two always
    /// die together. An in-flight handler runs to completion (or to
    /// cancellation by the renewal limit).
    pub fn stop(&self) {
        info!(monitor_id = %self.id, "change monitor stop requested");
        self.poll_cancel.cancel();
    }

    /// [`stop`](ChangeMonitor::stop), then wait for both loops to finish.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.poll_handle.await;
        let _ = self.renewal_handle.await;
        debug!(monitor_id = %self.id, "change monitor stopped");
    }
}

struct MonitorRuntime<T, H> {
    id: Uuid,
    pool: MssqlPool,
    table: UserTable,
    worker_table: String,
    /// 16-char identity bound into every global-state query.
    function_id: String,
    /// Candidate select, fixed for the session.
    select_changes: String,
    config: TriggerConfig,
    handler: H,
    batch: Mutex<BatchState>,
    _payload: PhantomData<fn() -> T>,
}

/// Polling loop: one tick per `polling_interval`, strictly serialized —
/// a new tick never starts before the previous release or clear completed.
async fn run_change_consumption<T, H>(
    runtime: Arc<MonitorRuntime<T, H>>,
    cancel: CancellationToken,
    renewal_cancel: CancellationToken,
) where
    T: DeserializeOwned + Send + 'static,
    H: ChangeHandler<T> + 'static,
{
    debug!(monitor_id = %runtime.id, "change consumption loop running");

    while !cancel.is_cancelled() {
        if let Err(e) = runtime.poll_once().await {
            error!(
                monitor_id = %runtime.id,
                table = %runtime.table.qualified_name(),
                error = %e,
                "poll tick failed"
            );
            runtime.batch.lock().await.clear();
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(runtime.config.polling_interval) => {}
        }
    }

    // The loops die together.
    renewal_cancel.cancel();
    debug!(monitor_id = %runtime.id, "change consumption loop stopped");
}

/// Renewal loop: twice per lease period, extend the leases of the rows the
/// handler is working on, and cancel the handler once the renewal budget is
/// spent.
async fn run_lease_renewal<T, H>(runtime: Arc<MonitorRuntime<T, H>>, cancel: CancellationToken)
where
    T: DeserializeOwned + Send + 'static,
    H: ChangeHandler<T> + 'static,
{
    debug!(monitor_id = %runtime.id, "lease renewal loop running");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(runtime.config.renewal_interval()) => {}
        }

        let mut guard = runtime.batch.lock().await;
        if guard.state == MonitorState::ProcessingChanges {
            if let Err(e) = runtime.renew_leases(&guard.rows).await {
                warn!(
                    monitor_id = %runtime.id,
                    error = %e,
                    "failed to renew leases; the batch may be re-claimed early"
                );
            }
            if guard.note_renewal(runtime.config.max_lease_renewal_count, cancel.is_cancelled()) {
                warn!(
                    monitor_id = %runtime.id,
                    renewals = guard.lease_renewal_count,
                    "handler exceeded the lease renewal budget; cancelling executor"
                );
            }
        }
    }

    debug!(monitor_id = %runtime.id, "lease renewal loop stopped");
}

impl<T, H> MonitorRuntime<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: ChangeHandler<T> + 'static,
{
    async fn poll_once(&self) -> Result<()> {
        {
            let guard = self.batch.lock().await;
            if guard.state != MonitorState::CheckingForChanges {
                return Ok(());
            }
        }

        let rows = self.acquire_changes().await?;
        if rows.is_empty() {
            return Ok(());
        }

        info!(
            monitor_id = %self.id,
            table = %self.table.qualified_name(),
            rows = rows.len(),
            "acquired change batch"
        );

        let (executor_cancel, decoded) = {
            let mut guard = self.batch.lock().await;
            guard.state = MonitorState::ProcessingChanges;
            guard.rows = rows;
            guard.lease_renewal_count = 0;
            let decoded = decode_changes::<T>(&guard.rows, self.table.pk_len());
            (guard.executor_cancel.clone(), decoded)
        };

        let changes = match decoded {
            Ok(changes) => changes,
            Err(e) => {
                error!(
                    monitor_id = %self.id,
                    table = %self.table.qualified_name(),
                    error = %e,
                    "failed to decode change batch"
                );
                self.batch.lock().await.clear();
                return Ok(());
            }
        };

        // The mutex is NOT held here: renewal must be able to run while the
        // handler does.
        match self.handler.try_execute(changes, executor_cancel).await {
            Ok(()) => self.release_and_advance().await,
            Err(e) => {
                warn!(
                    monitor_id = %self.id,
                    table = %self.table.qualified_name(),
                    error = %e,
                    "handler failed; leases will expire and another worker may retry"
                );
                self.batch.lock().await.clear();
            }
        }

        Ok(())
    }

    /// One RepeatableRead transaction: floor-bump, candidate select, lease
    /// acquisition. The connection is released on every exit path (an early
    /// `?` rolls the transaction back on drop).
    async fn acquire_changes(&self) -> Result<Vec<ChangeRow>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(sql::SET_REPEATABLE_READ)
            .execute(&mut tx)
            .await?;

        let mut last_sync: i64 = sqlx::query_scalar(&sql::get_last_sync_version_sql())
            .bind(self.function_id.as_str())
            .bind(self.table.object_id)
            .fetch_one(&mut tx)
            .await?;

        let min_valid: Option<i64> = sqlx::query_scalar(&sql::min_valid_version_sql(
            self.table.object_id,
        ))
        .fetch_one(&mut tx)
        .await?;
        let min_valid = min_valid.ok_or_else(|| TriggerError::ChangeTrackingNotEnabled {
            table: self.table.qualified_name(),
        })?;

        if last_sync < min_valid {
            // Never query changes older than the database still retains.
            debug!(
                monitor_id = %self.id,
                last_sync,
                min_valid,
                "last sync version trails the minimum valid version; advancing floor"
            );
            sqlx::query(&sql::update_last_sync_version_sql())
                .bind(min_valid)
                .bind(self.function_id.as_str())
                .bind(self.table.object_id)
                .execute(&mut tx)
                .await?;
            last_sync = min_valid;
        }

        let candidate_rows = sqlx::query(&self.select_changes)
            .bind(last_sync)
            .fetch_all(&mut tx)
            .await?;
        let rows = candidate_rows
            .iter()
            .map(|row| ChangeRow::from_mssql_row(row, &self.table))
            .collect::<Result<Vec<_>>>()?;

        if !rows.is_empty() {
            let acquire = sql::acquire_leases_sql(
                &self.table,
                &self.worker_table,
                &rows,
                self.config.lease_interval.as_secs(),
            );
            bind_pk_values(sqlx::query(&acquire), &rows, self.table.pk_len())
                .execute(&mut tx)
                .await?;
        }

        tx.commit().await?;
        Ok(rows)
    }

    /// Lease renewal runs outside any transaction: a concurrent cleanup
    /// deleting a just-processed row must not make renewal roll back.
    async fn renew_leases(&self, rows: &[ChangeRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let renew = sql::renew_leases_sql(
            &self.table,
            &self.worker_table,
            rows,
            self.config.lease_interval.as_secs(),
        );
        bind_pk_values(sqlx::query(&renew), rows, self.table.pk_len())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release the batch and, when every peer has drained its share, advance
    /// the shared low-water-mark and garbage-collect worker rows. Failure is
    /// log-only: the leases expire naturally and another worker reprocesses.
    async fn release_and_advance(&self) {
        let mut guard = self.batch.lock().await;
        if let Err(e) = self.try_release(&guard.rows).await {
            warn!(
                monitor_id = %self.id,
                table = %self.table.qualified_name(),
                error = %e,
                "failed to release leases; they will expire naturally"
            );
        }
        guard.clear();
    }

    async fn try_release(&self, rows: &[ChangeRow]) -> Result<()> {
        let new_last_sync = match recompute_last_sync_version(rows) {
            Some(version) => version,
            None => return Ok(()),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(sql::SET_REPEATABLE_READ)
            .execute(&mut tx)
            .await?;

        let release = sql::release_rows_sql(&self.table, &self.worker_table, rows);
        bind_pk_values(sqlx::query(&release), rows, self.table.pk_len())
            .execute(&mut tx)
            .await?;

        let current: i64 = sqlx::query_scalar(&sql::get_last_sync_version_sql())
            .bind(self.function_id.as_str())
            .bind(self.table.object_id)
            .fetch_one(&mut tx)
            .await?;

        let unprocessed: i64 = sqlx::query_scalar(&sql::unprocessed_changes_sql(
            &self.table,
            &self.worker_table,
            new_last_sync,
            self.config.max_attempt_count,
        ))
        .bind(current)
        .fetch_one(&mut tx)
        .await?;

        if unprocessed == 0 && current < new_last_sync {
            sqlx::query(&sql::update_last_sync_version_sql())
                .bind(new_last_sync)
                .bind(self.function_id.as_str())
                .bind(self.table.object_id)
                .execute(&mut tx)
                .await?;
            sqlx::query(&sql::delete_processed_worker_rows_sql(
                &self.worker_table,
                new_last_sync,
            ))
            .execute(&mut tx)
            .await?;
            info!(
                monitor_id = %self.id,
                table = %self.table.qualified_name(),
                last_sync_version = new_last_sync,
                "advanced last sync version"
            );
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Bind every batch row's pk values in row-major order, matching the `@pN`
/// numbering the SQL builders emit.
fn bind_pk_values<'q>(
    mut query: Query<'q, Mssql, MssqlArguments>,
    rows: &'q [ChangeRow],
    pk_len: usize,
) -> Query<'q, Mssql, MssqlArguments> {
    for row in rows {
        for (_, value) in row.pk_values(pk_len) {
            query = query.bind(value.as_deref());
        }
    }
    query
}

/// Decode acquired rows into handler payloads, preserving batch order.
///
/// This runs strictly after the acquire transaction has committed, so an
/// unknown operation code or a payload-type mismatch fails a batch whose
/// leases and attempt counts are already recorded.
fn decode_changes<T: DeserializeOwned>(
    rows: &[ChangeRow],
    pk_len: usize,
) -> Result<Vec<SqlChange<T>>> {
    rows.iter()
        .map(|row| {
            let operation = row.operation()?;
            Ok(SqlChange {
                operation,
                item: row.deserialize_item(pk_len, operation)?,
            })
        })
        .collect()
}

/// The version the batch can propose as the new low-water-mark: the
/// second-largest distinct change version, or the sole version when the
/// batch holds only one. The batch is size-capped, so further changes may
/// exist at the largest version it saw — that version can never be proposed
/// outright.
fn recompute_last_sync_version(rows: &[ChangeRow]) -> Option<i64> {
    let mut versions: Vec<i64> = rows.iter().map(|row| row.version).collect();
    versions.sort_unstable();
    versions.dedup();
    match versions.len() {
        0 => None,
        1 => Some(versions[0]),
        n => Some(versions[n - 2]),
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::change::SqlChangeOperation;

    fn row(version: i64, operation: SqlChangeOperation) -> ChangeRow {
        ChangeRow {
            version,
            operation_code: operation.as_code().to_string(),
            columns: vec![
                ("Id".to_string(), Some(version.to_string())),
                (
                    "Customer".to_string(),
                    (!operation.is_delete()).then(|| "acme".to_string()),
                ),
            ],
        }
    }

    #[test]
    fn test_recompute_empty_batch() {
        assert_eq!(recompute_last_sync_version(&[]), None);
    }

    #[test]
    fn test_recompute_single_version() {
        let rows = vec![
            row(5, SqlChangeOperation::Insert),
            row(5, SqlChangeOperation::Update),
        ];
        assert_eq!(recompute_last_sync_version(&rows), Some(5));
    }

    #[test]
    fn test_recompute_takes_second_largest_distinct() {
        // A full batch over versions 1..=10 must propose 9: more changes may
        // exist at version 10 beyond the batch cap.
        let rows: Vec<ChangeRow> = (1..=10)
            .map(|v| row(v, SqlChangeOperation::Insert))
            .collect();
        assert_eq!(recompute_last_sync_version(&rows), Some(9));
    }

    #[test]
    fn test_recompute_ignores_duplicate_versions() {
        let rows = vec![
            row(5, SqlChangeOperation::Insert),
            row(5, SqlChangeOperation::Insert),
            row(7, SqlChangeOperation::Update),
        ];
        assert_eq!(recompute_last_sync_version(&rows), Some(5));
    }

    #[test]
    fn test_batch_state_clear_resets_everything() {
        let mut state = BatchState::new();
        state.state = MonitorState::ProcessingChanges;
        state.rows = vec![row(1, SqlChangeOperation::Insert)];
        state.lease_renewal_count = 3;

        state.clear();
        assert_eq!(state.state, MonitorState::CheckingForChanges);
        assert!(state.rows.is_empty());
        assert_eq!(state.lease_renewal_count, 0);
    }

    #[test]
    fn test_note_renewal_only_counts_while_processing() {
        let mut state = BatchState::new();
        assert!(!state.note_renewal(5, false));
        assert_eq!(state.lease_renewal_count, 0);
    }

    #[test]
    fn test_note_renewal_cancels_executor_at_budget() {
        let mut state = BatchState::new();
        state.state = MonitorState::ProcessingChanges;
        let in_flight = state.executor_cancel.clone();

        for _ in 0..4 {
            assert!(!state.note_renewal(5, false));
            assert!(!in_flight.is_cancelled());
        }
        assert!(state.note_renewal(5, false));
        assert!(in_flight.is_cancelled());
        // Later batches get a fresh token.
        assert!(!state.executor_cancel.is_cancelled());
    }

    #[test]
    fn test_note_renewal_skips_cancel_when_loop_is_stopping() {
        let mut state = BatchState::new();
        state.state = MonitorState::ProcessingChanges;
        state.lease_renewal_count = 4;
        let in_flight = state.executor_cancel.clone();

        assert!(!state.note_renewal(5, true));
        assert_eq!(state.lease_renewal_count, 5);
        assert!(!in_flight.is_cancelled());
    }

    #[test]
    fn test_decode_changes_shapes_payloads_by_operation() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Item {
            #[serde(rename = "Id")]
            id: i64,
            #[serde(rename = "Customer")]
            customer: Option<String>,
        }

        let rows = vec![
            row(1, SqlChangeOperation::Insert),
            row(2, SqlChangeOperation::Delete),
        ];
        let changes = decode_changes::<Item>(&rows, 1).unwrap();

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].operation, SqlChangeOperation::Insert);
        assert_eq!(changes[0].item.customer.as_deref(), Some("acme"));
        assert_eq!(changes[1].operation, SqlChangeOperation::Delete);
        assert_eq!(changes[1].item, Item { id: 2, customer: None });
    }

    #[test]
    fn test_decode_changes_surfaces_row_errors() {
        #[derive(Debug, Deserialize)]
        struct Strict {
            #[serde(rename = "Id")]
            #[allow(dead_code)]
            id: i64,
            #[serde(rename = "Customer")]
            #[allow(dead_code)]
            customer: String,
        }

        // The delete row carries no Customer value; a payload type that
        // requires it fails the whole batch.
        let rows = vec![row(2, SqlChangeOperation::Delete)];
        assert!(matches!(
            decode_changes::<Strict>(&rows, 1),
            Err(TriggerError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_changes_rejects_unknown_operation() {
        #[derive(Debug, Deserialize)]
        struct Item {
            #[serde(rename = "Id")]
            #[allow(dead_code)]
            id: i64,
        }

        let mut bad = row(3, SqlChangeOperation::Insert);
        bad.operation_code = "X".to_string();
        assert!(matches!(
            decode_changes::<Item>(&[bad], 1),
            Err(TriggerError::UnknownOperation(code)) if code == "X"
        ));
    }
}
