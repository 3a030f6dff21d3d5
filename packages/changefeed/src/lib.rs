//! # Changefeed
//!
//! A change-data-capture trigger engine: continuously observes one
//! change-tracked SQL table, batches detected row changes, and dispatches
//! each batch to a user handler with at-least-once delivery. Any number of
//! worker processes may run the same trigger; they compete for rows through
//! an expiring-lease protocol in a shared worker table.
//!
//! ## Architecture
//!
//! ```text
//! start(config, handler)
//!     │
//!     ├─► resolve table identity + primary key (catalog)
//!     ├─► bootstrap [changefeed] schema, GlobalState, Worker_<fn>_<table>
//!     │
//!     ▼
//! ChangeMonitor ── polling loop ──► CHANGETABLE(CHANGES …) since LastSyncVersion
//!     │                               claim leases ─► handler.try_execute(batch)
//!     │                               release ─► advance LastSyncVersion
//!     └── renewal loop ─────────────► extend leases while the handler runs;
//!                                     cancel handlers that never return
//! ```
//!
//! ## Guarantees
//!
//! - **At-least-once**: a batch whose handler fails, or whose worker dies,
//!   is re-claimed after lease expiry — by any peer.
//! - **Exactly one claimant**: two peers may see the same change, but the
//!   lease acquisition under an exclusive worker-table lock admits one.
//! - **Bounded retries**: the attempt count is incremented at claim time, so
//!   a row that keeps failing is abandoned after `max_attempt_count`
//!   attempts even across worker crashes.
//! - **Safe low-water-mark**: `LastSyncVersion` only advances once every
//!   competing worker has drained its share of that version, which is what
//!   permits garbage-collecting worker rows.
//!
//! Not provided: exactly-once delivery, ordering across different primary
//! keys, or tolerance of user-table schema changes while a monitor runs.
//!
//! ## Example
//!
//! ```ignore
//! use changefeed::{ChangeHandler, SqlChange, TriggerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(serde::Deserialize)]
//! struct Order {
//!     #[serde(rename = "Id")]
//!     id: i64,
//!     #[serde(rename = "Status")]
//!     status: String,
//! }
//!
//! struct AuditHandler;
//!
//! #[async_trait::async_trait]
//! impl ChangeHandler<Order> for AuditHandler {
//!     async fn try_execute(
//!         &self,
//!         changes: Vec<SqlChange<Order>>,
//!         cancel: CancellationToken,
//!     ) -> anyhow::Result<()> {
//!         for change in changes {
//!             if cancel.is_cancelled() {
//!                 anyhow::bail!("cancelled");
//!             }
//!             println!("{} order {}", change.operation, change.item.id);
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> changefeed::Result<()> {
//! let config = TriggerConfig::new(
//!     std::env::var("DATABASE_URL").unwrap(),
//!     "dbo.Orders",
//!     "audit-orders",
//! )
//! .with_env_overrides()?;
//!
//! let monitor = changefeed::start::<Order, _>(config, AuditHandler).await?;
//! // … host runs …
//! monitor.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod change;
pub mod config;
pub mod error;
pub mod handler;

mod init;
mod monitor;
mod row;
mod sql;
mod table;

pub use change::{SqlChange, SqlChangeOperation};
pub use config::TriggerConfig;
pub use error::{Result, TriggerError};
pub use handler::ChangeHandler;
pub use init::start;
pub use monitor::ChangeMonitor;
