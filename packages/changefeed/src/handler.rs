//! The executor seam: user handlers consumed by the monitor.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::change::SqlChange;

/// Processes one batch of row changes.
///
/// Delivery is at-least-once: a batch whose handler fails (or whose worker
/// dies mid-flight) is re-delivered after lease expiry, possibly to another
/// worker. A handler that cannot tolerate duplicates must deduplicate on the
/// primary key and change version itself.
///
/// Implementations must honor `cancel`: when the monitor decides a handler
/// is stuck (the lease-renewal budget ran out) it trips the token and
/// expects `try_execute` to unwind promptly. Returning `Err` marks the whole
/// batch failed; the rows' leases expire and the batch becomes claimable
/// again.
#[async_trait]
pub trait ChangeHandler<T>: Send + Sync {
    async fn try_execute(
        &self,
        changes: Vec<SqlChange<T>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, H> ChangeHandler<T> for Arc<H>
where
    T: Send + 'static,
    H: ChangeHandler<T> + ?Sized,
{
    async fn try_execute(
        &self,
        changes: Vec<SqlChange<T>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        (**self).try_execute(changes, cancel).await
    }
}
