//! Lifecycle control for an active subscription.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::macros::log_debug;
use crate::{Result, TransportPtr};

/// Handle to a live subscription created by `respond_to` or `tap_into`.
///
/// Canceling stops new deliveries; dispatch tasks already spawned run to
/// completion and can be awaited with [`join`](Self::join).
pub struct ResponderHandle {
    // ---
    transport: TransportPtr,
    queue: String,
    consumer_tag: String,
    loop_task: JoinHandle<()>,
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

impl ResponderHandle {
    pub(crate) fn new(
        transport: TransportPtr,
        queue: String,
        consumer_tag: String,
        loop_task: JoinHandle<()>,
        semaphore: Arc<Semaphore>,
        capacity: u32,
    ) -> Self {
        // ---
        Self {
            transport,
            queue,
            consumer_tag,
            loop_task,
            semaphore,
            capacity,
        }
    }

    /// Name of the backing queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop the subscription.
    ///
    /// No further deliveries are dispatched; handler tasks already
    /// running are not interrupted.
    pub async fn cancel(&self) -> Result<()> {
        // ---
        log_debug!("canceling consumer {} on {}", self.consumer_tag, self.queue);
        self.transport.cancel(&self.consumer_tag).await?;
        self.loop_task.abort();
        Ok(())
    }

    /// Cancel and delete the backing queue.
    ///
    /// Used for ephemeral per-call listeners.
    pub async fn destroy(&self) -> Result<()> {
        // ---
        self.cancel().await?;
        self.transport.delete_queue(&self.queue).await
    }

    /// Wait until every in-flight dispatch task for this subscription has
    /// completed. Best-effort: call after [`cancel`](Self::cancel) for a
    /// graceful drain.
    pub async fn join(&self) {
        // ---
        // Every dispatch task holds one permit; holding the full capacity
        // means none are left running.
        if let Ok(permit) = self.semaphore.acquire_many(self.capacity).await {
            drop(permit);
        }
    }
}
