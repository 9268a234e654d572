use std::sync::Arc;
use tracing::{debug, error, info};

use super::notify_queue::{EnqueueError, dead_letter_queue_name, processing_queue_name};
use crate::domain::QueryTask;
use crate::domain::ports::{QueueStore, StoreError};

/// Single unsharded queue of upstream order status re-polls.
pub const ORDER_QUERY_QUEUE: &str = "order_query_tasks";

/// Queue of [`QueryTask`]s. Re-polls are idempotent, so there is no per-order
/// ordering to preserve and no sharding.
#[derive(Clone)]
pub struct OrderQueryQueue {
    store: Arc<dyn QueueStore>,
}

impl OrderQueryQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    pub async fn enqueue(&self, task: &QueryTask) -> Result<(), EnqueueError> {
        let payload = serde_json::to_string(task)?;
        self.store.enqueue(ORDER_QUERY_QUEUE, &payload).await?;

        debug!(
            order_no = %task.order_no,
            channel_no = %task.channel_no,
            retry_count = task.retry_count,
            "Order query task enqueued"
        );
        Ok(())
    }

    /// Claim up to `max` raw payloads; they stay in the processing list until
    /// acked.
    pub async fn claim_batch(&self, max: usize) -> Result<Vec<String>, StoreError> {
        self.store
            .claim_batch(ORDER_QUERY_QUEUE, &processing_queue_name(ORDER_QUERY_QUEUE), max)
            .await
    }

    pub async fn ack(&self, payload: &str) -> Result<(), StoreError> {
        self.store
            .ack(&processing_queue_name(ORDER_QUERY_QUEUE), payload)
            .await
    }

    pub async fn recover(&self) -> Result<usize, StoreError> {
        let moved = self
            .store
            .requeue_processing(&processing_queue_name(ORDER_QUERY_QUEUE), ORDER_QUERY_QUEUE)
            .await?;
        if moved > 0 {
            info!(moved, "Recovered unsettled order query tasks");
        }
        Ok(moved)
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.len(ORDER_QUERY_QUEUE).await
    }

    pub async fn dead_letter(&self, task: &QueryTask, reason: &str) -> Result<(), EnqueueError> {
        let payload = serde_json::to_string(task)?;
        error!(
            order_no = %task.order_no,
            transaction_no = %task.transaction_no,
            retry_count = task.retry_count,
            reason = %reason,
            "Order query task dead-lettered"
        );
        self.dead_letter_raw(&payload).await
    }

    pub async fn dead_letter_raw(&self, payload: &str) -> Result<(), EnqueueError> {
        self.store
            .enqueue(&dead_letter_queue_name(ORDER_QUERY_QUEUE), payload)
            .await?;
        Ok(())
    }
}
