use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::domain::NotificationTask;
use crate::domain::ports::{QueueStore, StoreError};

/// Base name of the sharded merchant notification queue.
pub const MERCHANT_NOTIFY_QUEUE: &str = "merchant_notify_queue";

pub const QUEUE_SHARD_COUNT: usize = 10;

const DEAD_LETTER_SUFFIX: &str = "_dead_letter";

const PROCESSING_SUFFIX: &str = "_processing";

/// Upper bound on how long an order stays held if the worker holding it
/// never settles the retried task.
pub const ORDER_HOLD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Error type for pushing a task onto a dispatch queue
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("Failed to serialize task: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Shard owning `order_no`: the sum of its character codes modulo
/// `shard_count`.
pub fn shard_index(order_no: &str, shard_count: usize) -> usize {
    let sum: u64 = order_no.chars().map(|c| c as u64).sum();
    (sum % shard_count.max(1) as u64) as usize
}

pub fn shard_queue_name(shard: usize) -> String {
    format!("{MERCHANT_NOTIFY_QUEUE}_{shard}")
}

pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// List holding the payloads a worker has claimed but not yet settled.
pub fn processing_queue_name(queue: &str) -> String {
    format!("{queue}{PROCESSING_SUFFIX}")
}

/// Identifies one scheduled attempt of a task. A task waiting on a retry is
/// the only one with this token until it is rescheduled again.
pub fn hold_token(task: &NotificationTask) -> String {
    format!("{}@{}", task.retry_count, task.next_notify_at.unix_timestamp())
}

/// Sharded queue of merchant notifications.
///
/// Every task for one order lands on the same shard, so a single worker sees
/// them in submission order. While a task waits on a retry, its order is held:
/// the hold names the waiting task, and the worker pushes back every other
/// task of that order until the hold is released.
#[derive(Clone)]
pub struct NotifyQueue {
    store: Arc<dyn QueueStore>,
    shard_count: usize,
}

impl NotifyQueue {
    pub fn new(store: Arc<dyn QueueStore>, shard_count: usize) -> Self {
        Self {
            store,
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Name of the shard queue that owns `order_no`.
    pub fn queue_for(&self, order_no: &str) -> String {
        shard_queue_name(shard_index(order_no, self.shard_count))
    }

    /// Push a task onto the tail of its shard. Returns the queue name.
    pub async fn enqueue(&self, task: &NotificationTask) -> Result<String, EnqueueError> {
        let payload = serde_json::to_string(task)?;
        let queue = self.queue_for(&task.order_no);
        self.store.enqueue(&queue, &payload).await?;

        debug!(
            order_no = %task.order_no,
            queue = %queue,
            retry_count = task.retry_count,
            "Notification task enqueued"
        );
        Ok(queue)
    }

    /// Claim up to `max` raw payloads from the head of one shard. They stay in
    /// the shard's processing list until [`NotifyQueue::ack`].
    pub async fn claim_batch(&self, shard: usize, max: usize) -> Result<Vec<String>, StoreError> {
        let queue = shard_queue_name(shard);
        self.store
            .claim_batch(&queue, &processing_queue_name(&queue), max)
            .await
    }

    /// Drop a settled payload from the shard's processing list.
    pub async fn ack(&self, shard: usize, payload: &str) -> Result<(), StoreError> {
        self.store
            .ack(&processing_queue_name(&shard_queue_name(shard)), payload)
            .await
    }

    /// Return payloads a previous worker claimed but never settled to the head
    /// of the shard.
    pub async fn recover(&self, shard: usize) -> Result<usize, StoreError> {
        let queue = shard_queue_name(shard);
        let moved = self
            .store
            .requeue_processing(&processing_queue_name(&queue), &queue)
            .await?;
        if moved > 0 {
            info!(queue = %queue, moved, "Recovered unsettled notification tasks");
        }
        Ok(moved)
    }

    fn hold_key(&self, order_no: &str) -> String {
        format!("{}:hold:{order_no}", self.queue_for(order_no))
    }

    /// Token of the task currently holding `order_no`, if any.
    pub async fn holder(&self, order_no: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&self.hold_key(order_no)).await
    }

    /// Hold the task's order until this attempt of the task is settled.
    pub async fn hold(&self, task: &NotificationTask) -> Result<(), StoreError> {
        self.store
            .set(
                &self.hold_key(&task.order_no),
                &hold_token(task),
                Some(ORDER_HOLD_TTL),
            )
            .await
    }

    pub async fn release(&self, order_no: &str) -> Result<(), StoreError> {
        self.store.delete(&self.hold_key(order_no)).await?;
        Ok(())
    }

    pub async fn len(&self, shard: usize) -> Result<usize, StoreError> {
        self.store.len(&shard_queue_name(shard)).await
    }

    /// Park a task that exhausted its retries or can never succeed.
    pub async fn dead_letter(&self, task: &NotificationTask, reason: &str) -> Result<(), EnqueueError> {
        let payload = serde_json::to_string(task)?;
        error!(
            order_no = %task.order_no,
            merchant_no = %task.merchant_no,
            retry_count = task.retry_count,
            reason = %reason,
            "Notification task dead-lettered"
        );
        self.dead_letter_raw(&payload).await
    }

    /// Park a payload that could not even be decoded.
    pub async fn dead_letter_raw(&self, payload: &str) -> Result<(), EnqueueError> {
        let queue = dead_letter_queue_name(MERCHANT_NOTIFY_QUEUE);
        self.store.enqueue(&queue, payload).await?;
        Ok(())
    }
}
