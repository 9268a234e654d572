/*
   This module specifies the API by which the dispatch core talks to the shared
   queue store and reads the wall clock.
*/

use async_trait::async_trait;
use std::time::Duration;
use time::OffsetDateTime;

/// Error type for queue store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Store command {command} on key '{key}' failed: {reason}")]
    CommandFailed {
        command: &'static str,
        key: String,
        reason: String,
    },

    #[error("Key '{0}' holds a value of the wrong type")]
    WrongType(String),
}

/// Key/value, list and sorted-set primitives backing the dispatch queues and
/// the short-lived order-state cache.
///
/// Every method is a single atomic store operation. Callers must not assume
/// atomicity across two calls.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Push a value onto the tail of a list.
    async fn enqueue(&self, list_key: &str, value: &str) -> Result<(), StoreError>;

    /// Move up to `max` values from the head of `list_key` to the tail of
    /// `processing_key`, returning them in order. Each move is atomic, so a
    /// value is always in one of the two lists.
    async fn claim_batch(
        &self,
        list_key: &str,
        processing_key: &str,
        max: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Remove one occurrence of a claimed value once it has been settled.
    async fn ack(&self, processing_key: &str, value: &str) -> Result<(), StoreError>;

    /// Put every value left in `processing_key` back on the head of
    /// `list_key`, keeping their order. Returns how many were moved.
    async fn requeue_processing(
        &self,
        processing_key: &str,
        list_key: &str,
    ) -> Result<usize, StoreError>;

    async fn len(&self, list_key: &str) -> Result<usize, StoreError>;

    /// A miss is `Ok(None)`, never an error.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Add `delta` to the score of `member`, returning the new score.
    async fn incr_sorted_set(&self, key: &str, delta: f64, member: &str)
    -> Result<f64, StoreError>;

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    /// Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Returns `true` when a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// Source of the current time, injectable for deterministic scheduling tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}
