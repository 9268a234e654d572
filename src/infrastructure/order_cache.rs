use std::sync::Arc;
use tracing::debug;

use crate::domain::order_state::{order_state_key, upi_order_no_key, upi_wallets_key};
use crate::domain::ports::{QueueStore, StoreError};
use crate::domain::{OrderState, WalletInfo};

/// Error type for order cache lookups
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// The key is absent or empty. Not a store failure.
    #[error("Not found in cache: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to decode cached value at '{key}': {reason}")]
    Decode { key: String, reason: String },
}

/// Read-only view over the order-state entries that the order pipeline keeps
/// in the queue store.
#[derive(Clone)]
pub struct OrderCache {
    store: Arc<dyn QueueStore>,
}

impl OrderCache {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Resolve the internal order number behind a public UPI id.
    pub async fn order_no_for(&self, upi_id: &str) -> Result<String, LookupError> {
        self.get_non_empty(&upi_order_no_key(upi_id)).await
    }

    pub async fn order_state(&self, order_no: &str) -> Result<OrderState, LookupError> {
        let key = order_state_key(order_no);
        let raw = self.get_non_empty(&key).await?;
        serde_json::from_str(&raw).map_err(|e| LookupError::Decode {
            key,
            reason: e.to_string(),
        })
    }

    pub async fn order_state_by_upi_id(&self, upi_id: &str) -> Result<OrderState, LookupError> {
        let order_no = self.order_no_for(upi_id).await?;
        self.order_state(&order_no).await
    }

    /// Raw wallet list JSON; decoding is left to the caller so a present but
    /// malformed entry can be told apart from a miss.
    pub async fn wallets_raw(&self, upi_id: &str) -> Result<String, LookupError> {
        self.get_non_empty(&upi_wallets_key(upi_id)).await
    }

    pub fn decode_wallets(upi_id: &str, raw: &str) -> Result<Vec<WalletInfo>, LookupError> {
        serde_json::from_str(raw).map_err(|e| LookupError::Decode {
            key: upi_wallets_key(upi_id),
            reason: e.to_string(),
        })
    }

    /// Round-trip to the store without touching any order.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.exists("payin:health").await.map(|_| ())
    }

    async fn get_non_empty(&self, key: &str) -> Result<String, LookupError> {
        match self.store.get(key).await? {
            Some(value) if !value.is_empty() => Ok(value),
            _ => {
                debug!(key = %key, "Cache miss");
                Err(LookupError::NotFound(key.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory_store::InMemoryQueueStore;

    async fn seeded_cache() -> (InMemoryQueueStore, OrderCache) {
        let store = InMemoryQueueStore::new();
        store
            .set("payin:upi:u1:no", "P20250620153501120001", None)
            .await
            .unwrap();
        store
            .set(
                "payin:order:P20250620153501120001",
                r#"{"status":"success","channel_id":3,"return_url":"https://r"}"#,
                None,
            )
            .await
            .unwrap();
        let cache = OrderCache::new(Arc::new(store.clone()));
        (store, cache)
    }

    #[tokio::test]
    async fn test_order_state_by_upi_id() {
        let (_, cache) = seeded_cache().await;

        let state = cache.order_state_by_upi_id("u1").await.unwrap();
        assert_eq!(state.status, "success");
        assert_eq!(state.channel_id, 3);
    }

    #[tokio::test]
    async fn test_miss_is_not_found() {
        let (_, cache) = seeded_cache().await;

        let result = cache.order_state_by_upi_id("unknown").await;
        assert!(matches!(result, Err(LookupError::NotFound(key)) if key == "payin:upi:unknown:no"));
    }

    #[tokio::test]
    async fn test_empty_value_is_not_found() {
        let (store, cache) = seeded_cache().await;
        store.set("payin:upi:u2:no", "", None).await.unwrap();

        assert!(matches!(
            cache.order_no_for("u2").await,
            Err(LookupError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_store_failure_is_distinct_from_miss() {
        let (store, cache) = seeded_cache().await;
        store.set_offline(true);

        assert!(matches!(
            cache.order_state_by_upi_id("u1").await,
            Err(LookupError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_ping_follows_store_availability() {
        let (store, cache) = seeded_cache().await;
        assert!(cache.ping().await.is_ok());

        store.set_offline(true);
        assert!(cache.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_undecodable_state() {
        let (store, cache) = seeded_cache().await;
        store.set("payin:order:BAD", "not json", None).await.unwrap();

        assert!(matches!(
            cache.order_state("BAD").await,
            Err(LookupError::Decode { .. })
        ));
    }
}
