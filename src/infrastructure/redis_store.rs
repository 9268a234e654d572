use async_trait::async_trait;
use redis::{AsyncCommands, Direction};
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::info;

use crate::domain::ports::{QueueStore, StoreError};

/// Redis-backed queue store. Lists back the dispatch queues, plain keys the
/// order-state cache and sorted sets the stats counters.
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
}

impl RedisQueueStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::ConnectionError(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

        info!("Connected to redis queue store");
        Ok(Self { conn })
    }
}

fn command_failed(command: &'static str, key: &str) -> impl FnOnce(redis::RedisError) -> StoreError {
    let key = key.to_string();
    move |e| {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            StoreError::ConnectionError(e.to_string())
        } else {
            StoreError::CommandFailed {
                command,
                key,
                reason: e.to_string(),
            }
        }
    }
}

/// Redis TTLs are whole seconds; anything shorter rounds up to one.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue(&self, list_key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(list_key, value)
            .await
            .map_err(command_failed("RPUSH", list_key))
    }

    async fn claim_batch(
        &self,
        list_key: &str,
        processing_key: &str,
        max: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut claimed = Vec::new();
        while claimed.len() < max {
            let value: Option<String> = conn
                .lmove(list_key, processing_key, Direction::Left, Direction::Right)
                .await
                .map_err(command_failed("LMOVE", list_key))?;
            match value {
                Some(value) => claimed.push(value),
                None => break,
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, processing_key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(processing_key, 1, value)
            .await
            .map_err(command_failed("LREM", processing_key))
    }

    async fn requeue_processing(
        &self,
        processing_key: &str,
        list_key: &str,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let mut moved = 0;
        // Tail to head, so the claimed values keep their order in front of
        // whatever arrived since.
        loop {
            let value: Option<String> = conn
                .lmove(processing_key, list_key, Direction::Right, Direction::Left)
                .await
                .map_err(command_failed("LMOVE", processing_key))?;
            if value.is_none() {
                return Ok(moved);
            }
            moved += 1;
        }
    }

    async fn len(&self, list_key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        conn.llen::<_, usize>(list_key)
            .await
            .map_err(command_failed("LLEN", list_key))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(key).await.map_err(command_failed("GET", key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl_secs(ttl))
                .await
                .map_err(command_failed("SETEX", key)),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(command_failed("SET", key)),
        }
    }

    async fn incr_sorted_set(
        &self,
        key: &str,
        delta: f64,
        member: &str,
    ) -> Result<f64, StoreError> {
        let mut conn = self.conn.clone();
        conn.zincr::<_, _, _, f64>(key, member, delta)
            .await
            .map_err(command_failed("ZINCRBY", key))
    }

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let mut conn = self.conn.clone();
        conn.zscore::<_, _, Option<f64>>(key, member)
            .await
            .map_err(command_failed("ZSCORE", key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.expire::<_, bool>(key, ttl_secs(ttl) as i64)
            .await
            .map_err(command_failed("EXPIRE", key))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.exists::<_, bool>(key)
            .await
            .map_err(command_failed("EXISTS", key))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(key).await.map_err(command_failed("DEL", key))?;
        Ok(removed > 0)
    }
}
