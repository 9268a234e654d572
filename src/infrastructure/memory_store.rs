use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::ports::{QueueStore, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(VecDeque<String>),
    SortedSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process queue store.
///
/// Expired keys are treated as absent on read and dropped on the next write.
/// Can be switched offline to simulate an unreachable cache.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        debug!(offline, "In-memory store availability changed");
    }

    /// Snapshot of a list without consuming it.
    pub async fn list_items(&self, list_key: &str) -> Vec<String> {
        let entries = self.entries.read().await;
        match entries.get(list_key) {
            Some(Entry {
                value: Value::List(items),
                ..
            }) => items.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionError(
                "in-memory store is offline".to_string(),
            ));
        }
        Ok(())
    }

    /// Live entry for `key`, evicting it first if it has expired.
    fn live_entry<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    /// The list at `key`, created empty if absent.
    fn list_mut<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
    ) -> Result<&'a mut VecDeque<String>, StoreError> {
        if Self::live_entry(entries, key).is_none() {
            entries.insert(key.to_string(), Entry::new(Value::List(VecDeque::new())));
        }
        match entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::List(items)) => Ok(items),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Empty lists disappear, as they do in Redis.
    fn drop_if_empty(entries: &mut HashMap<String, Entry>, key: &str) {
        if matches!(entries.get(key), Some(Entry { value: Value::List(items), .. }) if items.is_empty())
        {
            entries.remove(key);
        }
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, list_key: &str, value: &str) -> Result<(), StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write().await;
        Self::list_mut(&mut entries, list_key)?.push_back(value.to_string());
        Ok(())
    }

    async fn claim_batch(
        &self,
        list_key: &str,
        processing_key: &str,
        max: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write().await;

        let claimed = match Self::live_entry(&mut entries, list_key).map(|e| &mut e.value) {
            None => return Ok(Vec::new()),
            Some(Value::List(items)) => {
                let count = max.min(items.len());
                items.drain(..count).collect::<Vec<_>>()
            }
            Some(_) => return Err(StoreError::WrongType(list_key.to_string())),
        };
        Self::drop_if_empty(&mut entries, list_key);

        if !claimed.is_empty() {
            Self::list_mut(&mut entries, processing_key)?.extend(claimed.iter().cloned());
        }
        Ok(claimed)
    }

    async fn ack(&self, processing_key: &str, value: &str) -> Result<(), StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write().await;

        match Self::live_entry(&mut entries, processing_key).map(|e| &mut e.value) {
            None => return Ok(()),
            Some(Value::List(items)) => {
                if let Some(index) = items.iter().position(|item| item == value) {
                    items.remove(index);
                }
            }
            Some(_) => return Err(StoreError::WrongType(processing_key.to_string())),
        }
        Self::drop_if_empty(&mut entries, processing_key);
        Ok(())
    }

    async fn requeue_processing(
        &self,
        processing_key: &str,
        list_key: &str,
    ) -> Result<usize, StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write().await;

        let leftover = match Self::live_entry(&mut entries, processing_key).map(|e| &mut e.value) {
            None => return Ok(0),
            Some(Value::List(items)) => std::mem::take(items),
            Some(_) => return Err(StoreError::WrongType(processing_key.to_string())),
        };
        entries.remove(processing_key);

        let moved = leftover.len();
        if moved > 0 {
            let items = Self::list_mut(&mut entries, list_key)?;
            for value in leftover.into_iter().rev() {
                items.push_front(value);
            }
        }
        Ok(moved)
    }

    async fn len(&self, list_key: &str) -> Result<usize, StoreError> {
        self.check_online()?;
        let entries = self.entries.read().await;
        match entries.get(list_key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.value {
                Value::List(items) => Ok(items.len()),
                _ => Err(StoreError::WrongType(list_key.to_string())),
            },
            _ => Ok(0),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.value {
                Value::Text(text) => Ok(Some(text.clone())),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr_sorted_set(
        &self,
        key: &str,
        delta: f64,
        member: &str,
    ) -> Result<f64, StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write().await;
        if Self::live_entry(&mut entries, key).is_none() {
            entries.insert(key.to_string(), Entry::new(Value::SortedSet(HashMap::new())));
        }

        match entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::SortedSet(members)) => {
                let score = members.entry(member.to_string()).or_insert(0.0);
                *score += delta;
                Ok(*score)
            }
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.check_online()?;
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => match &entry.value {
                Value::SortedSet(members) => Ok(members.get(member).copied()),
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            _ => Ok(None),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write().await;
        match Self::live_entry(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .is_some_and(|entry| entry.is_live(Instant::now())))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        Ok(entries.remove(key).is_some_and(|entry| entry.is_live(now)))
    }
}
