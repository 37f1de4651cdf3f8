use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

pub mod keys {
    use uuid::Uuid;

    pub const CURRENT_STATUS: &str = "current-status";
    pub const CURRENT_WORKING: &str = "current-working";
    pub const PENDING_QUEUE: &str = "pending-queue";
    pub const LAST_STATS: &str = "last-stats";
    pub const JOB_PATTERN: &str = "job-*";

    pub fn job(id: Uuid) -> String {
        format!("job-{id}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error for {key}: {message}")]
    Deserialization { key: String, message: String },

    #[error("key {0} holds a value of the wrong kind")]
    WrongType(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Command(err.to_string())
    }
}

/// Raw string operations over the shared key-value store.
///
/// Absent keys are reported as `None` or an empty list, never as errors.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn list_push_front(&self, key: &str, value: String) -> Result<(), StoreError>;
    async fn list_pop_back(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError>;
    /// Removes every list entry equal to `value`, returning how many were dropped.
    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // SETEX rejects a zero expiry.
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn list_push_front(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn list_pop_back(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.rpop(key, None).await?)
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.lpop(key, None).await?)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, 0, -1).await?)
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.lrem(key, 0, value).await?)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(pattern).await?)
    }
}

/// In-process store with the same semantics as the Redis adapter, expiry included.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

#[derive(Debug)]
struct MemoryEntry {
    slot: Slot,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
enum Slot {
    Value(String),
    List(VecDeque<String>),
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at
            .map(|deadline| deadline <= Instant::now())
            .unwrap_or(false)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live<'a>(
    entries: &'a mut HashMap<String, MemoryEntry>,
    key: &str,
) -> Option<&'a mut MemoryEntry> {
    if entries.get(key).map(MemoryEntry::expired).unwrap_or(false) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, MemoryEntry>,
    key: &str,
) -> Result<Option<&'a mut VecDeque<String>>, StoreError> {
    match live(entries, key) {
        Some(MemoryEntry {
            slot: Slot::List(items),
            ..
        }) => Ok(Some(items)),
        Some(_) => Err(StoreError::WrongType(key.to_string())),
        None => Ok(None),
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.inner.lock().await;
        match live(&mut entries, key) {
            Some(MemoryEntry {
                slot: Slot::Value(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut entries = self.inner.lock().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                slot: Slot::Value(value),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.inner.lock().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                slot: Slot::Value(value),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().await.remove(key);
        Ok(())
    }

    async fn list_push_front(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut entries = self.inner.lock().await;
        match list_mut(&mut entries, key)? {
            Some(items) => items.push_front(value),
            None => {
                entries.insert(
                    key.to_string(),
                    MemoryEntry {
                        slot: Slot::List(VecDeque::from([value])),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn list_pop_back(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.inner.lock().await;
        let popped = list_mut(&mut entries, key)?.and_then(VecDeque::pop_back);
        drop_if_empty(&mut entries, key);
        Ok(popped)
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.inner.lock().await;
        let popped = list_mut(&mut entries, key)?.and_then(VecDeque::pop_front);
        drop_if_empty(&mut entries, key);
        Ok(popped)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.inner.lock().await;
        Ok(list_mut(&mut entries, key)?
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut entries = self.inner.lock().await;
        let removed = match list_mut(&mut entries, key)? {
            Some(items) => {
                let before = items.len();
                items.retain(|item| item != value);
                before - items.len()
            }
            None => 0,
        };
        drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.inner.lock().await;
        entries.retain(|_, entry| !entry.expired());
        let mut matched: Vec<String> = entries
            .keys()
            .filter(|key| glob_match(pattern.as_bytes(), key.as_bytes()))
            .cloned()
            .collect();
        matched.sort();
        Ok(matched)
    }
}

// Redis deletes a list key once its last element is gone.
fn drop_if_empty(entries: &mut HashMap<String, MemoryEntry>, key: &str) {
    let empty = matches!(
        entries.get(key),
        Some(MemoryEntry { slot: Slot::List(items), .. }) if items.is_empty()
    );
    if empty {
        entries.remove(key);
    }
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

/// JSON-typed view over a [`KeyValueStore`].
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn KeyValueStore>,
}

impl Store {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.backend.get(key).await? {
            Some(raw) => decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.backend.set(key, encode(value)?).await
    }

    pub async fn set_ex<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.backend.set_ex(key, encode(value)?, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.backend.delete(key).await
    }

    pub async fn list_push_front<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        self.backend.list_push_front(key, encode(value)?).await
    }

    pub async fn list_pop_back<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.backend.list_pop_back(key).await? {
            Some(raw) => decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn list_pop_front<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.backend.list_pop_front(key).await? {
            Some(raw) => decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    pub async fn list_range<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, StoreError> {
        self.backend
            .list_range(key)
            .await?
            .iter()
            .map(|raw| decode(key, raw))
            .collect()
    }

    pub async fn list_range_raw(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.backend.list_range(key).await
    }

    pub async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.backend.list_range(key).await?.len())
    }

    pub async fn list_remove_raw(&self, key: &str, raw: &str) -> Result<usize, StoreError> {
        self.backend.list_remove(key, raw).await
    }

    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        self.backend.keys(pattern).await
    }

    pub async fn job_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .keys(keys::JOB_PATTERN)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix("job-"))
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect())
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Deserialization {
        key: key.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[tokio::test]
    async fn absent_keys_are_none_not_errors() {
        let store = Store::memory();
        let value: Option<Value> = store.get("missing").await.unwrap();
        assert!(value.is_none());
        let popped: Option<Value> = store.list_pop_back("missing").await.unwrap();
        assert!(popped.is_none());
        let popped: Option<Value> = store.list_pop_front("missing").await.unwrap();
        assert!(popped.is_none());
        assert!(store.list_range::<Value>("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn values_are_json_encoded() {
        let backend = Arc::new(MemoryStore::new());
        let store = Store::new(backend.clone());
        store.set("k", &json!({"a": 1})).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some(r#"{"a":1}"#));
        let back: Value = store.get("k").await.unwrap().unwrap();
        assert_eq!(back, json!({"a": 1}));
    }

    #[tokio::test]
    async fn set_ex_expires() {
        let store = Store::memory();
        store
            .set_ex("short", &"v", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get::<String>("short").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get::<String>("short").await.unwrap().is_none());
        assert!(store.keys("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_front_pop_back_is_fifo() {
        let store = Store::memory();
        for n in 1..=3 {
            store.list_push_front("q", &n).await.unwrap();
        }
        assert_eq!(store.list_range::<i32>("q").await.unwrap(), vec![3, 2, 1]);
        assert_eq!(store.list_pop_back::<i32>("q").await.unwrap(), Some(1));
        assert_eq!(store.list_pop_front::<i32>("q").await.unwrap(), Some(3));
        assert_eq!(store.list_pop_back::<i32>("q").await.unwrap(), Some(2));
        assert_eq!(store.list_pop_back::<i32>("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_remove_drops_exact_matches() {
        let store = Store::memory();
        for value in ["a", "b", "a"] {
            store.list_push_front("q", value).await.unwrap();
        }
        assert_eq!(store.list_remove_raw("q", "\"a\"").await.unwrap(), 2);
        assert_eq!(store.list_range::<String>("q").await.unwrap(), vec!["b"]);
        assert_eq!(store.list_remove_raw("q", "\"zzz\"").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_ops_on_plain_value_are_rejected() {
        let store = Store::memory();
        store.set("plain", &1).await.unwrap();
        let err = store.list_push_front("plain", &2).await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType(_)));
    }

    #[tokio::test]
    async fn undecodable_value_reports_key() {
        let backend = Arc::new(MemoryStore::new());
        backend.set("bad", "{not json".to_string()).await.unwrap();
        let store = Store::new(backend);
        match store.get::<Value>("bad").await {
            Err(StoreError::Deserialization { key, .. }) => assert_eq!(key, "bad"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn keys_match_glob_patterns() {
        let store = Store::memory();
        let id = Uuid::new_v4();
        store.set(&keys::job(id), &json!({})).await.unwrap();
        store.set(keys::CURRENT_STATUS, &json!({})).await.unwrap();
        assert_eq!(store.keys("job-*").await.unwrap(), vec![keys::job(id)]);
        assert_eq!(store.job_ids().await.unwrap(), vec![id]);
        assert_eq!(store.keys("current-?tatus").await.unwrap().len(), 1);
    }
}
