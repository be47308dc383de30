use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

/// Stream of value changes for one store path. `None` means the path is unset.
pub type ValueStream = BoxStream<'static, Result<Option<Value>, FlagStoreError>>;

/// Read/write/subscribe contract of the remote flag store.
///
/// A subscription yields the current value first, then every subsequent change.
#[async_trait]
pub trait RemoteFlagStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, FlagStoreError>;

    async fn set(&self, path: &str, value: Value) -> Result<(), FlagStoreError>;

    async fn subscribe(&self, path: &str) -> Result<ValueStream, FlagStoreError>;

    /// Check reachability (for health checks).
    async fn health_check(&self) -> Result<(), FlagStoreError> {
        Ok(())
    }
}

/// Read a boolean flag, treating unset or non-boolean values as false.
pub async fn get_bool(store: &dyn RemoteFlagStore, path: &str) -> Result<bool, FlagStoreError> {
    Ok(store.get(path).await?.and_then(|v| v.as_bool()).unwrap_or(false))
}

/// In-process store backed by one watch channel per path.
#[derive(Default)]
pub struct MemoryFlagStore {
    paths: Mutex<HashMap<String, watch::Sender<Option<Value>>>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sender<R>(&self, path: &str, f: impl FnOnce(&watch::Sender<Option<Value>>) -> R) -> R {
        let mut paths = self.paths.lock().unwrap_or_else(|e| e.into_inner());
        let sender = paths
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(None).0);
        f(sender)
    }

    /// Number of live subscriptions on `path`.
    pub fn subscriber_count(&self, path: &str) -> usize {
        self.with_sender(path, |tx| tx.receiver_count())
    }
}

#[async_trait]
impl RemoteFlagStore for MemoryFlagStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, FlagStoreError> {
        Ok(self.with_sender(path, |tx| tx.borrow().clone()))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), FlagStoreError> {
        self.with_sender(path, |tx| tx.send_replace(Some(value)));
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<ValueStream, FlagStoreError> {
        let mut rx = self.with_sender(path, |tx| tx.subscribe());
        let initial = rx.borrow_and_update().clone();

        let changes = stream::unfold(rx, |mut rx| async move {
            match rx.changed().await {
                Ok(()) => {
                    let value = rx.borrow_and_update().clone();
                    Some((Ok::<_, FlagStoreError>(value), rx))
                }
                Err(_) => None,
            }
        });

        Ok(stream::once(async move { Ok::<_, FlagStoreError>(initial) }).chain(changes).boxed())
    }
}

/// Redis-backed store. Values are JSON strings under the path key; every
/// write is also published on a channel named after the path.
pub struct RedisFlagStore {
    client: redis::Client,
}

impl RedisFlagStore {
    pub fn new(redis_url: &str) -> Result<Self, FlagStoreError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

fn decode(raw: Option<String>) -> Result<Option<Value>, FlagStoreError> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(FlagStoreError::from)
}

#[async_trait]
impl RemoteFlagStore for RedisFlagStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, FlagStoreError> {
        use redis::AsyncCommands;

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(path).await?;
        decode(raw)
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), FlagStoreError> {
        use redis::AsyncCommands;

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(&value)?;
        conn.set::<_, _, ()>(path, &payload).await?;
        conn.publish::<_, _, ()>(path, &payload).await?;
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<ValueStream, FlagStoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(path).await?;

        // Subscribe before reading so a write between the two is not lost.
        let initial = self.get(path).await?;

        let changes = pubsub.into_on_message().map(|msg| -> Result<Option<Value>, FlagStoreError> {
            let payload: String = msg.get_payload()?;
            Ok(Some(serde_json::from_str(&payload)?))
        });

        // The message stream ends when the connection drops; surface that as
        // an error so the subscriber re-subscribes.
        let channel = path.to_string();
        let closed = stream::once(async move { Err(FlagStoreError::Closed(channel)) });

        Ok(stream::once(async move { Ok::<_, FlagStoreError>(initial) })
            .chain(changes)
            .chain(closed)
            .boxed())
    }

    async fn health_check(&self) -> Result<(), FlagStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlagStoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Subscription closed: {0}")]
    Closed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_subscribe_yields_initial_then_changes() {
        let store = MemoryFlagStore::new();
        store.set("users/1/flag", json!(false)).await.unwrap();

        let mut updates = store.subscribe("users/1/flag").await.unwrap();
        assert_eq!(updates.next().await.unwrap().unwrap(), Some(json!(false)));

        store.set("users/1/flag", json!(true)).await.unwrap();
        assert_eq!(updates.next().await.unwrap().unwrap(), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_get_bool_defaults_to_false() {
        let store = MemoryFlagStore::new();
        assert!(!get_bool(&store, "users/1/missing").await.unwrap());

        store.set("users/1/flag", json!("yes")).await.unwrap();
        assert!(!get_bool(&store, "users/1/flag").await.unwrap());

        store.set("users/1/flag", json!(true)).await.unwrap();
        assert!(get_bool(&store, "users/1/flag").await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_receiver() {
        let store = MemoryFlagStore::new();
        let updates = store.subscribe("users/1/flag").await.unwrap();
        assert_eq!(store.subscriber_count("users/1/flag"), 1);
        drop(updates);
        assert_eq!(store.subscriber_count("users/1/flag"), 0);
    }
}
