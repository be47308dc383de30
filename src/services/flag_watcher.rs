use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::models::flag::{FlagKind, RemoteFlag};
use crate::services::backoff::Backoff;
use crate::services::flag_store::RemoteFlagStore;

/// Callback invoked with every observed flag transition.
pub type FlagCallback = Arc<dyn Fn(RemoteFlag) + Send + Sync>;

type SubscriptionKey = (String, FlagKind);

/// Registry of remote flag subscriptions, one per (user, kind).
pub struct FlagWatcher {
    store: Arc<dyn RemoteFlagStore>,
    backoff: Backoff,
    subscriptions: Mutex<HashMap<SubscriptionKey, JoinHandle<()>>>,
}

impl FlagWatcher {
    pub fn new(store: Arc<dyn RemoteFlagStore>, backoff: Backoff) -> Self {
        Self {
            store,
            backoff,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching `kind` for `user_id`. Returns false if a subscription
    /// for that key is already live.
    ///
    /// `on_change` runs on the subscription task and must only hand off work.
    pub fn watch<F>(&self, user_id: &str, kind: FlagKind, on_change: F) -> bool
    where
        F: Fn(RemoteFlag) + Send + Sync + 'static,
    {
        let key = (user_id.to_string(), kind);
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        if subscriptions.contains_key(&key) {
            debug!(user_id, %kind, "Flag already watched");
            return false;
        }

        let handle = tokio::spawn(run_subscription(
            self.store.clone(),
            user_id.to_string(),
            kind,
            self.backoff,
            Arc::new(on_change),
        ));
        subscriptions.insert(key, handle);
        info!(user_id, %kind, "Watching remote flag");
        true
    }

    /// Cancel the subscription for (`user_id`, `kind`). Unknown keys are ignored.
    pub fn unwatch(&self, user_id: &str, kind: FlagKind) -> bool {
        let key = (user_id.to_string(), kind);
        let removed = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);

        match removed {
            Some(handle) => {
                handle.abort();
                info!(user_id, %kind, "Stopped watching remote flag");
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, user_id: &str, kind: FlagKind) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(user_id.to_string(), kind))
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn unwatch_all(&self) {
        let drained: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (_, handle) in drained {
            handle.abort();
        }
    }
}

impl Drop for FlagWatcher {
    fn drop(&mut self) {
        self.unwatch_all();
    }
}

/// Long-lived subscription loop. Errors and closed streams are followed by a
/// re-subscribe after a backoff delay; the last delivered value stays in
/// effect meanwhile.
async fn run_subscription(
    store: Arc<dyn RemoteFlagStore>,
    user_id: String,
    kind: FlagKind,
    backoff: Backoff,
    on_change: FlagCallback,
) {
    let path = kind.path(&user_id);
    let mut last: Option<bool> = None;
    let mut failures: u32 = 0;

    loop {
        match store.subscribe(&path).await {
            Ok(mut updates) => {
                while let Some(update) = updates.next().await {
                    match update {
                        Ok(raw) => {
                            failures = 0;
                            let value = raw.and_then(|v| v.as_bool()).unwrap_or(false);
                            if last == Some(value) {
                                continue;
                            }
                            last = Some(value);
                            debug!(user_id = %user_id, %kind, value, "Remote flag changed");
                            on_change(RemoteFlag {
                                user_id: user_id.clone(),
                                kind,
                                value,
                            });
                        }
                        Err(e) => {
                            warn!(user_id = %user_id, %kind, error = %e, "Flag subscription error");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(user_id = %user_id, %kind, error = %e, "Failed to subscribe to remote flag");
            }
        }

        failures = failures.saturating_add(1);
        let delay = backoff.delay(failures);
        debug!(user_id = %user_id, %kind, delay_ms = delay.as_millis() as u64, "Re-subscribing after backoff");
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::flag_store::{FlagStoreError, MemoryFlagStore, ValueStream};
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// The first subscription fails after one value, the second cannot
    /// connect, the third replays that value and then changes it.
    #[derive(Default)]
    struct FlakyStore {
        subscribes: AtomicUsize,
    }

    #[async_trait]
    impl RemoteFlagStore for FlakyStore {
        async fn get(&self, _path: &str) -> Result<Option<Value>, FlagStoreError> {
            Ok(None)
        }

        async fn set(&self, _path: &str, _value: Value) -> Result<(), FlagStoreError> {
            Ok(())
        }

        async fn subscribe(&self, path: &str) -> Result<ValueStream, FlagStoreError> {
            match self.subscribes.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(stream::iter(vec![
                    Ok(Some(json!(true))),
                    Err(FlagStoreError::Closed(path.to_string())),
                ])
                .boxed()),
                1 => Err(FlagStoreError::Closed(path.to_string())),
                _ => Ok(stream::iter(vec![Ok(Some(json!(true))), Ok(Some(json!(false)))])
                    .chain(stream::pending())
                    .boxed()),
            }
        }
    }

    fn watcher(store: Arc<MemoryFlagStore>) -> FlagWatcher {
        FlagWatcher::new(store, Backoff::new(Duration::from_millis(5), Duration::from_millis(50)))
    }

    #[tokio::test]
    async fn test_second_watch_is_noop() {
        let store = Arc::new(MemoryFlagStore::new());
        let watcher = watcher(store.clone());

        assert!(watcher.watch("1", FlagKind::CaptureRequired, |_| {}));
        assert!(!watcher.watch("1", FlagKind::CaptureRequired, |_| {}));
        assert!(watcher.watch("1", FlagKind::LocationRequired, |_| {}));
        assert_eq!(watcher.active_count(), 2);
    }

    #[tokio::test]
    async fn test_unwatch_unknown_key_is_noop() {
        let store = Arc::new(MemoryFlagStore::new());
        let watcher = watcher(store);
        assert!(!watcher.unwatch("nobody", FlagKind::CaptureRequired));
    }

    #[tokio::test]
    async fn test_repeated_true_is_delivered_once() {
        let store = Arc::new(MemoryFlagStore::new());
        let path = FlagKind::CaptureRequired.path("1");
        store.set(&path, json!(false)).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = watcher(store.clone());
        watcher.watch("1", FlagKind::CaptureRequired, move |flag| {
            let _ = tx.send(flag.value);
        });

        assert_eq!(rx.recv().await, Some(false));
        store.set(&path, json!(true)).await.unwrap();
        assert_eq!(rx.recv().await, Some(true));
        store.set(&path, json!(true)).await.unwrap();
        store.set(&path, json!(false)).await.unwrap();
        assert_eq!(rx.recv().await, Some(false));
    }

    #[tokio::test]
    async fn test_unwatch_releases_subscription() {
        let store = Arc::new(MemoryFlagStore::new());
        let path = FlagKind::LocationRequired.path("1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = watcher(store.clone());
        watcher.watch("1", FlagKind::LocationRequired, move |flag| {
            let _ = tx.send(flag.value);
        });
        assert_eq!(rx.recv().await, Some(false));
        assert_eq!(store.subscriber_count(&path), 1);

        assert!(watcher.unwatch("1", FlagKind::LocationRequired));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.subscriber_count(&path), 0);
        assert!(!watcher.is_watching("1", FlagKind::LocationRequired));
    }

    #[tokio::test]
    async fn test_subscription_error_resubscribes_and_keeps_last_value() {
        let store = Arc::new(FlakyStore::default());
        let watcher = FlagWatcher::new(
            store.clone(),
            Backoff::new(Duration::from_millis(5), Duration::from_millis(50)),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher.watch("1", FlagKind::CaptureRequired, move |flag| {
            let _ = tx.send(flag.value);
        });

        assert_eq!(rx.recv().await, Some(true));
        // The replayed `true` is not a transition; the next delivery is `false`.
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no update after re-subscribing");
        assert_eq!(next, Some(false));
        assert_eq!(store.subscribes.load(Ordering::SeqCst), 3);
        assert!(watcher.is_watching("1", FlagKind::CaptureRequired));
    }
}
