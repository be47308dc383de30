use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Shared network reachability flag the upload queue waits on.
#[derive(Clone)]
pub struct Connectivity {
    state: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            state: Arc::new(watch::channel(online).0),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.state.send_replace(online);
        if previous != online {
            if online {
                info!("Network connectivity restored");
            } else {
                warn!("Network connectivity lost");
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Periodically probe `url` and publish reachability. Any HTTP response
    /// counts as online; only transport errors count as offline.
    pub fn spawn_probe(&self, http: reqwest::Client, url: String, interval: Duration) -> JoinHandle<()> {
        let connectivity = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = match http.head(&url).timeout(interval).send().await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::debug!(error = %e, "Connectivity probe failed");
                        false
                    }
                };
                connectivity.set_online(online);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_restore() {
        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();
        assert!(!*rx.borrow_and_update());

        connectivity.set_online(true);
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*rx.borrow());
        assert!(connectivity.is_online());
    }
}
