use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

use crate::services::dispatcher::{Command, CommandDispatcher, CommandSource, DispatchOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Normal,
    Elevated,
}

#[derive(Debug)]
struct AuthCounter {
    consecutive_failures: u32,
    state: AuthState,
}

impl Default for AuthCounter {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            state: AuthState::Normal,
        }
    }
}

/// What an authentication event led to.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthOutcome {
    pub consecutive_failures: u32,
    /// Set when a command was emitted and settled within the deadline.
    pub dispatched: Option<DispatchOutcome>,
}

/// Counts consecutive authentication failures per user and triggers capture
/// once the threshold is crossed.
pub struct FailedAuthMonitor {
    dispatcher: Arc<CommandDispatcher>,
    threshold: u32,
    deadline: Duration,
    counters: Mutex<HashMap<String, AuthCounter>>,
}

impl FailedAuthMonitor {
    pub fn new(dispatcher: Arc<CommandDispatcher>, threshold: u32, deadline: Duration) -> Self {
        Self {
            dispatcher,
            threshold: threshold.max(1),
            deadline,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn consecutive_failures(&self, user_id: &str) -> u32 {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .map_or(0, |c| c.consecutive_failures)
    }

    /// Record a failed attempt. The capture trigger fires once per run of
    /// failures, on the attempt that reaches the threshold.
    pub async fn on_failure(&self, user_id: &str) -> AuthOutcome {
        let (consecutive_failures, trigger) = {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            let counter = counters.entry(user_id.to_string()).or_default();
            counter.consecutive_failures = counter.consecutive_failures.saturating_add(1);
            let trigger = counter.state == AuthState::Normal
                && counter.consecutive_failures >= self.threshold;
            if trigger {
                counter.state = AuthState::Elevated;
            }
            (counter.consecutive_failures, trigger)
        };

        tracing::info!(user_id, consecutive_failures, "Authentication failure recorded");
        if !trigger {
            return AuthOutcome {
                consecutive_failures,
                dispatched: None,
            };
        }

        tracing::warn!(user_id, consecutive_failures, "Failure threshold reached, requesting capture");
        let dispatched = self
            .emit(Command::CaptureRequested {
                user_id: user_id.to_string(),
                source: CommandSource::LocalAuth,
            })
            .await;
        AuthOutcome {
            consecutive_failures,
            dispatched,
        }
    }

    /// Record a successful attempt: reset the counter and cancel any pending capture.
    pub async fn on_success(&self, user_id: &str) -> AuthOutcome {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(user_id);

        tracing::info!(user_id, "Authentication succeeded, counter reset");
        let dispatched = self
            .emit(Command::Cancel {
                user_id: user_id.to_string(),
            })
            .await;
        AuthOutcome {
            consecutive_failures: 0,
            dispatched,
        }
    }

    /// Submit `command` and wait for it up to the deadline. Past the deadline
    /// the dispatch keeps running in the background.
    async fn emit(&self, command: Command) -> Option<DispatchOutcome> {
        let user_id = command.user_id().to_string();
        match timeout(self.deadline, self.dispatcher.submit(command)).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                tracing::error!(user_id = %user_id, error = %e, "Dispatch task failed");
                None
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "Dispatch did not settle before deadline");
                None
            }
        }
    }
}
