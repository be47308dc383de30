use std::sync::Arc;

use crate::services::{
    auth_monitor::FailedAuthMonitor,
    connectivity::Connectivity,
    dispatcher::CommandDispatcher,
    flag_store::RemoteFlagStore,
    queue::UploadQueue,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: UploadQueue,
    pub dispatcher: Arc<CommandDispatcher>,
    pub monitor: Arc<FailedAuthMonitor>,
    pub flag_store: Arc<dyn RemoteFlagStore>,
    pub connectivity: Connectivity,
    /// User the agent acts for when a request names none.
    pub session_user: Option<String>,
}

impl AppState {
    pub fn new(
        queue: UploadQueue,
        dispatcher: Arc<CommandDispatcher>,
        monitor: FailedAuthMonitor,
        flag_store: Arc<dyn RemoteFlagStore>,
        connectivity: Connectivity,
        session_user: Option<String>,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            monitor: Arc::new(monitor),
            flag_store,
            connectivity,
            session_user,
        }
    }

    /// Resolve the user a request refers to.
    pub fn user_or_session(&self, user_id: Option<String>) -> Option<String> {
        user_id.or_else(|| self.session_user.clone())
    }
}
