pub mod auth_monitor;
pub mod backend;
pub mod backoff;
pub mod camera;
pub mod capture;
pub mod connectivity;
pub mod dispatcher;
pub mod flag_store;
pub mod flag_watcher;
pub mod location;
pub mod login;
pub mod queue;
pub mod session;
