//! Device security agent
//!
//! Captures front/back stills and a location fix when authentication keeps
//! failing on the device or when an operator sets a remote command flag, and
//! delivers the evidence to the backend through a durable SQLite-backed
//! upload queue.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
