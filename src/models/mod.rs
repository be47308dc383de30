pub mod api;
pub mod capture;
pub mod flag;
pub mod session;
pub mod task;
