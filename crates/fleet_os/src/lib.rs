#![forbid(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod http_ingest;
pub mod live_state;
pub mod sync_manager;
