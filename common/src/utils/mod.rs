pub mod config;
pub mod dispatch;
pub mod ingest_limits;
