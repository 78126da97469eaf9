pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod service;
pub mod worker;

pub use config::AppConfig;
pub use db::{create_pool, ensure_schema, PgStore};
pub use service::{ExportProcessor, LedgerProcessor};
pub use worker::{ExportPool, IngestPool};
