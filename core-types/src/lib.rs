//! Shared domain types, batch geometry, retry policy, and configuration
//! for the ledger indexing services.

pub mod batch;
pub mod config;
pub mod retry;
pub mod types;

pub use config::AppConfig;
