use config::Config;
pub use config::ConfigError;
use serde::{Deserialize, Serialize};

use crate::batch::BatchLayout;

/// Top-level configuration, loaded from `config.toml` plus environment
/// variables prefixed with `APP`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub chain: ChainConfig,
    pub s3: S3Config,
    pub column_store: ColumnStoreConfig,
    pub pending_db: PendingDbConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChainConfig {
    /// Base URL of the ledger node REST API, e.g. `https://node.example.com`.
    pub provider: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_storage_class")]
    pub storage_class: String,
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
}

fn default_storage_class() -> String {
    "STANDARD".to_string()
}

fn default_transfer_timeout_secs() -> u64 {
    10 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ColumnStoreConfig {
    /// HTTP interface of the analytical store, e.g. `http://127.0.0.1:8123`.
    pub url: String,
    pub database: String,
    #[serde(default = "default_ch_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_ch_user() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDbConfig {
    #[serde(default = "default_pending_db_path")]
    pub path: String,
}

impl Default for PendingDbConfig {
    fn default() -> Self {
        Self {
            path: default_pending_db_path(),
        }
    }
}

fn default_pending_db_path() -> String {
    "pending-transactions.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default)]
    pub layout: BatchLayout,
    /// Path of the external batch converter binary.
    #[serde(default = "default_transformer_bin")]
    pub transformer_bin: String,
    #[serde(default = "default_gap_scan_interval_secs")]
    pub gap_scan_interval_secs: u64,
    #[serde(default = "default_batch_scan_interval_secs")]
    pub batch_scan_interval_secs: u64,
    #[serde(default = "default_transform_timeout_secs")]
    pub transform_timeout_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            layout: BatchLayout::default(),
            transformer_bin: default_transformer_bin(),
            gap_scan_interval_secs: default_gap_scan_interval_secs(),
            batch_scan_interval_secs: default_batch_scan_interval_secs(),
            transform_timeout_secs: default_transform_timeout_secs(),
        }
    }
}

fn default_transformer_bin() -> String {
    "/usr/local/bin/transformer".to_string()
}

fn default_gap_scan_interval_secs() -> u64 {
    30
}

fn default_batch_scan_interval_secs() -> u64 {
    30 * 60
}

fn default_transform_timeout_secs() -> u64 {
    20 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: usize,
    #[serde(default = "default_resolve_backoff_ms")]
    pub resolve_backoff_ms: u64,
    #[serde(default = "default_sweep_batch_limit")]
    pub sweep_batch_limit: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            resolve_attempts: default_resolve_attempts(),
            resolve_backoff_ms: default_resolve_backoff_ms(),
            sweep_batch_limit: default_sweep_batch_limit(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_resolve_attempts() -> usize {
    10
}

fn default_resolve_backoff_ms() -> u64 {
    1_000
}

fn default_sweep_batch_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    8
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(config::File::with_name("config.toml").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        if config.chain.provider.is_empty() {
            return Err(ConfigError::Message(
                "chain.provider is required".to_string(),
            ));
        }
        if config.s3.bucket.is_empty() {
            return Err(ConfigError::Message("s3.bucket is required".to_string()));
        }
        if config.column_store.url.is_empty() {
            return Err(ConfigError::Message(
                "column_store.url is required".to_string(),
            ));
        }
        Ok(config)
    }
}
