//! Wires every service to the task queue and keeps the recurring scans
//! ticking until shutdown.

use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use archive_service::BatchArchiver;
use chain_client::{ChainApi, ChainClient, ChainError};
use column_ingest_service::ColumnStoreLoader;
use column_store::ColumnStore;
use core_types::config::{AppConfig, ConfigError};
use core_types::types::TxHash;
use event_bus::EventBus;
use log::info;
use object_store::{BlobStore, ObjectStore};
use pending_store::{PendingStore, PendingStoreError};
use serde_json::json;
use task_queue::{JobError, JobOptions, TaskQueue};
use thiserror::Error;
use transactions_service::sweeper::ExpiredTransactionSweeper;
use transactions_service::TransactionLifecycle;
use transform_service::Transformer;
use version_ingestion_service::VersionIngester;

#[derive(Debug, Error)]
enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("chain client error: {0}")]
    Chain(#[from] ChainError),
    #[error("pending store error: {0}")]
    Pending(#[from] PendingStoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(err) = run().await {
        eprintln!("indexer failed: {err}");
        process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let config = AppConfig::load()?;

    let chain: Arc<dyn ChainApi> = Arc::new(ChainClient::new(
        &config.chain.provider,
        Duration::from_secs(config.chain.request_timeout_secs),
    )?);
    let blobs: Arc<dyn BlobStore> = Arc::new(ObjectStore::new(&config.s3));
    let columns = Arc::new(ColumnStore::new(&config.column_store));
    let pending = Arc::new(PendingStore::open(Path::new(&config.pending_db.path))?);
    let bus = Arc::new(EventBus::new());

    let ingester = Arc::new(VersionIngester::new(chain.clone(), columns.clone()));
    let archiver = Arc::new(BatchArchiver::new(
        chain.clone(),
        blobs.clone(),
        config.ingestion.layout,
    ));
    let transformer = Arc::new(Transformer::new(
        blobs.clone(),
        &config.ingestion.transformer_bin,
    ));
    let loader = Arc::new(ColumnStoreLoader::new(blobs.clone(), columns.clone()));
    let lifecycle = Arc::new(TransactionLifecycle::new(
        chain.clone(),
        pending.clone(),
        bus.clone(),
    ));
    let sweeper = Arc::new(ExpiredTransactionSweeper::new(
        chain.clone(),
        pending.clone(),
        lifecycle,
        config.sweeper.sweep_batch_limit,
    ));

    let queue = TaskQueue::start(config.queue.workers);
    register_handlers(&queue, &config, ingester, archiver, transformer, loader, sweeper);

    let ingestion = &config.ingestion;
    let gap_interval = Duration::from_secs(ingestion.gap_scan_interval_secs);
    let batch_interval = Duration::from_secs(ingestion.batch_scan_interval_secs);
    queue.schedule_recurring("find-gaps", gap_interval);
    queue.schedule_recurring("fetch-latest-version", gap_interval);
    queue.schedule_recurring("find-missing-batches", batch_interval);
    queue.schedule_recurring("find-missing-archives", batch_interval);
    queue.schedule_recurring("find-missing-files", batch_interval);
    queue.schedule_recurring(
        "find-expired",
        Duration::from_secs(config.sweeper.sweep_interval_secs),
    );

    info!("indexer running with {} worker(s)", config.queue.workers);
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    queue.shutdown();
    Ok(())
}

fn register_handlers(
    queue: &TaskQueue,
    config: &AppConfig,
    ingester: Arc<VersionIngester>,
    archiver: Arc<BatchArchiver>,
    transformer: Arc<Transformer>,
    loader: Arc<ColumnStoreLoader>,
    sweeper: Arc<ExpiredTransactionSweeper>,
) {
    let transform_timeout = Duration::from_secs(config.ingestion.transform_timeout_secs);
    let resolve_attempts = config.sweeper.resolve_attempts;
    let resolve_backoff = Duration::from_millis(config.sweeper.resolve_backoff_ms);

    // Single-version ingestion and its two feeders.
    {
        let ingester = ingester.clone();
        queue.on_task("version", move |payload| {
            let ingester = ingester.clone();
            Box::pin(async move {
                let version = field_u64(&payload, "version")?;
                ingester
                    .ingest_version(version)
                    .await
                    .map_err(JobError::failed)
            })
        });
    }
    {
        let ingester = ingester.clone();
        let feed = queue.clone();
        queue.on_task("find-gaps", move |_| {
            let ingester = ingester.clone();
            let feed = feed.clone();
            Box::pin(async move {
                let missing = ingester
                    .find_missing_versions()
                    .await
                    .map_err(JobError::failed)?;
                for version in missing {
                    enqueue_version(&feed, version);
                }
                Ok(())
            })
        });
    }
    {
        let feed = queue.clone();
        queue.on_task("fetch-latest-version", move |_| {
            let ingester = ingester.clone();
            let feed = feed.clone();
            Box::pin(async move {
                let tip = ingester.latest_version().await.map_err(JobError::failed)?;
                enqueue_version(&feed, tip);
                Ok(())
            })
        });
    }

    // Raw batch archiving.
    {
        let archiver = archiver.clone();
        queue.on_task("batch", move |payload| {
            let archiver = archiver.clone();
            Box::pin(async move {
                let index = field_u64(&payload, "index")?;
                archiver
                    .archive_batch(index)
                    .await
                    .map_err(JobError::failed)
            })
        });
    }
    {
        let feed = queue.clone();
        queue.on_task("find-missing-batches", move |_| {
            let archiver = archiver.clone();
            let feed = feed.clone();
            Box::pin(async move {
                let missing = archiver.missing_batches().await.map_err(JobError::failed)?;
                for index in missing {
                    feed.enqueue(
                        "batch",
                        json!({ "index": index }),
                        JobOptions::keyed(format!("batch:{index}")),
                    );
                }
                Ok(())
            })
        });
    }

    // Batch-to-parquet conversion.
    {
        let transformer = transformer.clone();
        queue.on_task("transform", move |payload| {
            let transformer = transformer.clone();
            Box::pin(async move {
                let range = field_str(&payload, "range")?;
                transformer
                    .transform_range(&range)
                    .await
                    .map_err(JobError::failed)
            })
        });
    }
    {
        let feed = queue.clone();
        queue.on_task("find-missing-archives", move |_| {
            let transformer = transformer.clone();
            let feed = feed.clone();
            Box::pin(async move {
                let missing = transformer
                    .missing_archives()
                    .await
                    .map_err(JobError::failed)?;
                for range in missing {
                    feed.enqueue(
                        "transform",
                        json!({ "range": range }),
                        JobOptions::keyed(format!("transform:{range}"))
                            .with_timeout(transform_timeout),
                    );
                }
                Ok(())
            })
        });
    }

    // Parquet loading into the analytical store.
    {
        let loader = loader.clone();
        queue.on_task("ingest", move |payload| {
            let loader = loader.clone();
            Box::pin(async move {
                let file = field_str(&payload, "file")?;
                loader.ingest_archive(&file).await.map_err(JobError::failed)
            })
        });
    }
    {
        let feed = queue.clone();
        queue.on_task("find-missing-files", move |_| {
            let loader = loader.clone();
            let feed = feed.clone();
            Box::pin(async move {
                let missing = loader.missing_files().await.map_err(JobError::failed)?;
                for file in missing {
                    feed.enqueue(
                        "ingest",
                        json!({ "file": file }),
                        JobOptions::keyed(format!("ingest:{file}")),
                    );
                }
                Ok(())
            })
        });
    }

    // Pending transaction expiry.
    {
        let sweeper = sweeper.clone();
        queue.on_task("resolve", move |payload| {
            let sweeper = sweeper.clone();
            Box::pin(async move {
                let hash = field_str(&payload, "hash")?;
                let hash = TxHash::from_hex(&hash).map_err(JobError::failed)?;
                sweeper.resolve(&hash).await.map_err(JobError::failed)
            })
        });
    }
    {
        let feed = queue.clone();
        queue.on_task("find-expired", move |_| {
            let sweeper = sweeper.clone();
            let feed = feed.clone();
            Box::pin(async move {
                let expired = sweeper.find_expired().await.map_err(JobError::failed)?;
                for hash in expired {
                    let hex = hash.to_hex();
                    feed.enqueue(
                        "resolve",
                        json!({ "hash": hex }),
                        JobOptions::keyed(format!("resolve:{hex}"))
                            .with_retries(resolve_attempts, resolve_backoff),
                    );
                }
                Ok(())
            })
        });
    }
}

fn enqueue_version(queue: &TaskQueue, version: u64) {
    queue.enqueue(
        "version",
        json!({ "version": version }),
        JobOptions::keyed(format!("version:{version}")),
    );
}

fn field_u64(payload: &serde_json::Value, key: &str) -> Result<u64, JobError> {
    payload
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| JobError::Failed(format!("payload is missing {key}")))
}

fn field_str(payload: &serde_json::Value, key: &str) -> Result<String, JobError> {
    payload
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| JobError::Failed(format!("payload is missing {key}")))
}
