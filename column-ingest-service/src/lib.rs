//! Loads columnar archives into the analytical store exactly once.
//!
//! The only idempotency mechanism is the `ingested_files` marker row,
//! appended after every contained file has loaded. A crash before the
//! marker re-runs the whole archive.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use column_store::{ColumnStore, ColumnStoreError};
use log::info;
use object_store::{BlobStore, StoreError};
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("tar exited with {0}")]
    Tar(std::process::ExitStatus),
    #[error("archive {0} holds no parquet file")]
    NoParquet(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("column store error: {0}")]
    Column(#[from] ColumnStoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Analytical-store surface the loader needs.
#[async_trait]
pub trait ArchiveSink: Send + Sync + 'static {
    async fn insert_parquet_file(&self, table: &str, path: &Path)
        -> Result<(), ColumnStoreError>;
    async fn record_ingested_file(&self, name: &str) -> Result<(), ColumnStoreError>;
    async fn ingested_files(&self) -> Result<BTreeSet<String>, ColumnStoreError>;
}

#[async_trait]
impl ArchiveSink for ColumnStore {
    async fn insert_parquet_file(
        &self,
        table: &str,
        path: &Path,
    ) -> Result<(), ColumnStoreError> {
        ColumnStore::insert_parquet_file(self, table, path).await
    }

    async fn record_ingested_file(&self, name: &str) -> Result<(), ColumnStoreError> {
        ColumnStore::record_ingested_file(self, name).await
    }

    async fn ingested_files(&self) -> Result<BTreeSet<String>, ColumnStoreError> {
        ColumnStore::ingested_files(self).await
    }
}

pub struct ColumnStoreLoader {
    store: Arc<dyn BlobStore>,
    sink: Arc<dyn ArchiveSink>,
}

impl ColumnStoreLoader {
    pub fn new(store: Arc<dyn BlobStore>, sink: Arc<dyn ArchiveSink>) -> Self {
        Self { store, sink }
    }

    /// Load one archive; `name` is its key relative to `parquets/`. Each
    /// contained parquet lands in the table named by its file stem, then
    /// the marker row is appended.
    pub async fn ingest_archive(&self, name: &str) -> Result<(), LoadError> {
        let staging = tempfile::tempdir()?;
        let file_name = name.rsplit('/').next().unwrap_or(name);
        let archive_path = staging.path().join(file_name);
        self.store
            .download(&format!("parquets/{name}"), &archive_path)
            .await?;

        let status = Command::new("tar")
            .arg("xf")
            .arg(file_name)
            .current_dir(staging.path())
            .status()
            .await?;
        if !status.success() {
            return Err(LoadError::Tar(status));
        }

        let mut loaded = 0usize;
        let mut entries = tokio::fs::read_dir(staging.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "parquet") {
                let Some(table) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                self.sink.insert_parquet_file(table, &path).await?;
                loaded += 1;
            }
        }
        if loaded == 0 {
            return Err(LoadError::NoParquet(name.to_string()));
        }

        self.sink.record_ingested_file(name).await?;
        info!("loaded {loaded} file(s) from {name}");
        Ok(())
    }

    /// Archives present under `parquets/` with no marker row yet.
    pub async fn missing_files(&self) -> Result<Vec<String>, LoadError> {
        let ingested = self.sink.ingested_files().await?;
        let available = self.store.list("parquets/").await?;
        Ok(available
            .into_iter()
            .filter(|name| !ingested.contains(name))
            .collect())
    }
}
