//! Turns raw batch archives into columnar archives via an external
//! converter binary.

pub mod validate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use object_store::{BlobStore, StoreError};
use thiserror::Error;
use tokio::process::Command;

use validate::{validate_page_file, PageOutcome};

pub const PARQUETS_PREFIX: &str = "parquets/";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("tar exited with {0}")]
    Tar(std::process::ExitStatus),
    #[error("converter exited with {0}")]
    Converter(std::process::ExitStatus),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Transformer {
    store: Arc<dyn BlobStore>,
    converter_bin: PathBuf,
}

impl Transformer {
    pub fn new(store: Arc<dyn BlobStore>, converter_bin: impl Into<PathBuf>) -> Self {
        Self {
            store,
            converter_bin: converter_bin.into(),
        }
    }

    /// Download one raw batch archive, validate its pages and upload one
    /// columnar archive per converter output file.
    pub async fn transform_range(&self, range: &str) -> Result<(), TransformError> {
        let staging = tempfile::tempdir()?;
        let archive_path = staging.path().join(format!("{range}.tgz"));
        self.store
            .download(&format!("transactions/{range}.tgz"), &archive_path)
            .await?;

        let pages_dir = staging.path().join("pages");
        tokio::fs::create_dir_all(&pages_dir).await?;
        untar(&archive_path, &pages_dir).await?;

        let pages = self.usable_pages(&pages_dir).await?;
        if pages.is_empty() {
            info!("batch {range} held no usable pages, nothing to convert");
            return Ok(());
        }

        let out_dir = staging.path().join("out");
        tokio::fs::create_dir_all(&out_dir).await?;
        self.convert(&pages, &out_dir).await?;

        self.upload_parquets(range, &out_dir).await?;
        Ok(())
    }

    async fn usable_pages(&self, pages_dir: &Path) -> Result<Vec<PathBuf>, TransformError> {
        let mut pages = Vec::new();
        let mut entries = tokio::fs::read_dir(pages_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match validate_page_file(&path).await? {
                PageOutcome::Valid => pages.push(path),
                PageOutcome::Repaired => {
                    warn!("repaired type tags in {}", path.display());
                    pages.push(path);
                }
                PageOutcome::Dropped(reason) => {
                    warn!("dropping {}: {reason:?}", path.display());
                }
            }
        }
        pages.sort();
        Ok(pages)
    }

    async fn convert(&self, pages: &[PathBuf], out_dir: &Path) -> Result<(), TransformError> {
        let status = Command::new(&self.converter_bin)
            .args(pages)
            .arg(out_dir)
            .status()
            .await?;
        if !status.success() {
            return Err(TransformError::Converter(status));
        }
        Ok(())
    }

    async fn upload_parquets(&self, range: &str, out_dir: &Path) -> Result<(), TransformError> {
        let mut entries = tokio::fs::read_dir(out_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".parquet") {
                continue;
            }

            let tarball = format!("{name}.tar.gz");
            let status = Command::new("tar")
                .arg("czf")
                .arg(&tarball)
                .arg(name)
                .current_dir(out_dir)
                .status()
                .await?;
            if !status.success() {
                return Err(TransformError::Tar(status));
            }

            let key = format!("{PARQUETS_PREFIX}{range}/{tarball}");
            self.store.upload(&out_dir.join(&tarball), &key).await?;
            info!("uploaded {key}");
        }
        Ok(())
    }

    /// Range labels archived under `transactions/` that have no columnar
    /// counterpart under `parquets/` yet.
    pub async fn missing_archives(&self) -> Result<Vec<String>, TransformError> {
        let raw = self.store.list("transactions/").await?;
        let columnar = self.store.list(PARQUETS_PREFIX).await?;

        let done: Vec<&str> = columnar
            .iter()
            .filter_map(|key| key.split('/').next())
            .collect();

        let mut missing = Vec::new();
        for name in &raw {
            let Some(range) = name.split('/').next().and_then(|it| it.split('.').next()) else {
                continue;
            };
            if !done.contains(&range) && !missing.iter().any(|it| it == range) {
                missing.push(range.to_string());
            }
        }
        Ok(missing)
    }
}

async fn untar(archive: &Path, dest: &Path) -> Result<(), TransformError> {
    let status = Command::new("tar")
        .arg("xf")
        .arg(archive)
        .current_dir(dest)
        .status()
        .await?;
    if !status.success() {
        return Err(TransformError::Tar(status));
    }
    Ok(())
}
