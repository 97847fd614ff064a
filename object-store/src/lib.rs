//! S3-compatible object storage adapter for raw batch and columnar
//! archives. Transfers are raced against a fixed timeout so a hung
//! connection fails the enclosing job instead of wedging a worker.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::StorageClass;
use aws_sdk_s3::Client;
use core_types::config::S3Config;
use log::debug;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transfer timed out after {0:?}")]
    TimedOut(Duration),
    #[error("s3 error: {0}")]
    Sdk(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage seam the ingestion services work against, so they can be
/// exercised without a live bucket.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn upload(&self, path: &Path, key: &str) -> Result<(), StoreError>;
    async fn download(&self, key: &str, dest: &Path) -> Result<(), StoreError>;
    /// List every key under `prefix`, with the prefix stripped.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

pub struct ObjectStore {
    client: Client,
    bucket: String,
    storage_class: StorageClass,
    transfer_timeout: Duration,
}

impl ObjectStore {
    pub fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "ledger-indexer",
        );
        let s3_cfg = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .force_path_style(true)
            .endpoint_url(config.endpoint.clone())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .build();
        Self {
            client: Client::from_conf(s3_cfg),
            bucket: config.bucket.clone(),
            storage_class: StorageClass::from(config.storage_class.as_str()),
            transfer_timeout: Duration::from_secs(config.transfer_timeout_secs),
        }
    }
}

#[async_trait]
impl BlobStore for ObjectStore {
    async fn upload(&self, path: &Path, key: &str) -> Result<(), StoreError> {
        debug!("uploading {} to {key}", path.display());
        let body = ByteStream::from_path(path)
            .await
            .map_err(|err| StoreError::Sdk(err.to_string()))?;
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(self.storage_class.clone())
            .body(body)
            .send();
        timeout(self.transfer_timeout, put)
            .await
            .map_err(|_| StoreError::TimedOut(self.transfer_timeout))?
            .map_err(|err| StoreError::Sdk(err.to_string()))?;
        Ok(())
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<(), StoreError> {
        debug!("downloading {key} to {}", dest.display());
        let transfer = async {
            let res = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|err| StoreError::Sdk(err.to_string()))?;
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(dest).await?;
            let mut body = res.body;
            while let Some(chunk) = body
                .try_next()
                .await
                .map_err(|err| StoreError::Sdk(err.to_string()))?
            {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok::<(), StoreError>(())
        };
        timeout(self.transfer_timeout, transfer)
            .await
            .map_err(|_| StoreError::TimedOut(self.transfer_timeout))?
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut files = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let res = req
                .send()
                .await
                .map_err(|err| StoreError::Sdk(err.to_string()))?;
            for object in res.contents() {
                if let Some(key) = object.key() {
                    files.push(strip_prefix(key, prefix));
                }
            }
            match res.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(files)
    }
}

fn strip_prefix(key: &str, prefix: &str) -> String {
    key.strip_prefix(prefix).unwrap_or(key).to_string()
}
