//! Raw batch archival: pages of committed transactions are staged as JSON,
//! compressed and shipped to the object store under `transactions/`.

use std::num::ParseIntError;
use std::path::Path;
use std::sync::Arc;

use chain_client::ChainApi;
use chain_client::ChainError;
use core_types::batch::BatchLayout;
use core_types::types::Version;
use log::info;
use object_store::{BlobStore, StoreError};
use thiserror::Error;
use tokio::process::Command;

pub const TRANSACTIONS_PREFIX: &str = "transactions/";

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The ledger has not advanced far enough to fill this page yet.
    #[error("short page at version {start}: got {got} of {want}")]
    ShortPage { start: Version, got: usize, want: u64 },
    #[error("page at version {start} held no committed transactions")]
    EmptyPage { start: Version },
    #[error("batch {index} spans {actual_start}-{actual_end}, expected {expected_start}-{expected_end}")]
    Boundary {
        index: u64,
        expected_start: Version,
        expected_end: Version,
        actual_start: Version,
        actual_end: Version,
    },
    #[error("tar exited with {0}")]
    Tar(std::process::ExitStatus),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad page encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid ledger info: {0}")]
    LedgerInfo(#[from] ParseIntError),
}

pub struct BatchArchiver {
    chain: Arc<dyn ChainApi>,
    store: Arc<dyn BlobStore>,
    layout: BatchLayout,
}

impl BatchArchiver {
    pub fn new(chain: Arc<dyn ChainApi>, store: Arc<dyn BlobStore>, layout: BatchLayout) -> Self {
        Self {
            chain,
            store,
            layout,
        }
    }

    /// Fetch, stage and upload one full batch. Fails (for a later retry)
    /// when any page comes back short.
    pub async fn archive_batch(&self, index: u64) -> Result<(), ArchiveError> {
        let from = self.layout.index_start(index);
        let index_dir = self.layout.index_dir(index);
        let staging = tempfile::tempdir()?;
        let page_dir = staging.path().join(&index_dir);
        tokio::fs::create_dir_all(&page_dir).await?;

        let mut batch_start = None;
        let mut batch_end = 0;
        for page in 0..self.layout.batch_size {
            let start = from + page * self.layout.page_size;
            let (min, max) = self.stage_page(start, &page_dir).await?;
            if page == 0 {
                batch_start = Some(min);
            }
            batch_end = batch_end.max(max);
        }

        let expected_start = from;
        let expected_end = from + self.layout.page_size * self.layout.batch_size - 1;
        let actual_start = batch_start.unwrap_or(expected_start);
        if actual_start != expected_start || batch_end != expected_end {
            return Err(ArchiveError::Boundary {
                index,
                expected_start,
                expected_end,
                actual_start,
                actual_end: batch_end,
            });
        }

        let archive_path = staging.path().join(format!("{index_dir}.tgz"));
        compress(&page_dir, &archive_path).await?;

        let key = format!("{TRANSACTIONS_PREFIX}{index_dir}.tgz");
        self.store.upload(&archive_path, &key).await?;
        info!("archived batch {index} as {key}");
        Ok(())
    }

    /// Stage one page as `{min}-{max}.json` and return its committed
    /// version bounds.
    async fn stage_page(
        &self,
        start: Version,
        page_dir: &Path,
    ) -> Result<(Version, Version), ArchiveError> {
        let want = self.layout.page_size;
        let transactions = self.chain.get_transactions(start, want as u16).await?;
        if transactions.len() as u64 != want {
            return Err(ArchiveError::ShortPage {
                start,
                got: transactions.len(),
                want,
            });
        }

        let mut bounds: Option<(Version, Version)> = None;
        for version in transactions.iter().filter_map(|tx| tx.version()) {
            bounds = Some(match bounds {
                None => (version, version),
                Some((min, max)) => (min.min(version), max.max(version)),
            });
        }
        let (min, max) = bounds.ok_or(ArchiveError::EmptyPage { start })?;

        let page_path = page_dir.join(format!("{min}-{max}.json"));
        tokio::fs::write(&page_path, serde_json::to_vec(&transactions)?).await?;
        Ok((min, max))
    }

    /// Batch indexes the ledger tip implies should exist but that have no
    /// archive under `transactions/` yet.
    pub async fn missing_batches(&self) -> Result<Vec<u64>, ArchiveError> {
        let files = self.store.list(TRANSACTIONS_PREFIX).await?;
        let tip = self.chain.get_ledger_info().await?.version()?;
        let expected = self.layout.expected_batches(tip);

        let missing = (0..expected)
            .filter(|index| {
                let name = format!("{}.tgz", self.layout.index_dir(*index));
                !files.iter().any(|file| *file == name)
            })
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            info!("{} batch archive(s) missing", missing.len());
        }
        Ok(missing)
    }
}

async fn compress(src: &Path, dst: &Path) -> Result<(), ArchiveError> {
    let status = Command::new("tar")
        .arg("czf")
        .arg(dst)
        .arg(".")
        .current_dir(src)
        .status()
        .await?;
    if !status.success() {
        return Err(ArchiveError::Tar(status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use async_trait::async_trait;
    use chain_client::types::LedgerInfo;
    use chain_client::TransactionData;
    use core_types::types::TxHash;
    use parking_lot::Mutex;

    fn user_tx(version: u64) -> TransactionData {
        serde_json::from_value(serde_json::json!({
            "type": "user_transaction",
            "version": version.to_string(),
            "hash": format!("0x{version:064x}"),
            "gas_used": "1",
            "success": true,
            "vm_status": "Executed successfully",
            "sender": "0x1",
            "sequence_number": "0",
            "max_gas_amount": "2000",
            "gas_unit_price": "100",
            "expiration_timestamp_secs": "1700000000",
            "payload": {
                "type": "entry_function_payload",
                "function": "0x1::coin::transfer",
                "type_arguments": [],
                "arguments": []
            },
            "timestamp": "1699999000000000",
            "events": []
        }))
        .unwrap()
    }

    struct FakeChain {
        tip: u64,
        short_from: Option<u64>,
    }

    #[async_trait]
    impl ChainApi for FakeChain {
        async fn get_ledger_info(&self) -> Result<LedgerInfo, ChainError> {
            Ok(LedgerInfo {
                chain_id: 1,
                ledger_version: self.tip.to_string(),
                ledger_timestamp: "0".to_string(),
            })
        }

        async fn get_transactions(
            &self,
            start: Version,
            limit: u16,
        ) -> Result<Vec<TransactionData>, ChainError> {
            let mut page = Vec::new();
            for version in start..start + limit as u64 {
                if version > self.tip || self.short_from.is_some_and(|cap| version >= cap) {
                    break;
                }
                page.push(user_tx(version));
            }
            Ok(page)
        }

        async fn get_transaction_by_hash(
            &self,
            _hash: &TxHash,
        ) -> Result<TransactionData, ChainError> {
            unimplemented!()
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl BlobStore for MemoryStore {
        async fn upload(&self, path: &Path, key: &str) -> Result<(), StoreError> {
            let bytes = tokio::fs::read(path).await?;
            self.objects.lock().insert(key.to_string(), bytes);
            Ok(())
        }

        async fn download(&self, key: &str, dest: &Path) -> Result<(), StoreError> {
            let bytes = self
                .objects
                .lock()
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::Sdk(format!("no such key {key}")))?;
            tokio::fs::write(dest, bytes).await?;
            Ok(())
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            Ok(self
                .objects
                .lock()
                .keys()
                .filter_map(|key| key.strip_prefix(prefix).map(str::to_string))
                .collect())
        }
    }

    fn archiver(chain: FakeChain, store: Arc<MemoryStore>) -> BatchArchiver {
        BatchArchiver::new(Arc::new(chain), store, BatchLayout::new(2, 2))
    }

    #[tokio::test]
    async fn archives_one_batch_with_page_files() {
        let store = Arc::new(MemoryStore::default());
        let archiver = archiver(
            FakeChain {
                tip: 100,
                short_from: None,
            },
            store.clone(),
        );

        archiver.archive_batch(0).await.unwrap();

        let objects = store.objects.lock();
        let archive = objects.get("transactions/0-2.tgz").unwrap();
        assert!(!archive.is_empty());
    }

    #[tokio::test]
    async fn uploaded_archive_holds_min_max_page_names() {
        let store = Arc::new(MemoryStore::default());
        let archiver = archiver(
            FakeChain {
                tip: 100,
                short_from: None,
            },
            store.clone(),
        );
        archiver.archive_batch(1).await.unwrap();

        let bytes = store
            .objects
            .lock()
            .get("transactions/4-6.tgz")
            .cloned()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("batch.tgz");
        std::fs::write(&archive, bytes).unwrap();
        let status = Command::new("tar")
            .arg("xzf")
            .arg(&archive)
            .current_dir(dir.path())
            .status()
            .await
            .unwrap();
        assert!(status.success());
        assert!(dir.path().join("4-5.json").exists());
        assert!(dir.path().join("6-7.json").exists());
    }

    #[tokio::test]
    async fn short_page_fails_the_batch() {
        let store = Arc::new(MemoryStore::default());
        let archiver = archiver(
            FakeChain {
                tip: 100,
                short_from: Some(3),
            },
            store.clone(),
        );

        let err = archiver.archive_batch(0).await.unwrap_err();
        assert!(matches!(err, ArchiveError::ShortPage { start: 2, got: 1, .. }));
        assert!(store.objects.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_batches_skips_existing_archives() {
        let store = Arc::new(MemoryStore::default());
        store
            .objects
            .lock()
            .insert("transactions/0-2.tgz".to_string(), vec![1]);
        // tip 8 with pages of 2 and batches of 2 implies two batches.
        let archiver = archiver(
            FakeChain {
                tip: 8,
                short_from: None,
            },
            store.clone(),
        );

        assert_eq!(archiver.missing_batches().await.unwrap(), vec![1]);
    }
}
