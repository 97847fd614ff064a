//! Resolves pending transactions that outlived their expiration window.
//!
//! The ledger clock, not the host clock, decides what is overdue. A row
//! expires only through the UNKNOWN -> EXPIRED compare-and-swap, so a
//! concurrent confirmation always wins.

use std::sync::Arc;

use chain_client::{ChainApi, ChainError};
use core_types::types::{PendingTransactionStatus, TxHash};
use log::debug;
use pending_store::PendingStore;

use crate::{verify_returned_hash, TransactionError, TransactionLifecycle};

pub struct ExpiredTransactionSweeper {
    chain: Arc<dyn ChainApi>,
    store: Arc<PendingStore>,
    lifecycle: Arc<TransactionLifecycle>,
    batch_limit: usize,
}

impl ExpiredTransactionSweeper {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        store: Arc<PendingStore>,
        lifecycle: Arc<TransactionLifecycle>,
        batch_limit: usize,
    ) -> Self {
        Self {
            chain,
            store,
            lifecycle,
            batch_limit,
        }
    }

    /// Hashes overdue by the ledger clock, oldest-expiring first.
    pub async fn find_expired(&self) -> Result<Vec<TxHash>, TransactionError> {
        let info = self.chain.get_ledger_info().await?;
        // Microseconds to whole seconds, rounded past the current one.
        let cutoff = info.timestamp_usecs()? / 1_000_000 + 1;
        let hashes = self.store.expired_before(cutoff, self.batch_limit)?;
        if !hashes.is_empty() {
            debug!("{} transaction(s) overdue at ledger time {cutoff}", hashes.len());
        }
        Ok(hashes)
    }

    /// Settle one overdue hash against the chain: confirmed rows move to
    /// ON_CHAIN, unknown-to-the-node rows expire via CAS. Any other chain
    /// error propagates so the queue retries.
    pub async fn resolve(&self, hash: &TxHash) -> Result<(), TransactionError> {
        match self.chain.get_transaction_by_hash(hash).await {
            Ok(transaction) => {
                verify_returned_hash(hash, transaction.hash())?;
                self.lifecycle
                    .update_status(hash, None, PendingTransactionStatus::OnChain)?;
                Ok(())
            }
            Err(ChainError::NotFound(_)) => {
                self.lifecycle.update_status(
                    hash,
                    Some(PendingTransactionStatus::Unknown),
                    PendingTransactionStatus::Expired,
                )?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chain_client::types::LedgerInfo;
    use chain_client::TransactionData;
    use core_types::types::AccountAddress;
    use event_bus::EventBus;
    use pending_store::PendingTransactionRecord;

    struct FakeChain {
        ledger_timestamp_usecs: u64,
        by_hash: Option<TransactionData>,
    }

    #[async_trait]
    impl ChainApi for FakeChain {
        async fn get_ledger_info(&self) -> Result<LedgerInfo, ChainError> {
            Ok(LedgerInfo {
                chain_id: 1,
                ledger_version: "0".to_string(),
                ledger_timestamp: self.ledger_timestamp_usecs.to_string(),
            })
        }

        async fn get_transactions(
            &self,
            _start: u64,
            _limit: u16,
        ) -> Result<Vec<TransactionData>, ChainError> {
            unimplemented!()
        }

        async fn get_transaction_by_hash(
            &self,
            hash: &TxHash,
        ) -> Result<TransactionData, ChainError> {
            self.by_hash
                .clone()
                .ok_or_else(|| ChainError::NotFound(hash.to_string()))
        }
    }

    fn committed(hash: &TxHash) -> TransactionData {
        serde_json::from_value(serde_json::json!({
            "type": "genesis_transaction",
            "version": "0",
            "hash": format!("0x{}", hash.to_hex()),
            "events": []
        }))
        .unwrap()
    }

    fn record(hash_byte: u8, expiration: u64) -> PendingTransactionRecord {
        PendingTransactionRecord {
            hash: TxHash([hash_byte; 32]),
            sender: AccountAddress([1; 32]),
            sequence_number: 0,
            max_gas_amount: 2_000,
            gas_unit_price: 100,
            expiration_timestamp_secs: expiration,
            chain_id: 1,
            public_key: vec![2; 32],
            signature: vec![3; 64],
            module_address: AccountAddress([0; 32]),
            module_name: "coin".to_string(),
            function_name: "transfer".to_string(),
            args: vec![0],
            status: PendingTransactionStatus::Unknown,
        }
    }

    fn sweeper(chain: FakeChain, store: Arc<PendingStore>) -> ExpiredTransactionSweeper {
        let chain = Arc::new(chain);
        let lifecycle = Arc::new(TransactionLifecycle::new(
            chain.clone(),
            store.clone(),
            Arc::new(EventBus::new()),
        ));
        ExpiredTransactionSweeper::new(chain, store, lifecycle, 50)
    }

    #[tokio::test]
    async fn find_expired_uses_the_ledger_clock() {
        let store = Arc::new(PendingStore::open_in_memory().unwrap());
        store.insert(&record(1, 9)).unwrap();
        store.insert(&record(2, 10)).unwrap();

        // 9 s of ledger time rounds up to a cutoff of 10.
        let sweeper = sweeper(
            FakeChain {
                ledger_timestamp_usecs: 9_000_000,
                by_hash: None,
            },
            store,
        );

        assert_eq!(sweeper.find_expired().await.unwrap(), vec![TxHash([1; 32])]);
    }

    #[tokio::test]
    async fn resolve_confirms_a_committed_transaction() {
        let store = Arc::new(PendingStore::open_in_memory().unwrap());
        let row = record(4, 5);
        store.insert(&row).unwrap();

        let sweeper = sweeper(
            FakeChain {
                ledger_timestamp_usecs: 0,
                by_hash: Some(committed(&row.hash)),
            },
            store.clone(),
        );
        sweeper.resolve(&row.hash).await.unwrap();

        assert_eq!(
            store.get(&row.hash).unwrap().unwrap().status,
            PendingTransactionStatus::OnChain
        );
    }

    #[tokio::test]
    async fn resolve_expires_an_unknown_transaction() {
        let store = Arc::new(PendingStore::open_in_memory().unwrap());
        let row = record(5, 5);
        store.insert(&row).unwrap();

        let sweeper = sweeper(
            FakeChain {
                ledger_timestamp_usecs: 0,
                by_hash: None,
            },
            store.clone(),
        );
        sweeper.resolve(&row.hash).await.unwrap();

        assert_eq!(
            store.get(&row.hash).unwrap().unwrap().status,
            PendingTransactionStatus::Expired
        );
    }

    #[tokio::test]
    async fn resolve_rejects_a_foreign_hash_and_leaves_the_row() {
        let store = Arc::new(PendingStore::open_in_memory().unwrap());
        let row = record(6, 5);
        store.insert(&row).unwrap();

        let sweeper = sweeper(
            FakeChain {
                ledger_timestamp_usecs: 0,
                by_hash: Some(committed(&TxHash([9; 32]))),
            },
            store.clone(),
        );

        let err = sweeper.resolve(&row.hash).await.unwrap_err();
        assert!(matches!(err, TransactionError::HashMismatch { .. }));
        assert_eq!(
            store.get(&row.hash).unwrap().unwrap().status,
            PendingTransactionStatus::Unknown
        );
    }

    #[tokio::test]
    async fn resolve_never_downgrades_a_confirmed_row() {
        let store = Arc::new(PendingStore::open_in_memory().unwrap());
        let row = record(7, 5);
        store.insert(&row).unwrap();
        store
            .update_status(&row.hash, None, PendingTransactionStatus::OnChain)
            .unwrap();

        let sweeper = sweeper(
            FakeChain {
                ledger_timestamp_usecs: 0,
                by_hash: None,
            },
            store.clone(),
        );
        sweeper.resolve(&row.hash).await.unwrap();

        assert_eq!(
            store.get(&row.hash).unwrap().unwrap().status,
            PendingTransactionStatus::OnChain
        );
    }
}
