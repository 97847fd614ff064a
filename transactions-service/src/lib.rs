//! Transaction lifecycle: submission intake, status transitions and
//! hash lookups across the pending store and the chain.

pub mod bcs;
pub mod sweeper;

use std::num::ParseIntError;
use std::sync::Arc;

use chain_client::{ChainApi, ChainError, TransactionData};
use core_types::types::{AccountAddress, PendingTransactionStatus, TxHash, TypesError};
use event_bus::EventBus;
use log::debug;
use pending_store::{PendingStore, PendingStoreError, PendingTransactionRecord};
use thiserror::Error;

use bcs::{canonical_hash, decode_signed_transaction, encode_args, BcsError};

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("bad signed transaction: {0}")]
    Bcs(#[from] BcsError),
    #[error("pending store error: {0}")]
    Store(#[from] PendingStoreError),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("corrupt hash: {0}")]
    Types(#[from] TypesError),
    #[error("invalid ledger info: {0}")]
    LedgerInfo(#[from] ParseIntError),
    /// The node answered a by-hash query with a different transaction.
    #[error("hash mismatch: requested {requested} returned {returned}")]
    HashMismatch { requested: TxHash, returned: String },
}

/// Where a hash was found.
#[derive(Debug)]
pub enum TransactionLookup {
    Pending(PendingTransactionRecord),
    Committed(TransactionData),
}

pub struct TransactionLifecycle {
    chain: Arc<dyn ChainApi>,
    store: Arc<PendingStore>,
    bus: Arc<EventBus>,
}

impl TransactionLifecycle {
    pub fn new(chain: Arc<dyn ChainApi>, store: Arc<PendingStore>, bus: Arc<EventBus>) -> Self {
        Self { chain, store, bus }
    }

    /// Record one signed transaction. Returns its canonical hash and
    /// whether this submission was the first with that hash; only a first
    /// submission notifies the sender's channel.
    pub fn submit(&self, signed: &[u8]) -> Result<(TxHash, bool), TransactionError> {
        let decoded = decode_signed_transaction(signed)?;
        let hash = canonical_hash(signed);

        let record = PendingTransactionRecord {
            hash,
            sender: decoded.sender,
            sequence_number: decoded.sequence_number,
            max_gas_amount: decoded.max_gas_amount,
            gas_unit_price: decoded.gas_unit_price,
            expiration_timestamp_secs: decoded.expiration_timestamp_secs,
            chain_id: decoded.chain_id,
            public_key: decoded.public_key,
            signature: decoded.signature,
            module_address: decoded.module_address,
            module_name: decoded.module_name,
            function_name: decoded.function_name,
            args: encode_args(&decoded.args),
            status: PendingTransactionStatus::Unknown,
        };

        let inserted = self.store.insert(&record)?;
        if inserted {
            self.bus.publish_transaction(&record.sender, &hash);
        } else {
            debug!("duplicate submission of {hash}");
        }
        Ok((hash, inserted))
    }

    /// Conditional status transition; a change notifies the sender's
    /// channel. See [`PendingStore::update_status`] for the CAS contract.
    pub fn update_status(
        &self,
        hash: &TxHash,
        expected_from: Option<PendingTransactionStatus>,
        to: PendingTransactionStatus,
    ) -> Result<bool, TransactionError> {
        let changed = self.store.update_status(hash, expected_from, to)?;
        if changed {
            if let Some(record) = self.store.get(hash)? {
                self.bus.publish_transaction(&record.sender, hash);
            }
        }
        Ok(changed)
    }

    /// Look a hash up in the pending store first, then the chain's
    /// confirmed index.
    pub async fn lookup(
        &self,
        hash: &TxHash,
    ) -> Result<Option<TransactionLookup>, TransactionError> {
        if let Some(record) = self.store.get(hash)? {
            return Ok(Some(TransactionLookup::Pending(record)));
        }
        match self.chain.get_transaction_by_hash(hash).await {
            Ok(transaction) => {
                verify_returned_hash(hash, transaction.hash())?;
                Ok(Some(TransactionLookup::Committed(transaction)))
            }
            Err(ChainError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Pending rows for one sender, oldest first.
    pub fn wallet_transactions(
        &self,
        sender: &AccountAddress,
    ) -> Result<Vec<PendingTransactionRecord>, TransactionError> {
        Ok(self.store.by_sender(sender)?)
    }
}

pub(crate) fn verify_returned_hash(
    requested: &TxHash,
    returned: &str,
) -> Result<(), TransactionError> {
    let parsed = TxHash::from_hex(returned)?;
    if parsed != *requested {
        return Err(TransactionError::HashMismatch {
            requested: *requested,
            returned: returned.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chain_client::types::LedgerInfo;
    use event_bus::{transaction_channel, TransactionNotice};

    const SIGNED_TRANSFER: &str = "fe01b4146468cd24426912cbddf545b918dc9bad4b990dc013aa71491c71feb806000000000000000200000000000000000000000000000000000000000000000000000000000000010a6f6c5f6163636f756e74087472616e736665720002200000000000000000000000000000000003a3fcfaf8224bd598d96bbaf0c6d99f0838b556070000000080841e0000000000c80000000000000043fe506600000000010020b1d5f139f70764efdb2e6e9efbf6d74825ddedfe59e29413334be3fe787a793e4003703db0d71151f9ee73f91bec272ac81f2e4e6684e98d9f30af8441b58f1f54f8654ddd541ac740902b4bf44154d6ec3a49035ae06874ca9b5ad5dc27816a06";

    struct FakeChain {
        by_hash: Option<TransactionData>,
    }

    #[async_trait]
    impl ChainApi for FakeChain {
        async fn get_ledger_info(&self) -> Result<LedgerInfo, ChainError> {
            unimplemented!()
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

    fn lifecycle(chain: FakeChain) -> (TransactionLifecycle, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(PendingStore::open_in_memory().unwrap());
        (
            TransactionLifecycle::new(Arc::new(chain), store, bus.clone()),
            bus,
        )
    }

    fn committed(hash: &str) -> TransactionData {
        serde_json::from_value(serde_json::json!({
            "type": "genesis_transaction",
            "version": "0",
            "hash": hash,
            "events": []
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn first_submission_inserts_and_notifies() {
        let (lifecycle, bus) = lifecycle(FakeChain { by_hash: None });
        let signed = hex::decode(SIGNED_TRANSFER).unwrap();
        let sender = AccountAddress::from_hex(
            "fe01b4146468cd24426912cbddf545b918dc9bad4b990dc013aa71491c71feb8",
        )
        .unwrap();
        let mut rx = bus.subscribe(&transaction_channel(&sender));

        let (hash, inserted) = lifecycle.submit(&signed).unwrap();
        assert!(inserted);

        let notice: TransactionNotice =
            serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(notice.hash, hash.to_hex());

        let rows = lifecycle.wallet_transactions(&sender).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].function_name, "transfer");
        assert_eq!(rows[0].status, PendingTransactionStatus::Unknown);
    }

    #[tokio::test]
    async fn duplicate_submission_is_silent() {
        let (lifecycle, bus) = lifecycle(FakeChain { by_hash: None });
        let signed = hex::decode(SIGNED_TRANSFER).unwrap();
        let sender = AccountAddress::from_hex(
            "fe01b4146468cd24426912cbddf545b918dc9bad4b990dc013aa71491c71feb8",
        )
        .unwrap();

        let (_, first) = lifecycle.submit(&signed).unwrap();
        assert!(first);

        let mut rx = bus.subscribe(&transaction_channel(&sender));
        let (_, second) = lifecycle.submit(&signed).unwrap();
        assert!(!second);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lookup_prefers_the_pending_store() {
        let (lifecycle, _) = lifecycle(FakeChain {
            by_hash: Some(committed("0xdeadbeef")),
        });
        let signed = hex::decode(SIGNED_TRANSFER).unwrap();
        let (hash, _) = lifecycle.submit(&signed).unwrap();

        let found = lifecycle.lookup(&hash).await.unwrap();
        assert!(matches!(found, Some(TransactionLookup::Pending(_))));
    }

    #[tokio::test]
    async fn lookup_falls_back_to_the_chain_and_checks_the_hash() {
        let hash = TxHash([7u8; 32]);
        let (lifecycle, _) = lifecycle(FakeChain {
            by_hash: Some(committed(&format!("0x{}", hash.to_hex()))),
        });
        let found = lifecycle.lookup(&hash).await.unwrap();
        assert!(matches!(found, Some(TransactionLookup::Committed(_))));

        let (lifecycle, _) = lifecycle_with_wrong_hash();
        let err = lifecycle.lookup(&hash).await.unwrap_err();
        assert!(matches!(err, TransactionError::HashMismatch { .. }));
    }

    fn lifecycle_with_wrong_hash() -> (TransactionLifecycle, Arc<EventBus>) {
        lifecycle(FakeChain {
            by_hash: Some(committed(&format!("0x{}", TxHash([9u8; 32]).to_hex()))),
        })
    }

    #[tokio::test]
    async fn unknown_hash_resolves_to_none() {
        let (lifecycle, _) = lifecycle(FakeChain { by_hash: None });
        let found = lifecycle.lookup(&TxHash([1u8; 32])).await.unwrap();
        assert!(found.is_none());
    }
}
