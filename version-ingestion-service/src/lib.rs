//! Per-version ingestion into the column store, plus the gap finder that
//! keeps the version table contiguous between batch loads.
//!
//! A version counts as ingested only once its `ingested_versions` marker
//! row lands, and that row is always written after the data rows. A crash
//! in between re-runs the whole version; inserts are append-only so the
//! worst case is a duplicate data row, never a hole.

use std::num::ParseIntError;
use std::sync::Arc;

use async_trait::async_trait;
use chain_client::types::{Event, TransactionData, TransactionPayloadData, WriteSetChange};
use chain_client::{ChainApi, ChainError};
use column_store::{ColumnStore, ColumnStoreError};
use core_types::types::Version;
use log::{debug, info};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The node returned nothing at this version; the job is retried.
    #[error("transaction not found at version {0}")]
    NotCommitted(Version),
    #[error("unsupported user transaction payload at version {0}")]
    UnsupportedPayload(Version),
    #[error("bad total supply value: {0}")]
    BadSupplyValue(String),
    #[error("bad numeric field: {0}")]
    BadField(#[from] ParseIntError),
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("column store error: {0}")]
    Store(#[from] ColumnStoreError),
}

/// Column-store surface this service needs, kept narrow so tests can
/// record writes.
#[async_trait]
pub trait VersionStore: Send + Sync + 'static {
    async fn insert_rows(
        &self,
        table: &str,
        rows: &[serde_json::Value],
    ) -> Result<(), ColumnStoreError>;
    async fn record_ingested_version(&self, version: Version) -> Result<(), ColumnStoreError>;
    async fn ingested_versions(
        &self,
        after: Option<Version>,
    ) -> Result<Vec<Version>, ColumnStoreError>;
    async fn last_batch_ingested_version(&self) -> Result<Option<Version>, ColumnStoreError>;
}

#[async_trait]
impl VersionStore for ColumnStore {
    async fn insert_rows(
        &self,
        table: &str,
        rows: &[serde_json::Value],
    ) -> Result<(), ColumnStoreError> {
        ColumnStore::insert_rows(self, table, rows).await
    }

    async fn record_ingested_version(&self, version: Version) -> Result<(), ColumnStoreError> {
        ColumnStore::record_ingested_version(self, version).await
    }

    async fn ingested_versions(
        &self,
        after: Option<Version>,
    ) -> Result<Vec<Version>, ColumnStoreError> {
        ColumnStore::ingested_versions(self, after).await
    }

    async fn last_batch_ingested_version(&self) -> Result<Option<Version>, ColumnStoreError> {
        ColumnStore::last_batch_ingested_version(self).await
    }
}

/// Rows bound for one table.
#[derive(Debug, PartialEq)]
pub struct TableRows {
    pub table: String,
    pub rows: Vec<serde_json::Value>,
}

pub struct VersionIngester {
    chain: Arc<dyn ChainApi>,
    store: Arc<dyn VersionStore>,
}

impl VersionIngester {
    pub fn new(chain: Arc<dyn ChainApi>, store: Arc<dyn VersionStore>) -> Self {
        Self { chain, store }
    }

    /// Ingest exactly one version. Pending transactions are skipped
    /// without a marker row.
    pub async fn ingest_version(&self, version: Version) -> Result<(), IngestError> {
        let transactions = self.chain.get_transactions(version, 1).await?;
        let Some(transaction) = transactions.into_iter().next() else {
            return Err(IngestError::NotCommitted(version));
        };
        if transaction.is_pending() {
            debug!("version {version} still pending, skipping");
            return Ok(());
        }

        for set in transaction_rows(&transaction)? {
            self.store.insert_rows(&set.table, &set.rows).await?;
        }

        let committed = transaction
            .version()
            .ok_or(IngestError::NotCommitted(version))?;
        self.store.record_ingested_version(committed).await?;
        Ok(())
    }

    pub async fn latest_version(&self) -> Result<Version, IngestError> {
        let info = self.chain.get_ledger_info().await?;
        Ok(info.version()?)
    }

    /// Versions between the last contiguous batch load and the ledger tip
    /// that have no marker row yet.
    pub async fn find_missing_versions(&self) -> Result<Vec<Version>, IngestError> {
        let last_batch = self.store.last_batch_ingested_version().await?;
        let ingested = self.store.ingested_versions(last_batch).await?;
        let tip = self.latest_version().await?;
        let missing = compute_missing_versions(last_batch, &ingested, tip);
        if !missing.is_empty() {
            info!("{} version(s) missing below tip {tip}", missing.len());
        }
        Ok(missing)
    }
}

/// Versions in `(last_batch, tip)` exclusive that are absent from the
/// sorted `ingested` list. No batch checkpoint means scanning from zero.
pub fn compute_missing_versions(
    last_batch: Option<Version>,
    ingested: &[Version],
    tip: Version,
) -> Vec<Version> {
    let start = last_batch.map(|v| v + 1).unwrap_or(0);
    (start..tip)
        .filter(|version| ingested.binary_search(version).is_err())
        .collect()
}

/// Flatten one committed transaction into per-table row sets. The marker
/// row is not included; callers append it last.
pub fn transaction_rows(transaction: &TransactionData) -> Result<Vec<TableRows>, IngestError> {
    let mut sets = Vec::new();
    match transaction {
        TransactionData::Pending(_) => {}
        TransactionData::Genesis(tx) => {
            let version = tx.version.parse()?;
            push_event_rows(&mut sets, version, 0, &tx.events)?;
        }
        TransactionData::BlockMetadata(tx) => {
            let version = tx.version.parse()?;
            push_event_rows(&mut sets, version, tx.timestamp.parse()?, &tx.events)?;
            if let Some(amount) = native_total_supply(&tx.changes)? {
                sets.push(TableRows {
                    table: "coin_total_supply".to_string(),
                    rows: vec![serde_json::json!({
                        "coin_type": NATIVE_COIN_TYPE,
                        "version": version,
                        // UInt128 travels as a decimal string.
                        "amount": amount.to_string(),
                    })],
                });
            }
            sets.push(TableRows {
                table: "block_metadata_transaction".to_string(),
                rows: vec![serde_json::json!({
                    "id": strip_hex(&tx.id),
                    "version": version,
                    "hash": strip_hex(&tx.hash),
                    "epoch": tx.epoch.parse::<u64>()?,
                    "round": tx.round.parse::<u64>()?,
                    "previous_block_votes_bitvec": hex::encode(&tx.previous_block_votes_bitvec),
                    "proposer": strip_hex(&tx.proposer),
                    "failed_proposer_indices": &tx.failed_proposer_indices,
                    "timestamp": tx.timestamp.parse::<u64>()?,
                })],
            });
        }
        TransactionData::StateCheckpoint(tx) => {
            let version: Version = tx.version.parse()?;
            sets.push(TableRows {
                table: "state_checkpoint_transaction".to_string(),
                rows: vec![serde_json::json!({
                    "version": version,
                    "hash": strip_hex(&tx.hash),
                    "state_change_hash": strip_hex(&tx.state_change_hash),
                    "event_root_hash": strip_hex(&tx.event_root_hash),
                    "state_checkpoint_hash": tx.state_checkpoint_hash.as_deref().map(strip_hex),
                    "gas_used": tx.gas_used.parse::<u64>()?,
                    "success": tx.success,
                    "vm_status": &tx.vm_status,
                    "accumulator_root_hash": strip_hex(&tx.accumulator_root_hash),
                    "timestamp": tx.timestamp.parse::<u64>()?,
                })],
            });
        }
        TransactionData::User(tx) => {
            let version: Version = tx.version.parse()?;
            push_event_rows(&mut sets, version, tx.timestamp.parse()?, &tx.events)?;

            let TransactionPayloadData::EntryFunction(entry) = &tx.payload else {
                return Err(IngestError::UnsupportedPayload(version));
            };
            let (module_address, module_name, function_name) = entry
                .split_function()
                .ok_or(IngestError::UnsupportedPayload(version))?;
            sets.push(TableRows {
                table: "user_transaction".to_string(),
                rows: vec![serde_json::json!({
                    "version": version,
                    "hash": strip_hex(&tx.hash),
                    "gas_used": tx.gas_used.parse::<u64>()?,
                    "success": tx.success,
                    "vm_status": &tx.vm_status,
                    "sender": strip_hex(&tx.sender),
                    "sequence_number": tx.sequence_number.parse::<u64>()?,
                    "max_gas_amount": tx.max_gas_amount.parse::<u64>()?,
                    "gas_unit_price": tx.gas_unit_price.parse::<u64>()?,
                    "expiration_timestamp": tx.expiration_timestamp_secs.parse::<u64>()?,
                    "module_address": strip_hex(module_address),
                    "module_name": module_name,
                    "function_name": function_name,
                    "type_arguments": serde_json::to_string(&entry.type_arguments)
                        .unwrap_or_default(),
                    "arguments": serde_json::to_string(&entry.arguments).unwrap_or_default(),
                    "timestamp": tx.timestamp.parse::<u64>()?,
                })],
            });
        }
    }
    Ok(sets)
}

const NATIVE_COIN_TYPE: &str = "0x1::coin::CoinInfo<0x1::libra_coin::LibraCoin>";

/// Table slot holding the native coin's aggregated total supply.
const TOTAL_SUPPLY_TABLE_HANDLE: &str =
    "0xfc074a2b7638a50ba678ce381a2350a28264f4da004603adb8dc36d125750108";
const TOTAL_SUPPLY_TABLE_KEY: &str =
    "0xa7e1af6d61e958dbefe8f35550aab562f8923634cd7f438bc5190e99ca5fb07c";

/// Total supply of the native coin, when this block's write set touches
/// the supply table slot. The on-chain value is little-endian bytes of a
/// u128.
fn native_total_supply(changes: &[WriteSetChange]) -> Result<Option<u128>, IngestError> {
    for change in changes {
        let WriteSetChange::WriteTableItem(item) = change else {
            continue;
        };
        if item.handle != TOTAL_SUPPLY_TABLE_HANDLE || item.key != TOTAL_SUPPLY_TABLE_KEY {
            continue;
        }
        let bytes = hex::decode(strip_hex(&item.value))
            .map_err(|_| IngestError::BadSupplyValue(item.value.clone()))?;
        if bytes.len() > 16 {
            return Err(IngestError::BadSupplyValue(item.value.clone()));
        }
        let mut buf = [0u8; 16];
        buf[..bytes.len()].copy_from_slice(&bytes);
        return Ok(Some(u128::from_le_bytes(buf)));
    }
    Ok(None)
}

fn push_event_rows(
    sets: &mut Vec<TableRows>,
    version: Version,
    timestamp: u64,
    events: &[Event],
) -> Result<(), IngestError> {
    if events.is_empty() {
        return Ok(());
    }
    let mut rows = Vec::with_capacity(events.len());
    for event in events {
        let (module_address, module_name, struct_name) = split_event_type(&event.type_tag);
        rows.push(serde_json::json!({
            "version": version,
            "timestamp": timestamp,
            "creation_number": event.guid.creation_number.parse::<u64>()?,
            "account_address": strip_hex(&event.guid.account_address),
            "sequence_number": event.sequence_number.parse::<u64>()?,
            "module_address": strip_hex(module_address),
            "module_name": module_name,
            "struct_name": struct_name,
            "data": event.data.to_string(),
        }));
    }
    sets.push(TableRows {
        table: "event".to_string(),
        rows,
    });
    Ok(())
}

/// Split `0xADDR::module::Struct<...>` into its three segments. Generic
/// suffixes stay attached to the struct name.
fn split_event_type(type_tag: &str) -> (&str, &str, &str) {
    let mut parts = type_tag.splitn(3, "::");
    let address = parts.next().unwrap_or_default();
    let module = parts.next().unwrap_or_default();
    let name = parts.next().unwrap_or_default();
    (address, module, name)
}

fn strip_hex(value: &str) -> &str {
    value.strip_prefix("0x").unwrap_or(value)
}
