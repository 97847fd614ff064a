use serde::{Deserialize, Serialize};

/// Ledger metadata returned by `GET /v1`.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerInfo {
    pub chain_id: u8,
    /// Version of the ledger tip, stringified on the wire.
    pub ledger_version: String,
    /// Ledger clock in microseconds, stringified on the wire.
    pub ledger_timestamp: String,
}

impl LedgerInfo {
    pub fn version(&self) -> Result<u64, std::num::ParseIntError> {
        self.ledger_version.parse()
    }

    pub fn timestamp_usecs(&self) -> Result<u64, std::num::ParseIntError> {
        self.ledger_timestamp.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub guid: EventGuid,
    pub sequence_number: String,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventGuid {
    pub creation_number: String,
    pub account_address: String,
}

/// One ledger transaction, discriminated by the wire `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransactionData {
    #[serde(rename = "pending_transaction")]
    Pending(PendingTransactionData),
    #[serde(rename = "genesis_transaction")]
    Genesis(GenesisTransactionData),
    #[serde(rename = "block_metadata_transaction")]
    BlockMetadata(BlockMetadataTransactionData),
    #[serde(rename = "state_checkpoint_transaction")]
    StateCheckpoint(StateCheckpointTransactionData),
    #[serde(rename = "user_transaction")]
    User(UserTransactionData),
}

impl TransactionData {
    /// Version of a committed transaction; pending transactions have none.
    pub fn version(&self) -> Option<u64> {
        let version = match self {
            Self::Pending(_) => return None,
            Self::Genesis(tx) => &tx.version,
            Self::BlockMetadata(tx) => &tx.version,
            Self::StateCheckpoint(tx) => &tx.version,
            Self::User(tx) => &tx.version,
        };
        version.parse().ok()
    }

    pub fn hash(&self) -> &str {
        match self {
            Self::Pending(tx) => &tx.hash,
            Self::Genesis(tx) => &tx.hash,
            Self::BlockMetadata(tx) => &tx.hash,
            Self::StateCheckpoint(tx) => &tx.hash,
            Self::User(tx) => &tx.hash,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTransactionData {
    pub hash: String,
    pub sender: String,
    pub sequence_number: String,
    pub expiration_timestamp_secs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisTransactionData {
    pub version: String,
    pub hash: String,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMetadataTransactionData {
    pub version: String,
    pub hash: String,
    pub id: String,
    pub epoch: String,
    pub round: String,
    pub previous_block_votes_bitvec: Vec<u8>,
    pub proposer: String,
    #[serde(default)]
    pub failed_proposer_indices: Vec<u32>,
    pub timestamp: String,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub changes: Vec<WriteSetChange>,
}

/// Write-set entry of a committed transaction. Only table item writes are
/// modeled; every other change kind falls through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WriteSetChange {
    #[serde(rename = "write_table_item")]
    WriteTableItem(WriteTableItemData),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteTableItemData {
    pub handle: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateCheckpointTransactionData {
    pub version: String,
    pub hash: String,
    pub state_change_hash: String,
    pub event_root_hash: String,
    #[serde(default)]
    pub state_checkpoint_hash: Option<String>,
    pub gas_used: String,
    pub success: bool,
    pub vm_status: String,
    pub accumulator_root_hash: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTransactionData {
    pub version: String,
    pub hash: String,
    pub gas_used: String,
    pub success: bool,
    pub vm_status: String,
    pub sender: String,
    pub sequence_number: String,
    pub max_gas_amount: String,
    pub gas_unit_price: String,
    pub expiration_timestamp_secs: String,
    pub payload: TransactionPayloadData,
    pub timestamp: String,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransactionPayloadData {
    #[serde(rename = "entry_function_payload")]
    EntryFunction(EntryFunctionPayloadData),
    #[serde(rename = "script_payload")]
    Script(serde_json::Value),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryFunctionPayloadData {
    /// Fully qualified `address::module::function` path.
    pub function: String,
    #[serde(default)]
    pub type_arguments: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<serde_json::Value>,
}

impl EntryFunctionPayloadData {
    /// Split the function path into (module address, module name, function
    /// name). Generic suffixes stay attached to the function name.
    pub fn split_function(&self) -> Option<(&str, &str, &str)> {
        let mut parts = self.function.splitn(3, "::");
        Some((parts.next()?, parts.next()?, parts.next()?))
    }
}

/// Error body of the node API, carried on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeErrorBody {
    pub message: String,
    pub error_code: Option<String>,
}
