//! Durable pending-transaction table.
//!
//! SQLite with WAL mode. The conditional status update here is the only
//! transactional guard in the system: multiple workers (submission API
//! and sweeper) may race on the same hash, and the single guarded UPDATE
//! statement decides the winner.

use std::path::Path;

use core_types::types::{AccountAddress, PendingTransactionStatus, TxHash, TypesError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum PendingStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    CorruptRow(#[from] TypesError),
}

/// Everything persisted about one submitted transaction.
#[derive(Debug, Clone)]
pub struct PendingTransactionRecord {
    pub hash: TxHash,
    pub sender: AccountAddress,
    pub sequence_number: u64,
    pub max_gas_amount: u64,
    pub gas_unit_price: u64,
    pub expiration_timestamp_secs: u64,
    pub chain_id: u8,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub module_address: AccountAddress,
    pub module_name: String,
    pub function_name: String,
    /// BCS-encoded entry function arguments, concatenated length-prefixed.
    pub args: Vec<u8>,
    pub status: PendingTransactionStatus,
}

pub struct PendingStore {
    conn: Mutex<Connection>,
}

impl PendingStore {
    pub fn open(path: &Path) -> Result<Self, PendingStoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, PendingStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert-or-ignore keyed by hash. Returns whether a row was created.
    pub fn insert(&self, record: &PendingTransactionRecord) -> Result<bool, PendingStoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO pending_transaction (
                hash, sender, sequence_number, max_gas_amount, gas_unit_price,
                expiration_timestamp_secs, chain_id, public_key, signature,
                module_address, module_name, function_name, args, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.hash.as_bytes(),
                record.sender.as_bytes(),
                record.sequence_number,
                record.max_gas_amount,
                record.gas_unit_price,
                record.expiration_timestamp_secs,
                record.chain_id,
                record.public_key,
                record.signature,
                record.module_address.as_bytes(),
                record.module_name,
                record.function_name,
                record.args,
                record.status.as_str(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Conditional status transition.
    ///
    /// With `expected_from` the row changes only while still in that
    /// status (compare-and-swap); without it, whenever the current status
    /// differs from `to`. Returns whether a row actually changed.
    pub fn update_status(
        &self,
        hash: &TxHash,
        expected_from: Option<PendingTransactionStatus>,
        to: PendingTransactionStatus,
    ) -> Result<bool, PendingStoreError> {
        let conn = self.conn.lock();
        let changed = match expected_from {
            Some(from) => conn.execute(
                "UPDATE pending_transaction SET status = ?1
                 WHERE hash = ?2 AND status = ?3",
                params![to.as_str(), hash.as_bytes(), from.as_str()],
            )?,
            None => conn.execute(
                "UPDATE pending_transaction SET status = ?1
                 WHERE hash = ?2 AND status != ?1",
                params![to.as_str(), hash.as_bytes()],
            )?,
        };
        Ok(changed > 0)
    }

    pub fn get(&self, hash: &TxHash) -> Result<Option<PendingTransactionRecord>, PendingStoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{SELECT_COLUMNS} WHERE hash = ?1"),
            params![hash.as_bytes()],
            row_to_record,
        )
        .optional()?
        .transpose()
    }

    /// Pending rows for one sender, oldest first.
    pub fn by_sender(
        &self,
        sender: &AccountAddress,
    ) -> Result<Vec<PendingTransactionRecord>, PendingStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE sender = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![sender.as_bytes()], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    /// Hashes of UNKNOWN transactions whose expiration is strictly before
    /// `ledger_secs`, oldest-expiring first, capped at `limit`.
    pub fn expired_before(
        &self,
        ledger_secs: u64,
        limit: usize,
    ) -> Result<Vec<TxHash>, PendingStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT hash FROM pending_transaction
             WHERE status = 'UNKNOWN' AND expiration_timestamp_secs < ?1
             ORDER BY expiration_timestamp_secs ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![ledger_secs, limit as i64], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut hashes = Vec::new();
        for row in rows {
            hashes.push(TxHash::from_bytes(&row?)?);
        }
        Ok(hashes)
    }
}

const SELECT_COLUMNS: &str = "SELECT
    hash, sender, sequence_number, max_gas_amount, gas_unit_price,
    expiration_timestamp_secs, chain_id, public_key, signature,
    module_address, module_name, function_name, args, status
 FROM pending_transaction";

fn row_to_record(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<PendingTransactionRecord, PendingStoreError>> {
    let hash: Vec<u8> = row.get(0)?;
    let sender: Vec<u8> = row.get(1)?;
    let module_address: Vec<u8> = row.get(9)?;
    let status: String = row.get(13)?;
    Ok(build_record(
        hash,
        sender,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        module_address,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        status,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    hash: Vec<u8>,
    sender: Vec<u8>,
    sequence_number: u64,
    max_gas_amount: u64,
    gas_unit_price: u64,
    expiration_timestamp_secs: u64,
    chain_id: u8,
    public_key: Vec<u8>,
    signature: Vec<u8>,
    module_address: Vec<u8>,
    module_name: String,
    function_name: String,
    args: Vec<u8>,
    status: String,
) -> Result<PendingTransactionRecord, PendingStoreError> {
    Ok(PendingTransactionRecord {
        hash: TxHash::from_bytes(&hash)?,
        sender: AccountAddress::from_bytes(&sender)?,
        sequence_number,
        max_gas_amount,
        gas_unit_price,
        expiration_timestamp_secs,
        chain_id,
        public_key,
        signature,
        module_address: AccountAddress::from_bytes(&module_address)?,
        module_name,
        function_name,
        args,
        status: status.parse()?,
    })
}
