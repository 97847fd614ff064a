//! Minimal BCS decoding of signed transactions, plus the canonical
//! transaction hash.
//!
//! Only the shape this service accepts is decoded: an entry-function
//! payload signed with a single Ed25519 key. Everything else is rejected
//! up front rather than half-parsed.

use core_types::types::{AccountAddress, TxHash};
use sha3::{Digest, Sha3_256};
use thiserror::Error;

const HASH_DOMAIN: &[u8] = b"DIEM::Transaction";

// Variant indexes in the transaction payload and authenticator enums.
const PAYLOAD_ENTRY_FUNCTION: u64 = 2;
const AUTHENTICATOR_ED25519: u64 = 0;

#[derive(Debug, Error)]
pub enum BcsError {
    #[error("unexpected end of input at offset {0}")]
    Truncated(usize),
    #[error("uleb128 length does not fit in 32 bits")]
    BadUleb,
    #[error("identifier is not valid utf-8")]
    BadIdentifier,
    #[error("unsupported transaction payload variant {0}")]
    UnsupportedPayload(u64),
    #[error("unsupported transaction authenticator variant {0}")]
    UnsupportedAuthenticator(u64),
    #[error("unknown type tag variant {0}")]
    UnknownTypeTag(u64),
    #[error("{0} trailing byte(s) after the signature")]
    TrailingBytes(usize),
}

/// The fields of a signed entry-function transaction this service keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransaction {
    pub sender: AccountAddress,
    pub sequence_number: u64,
    pub max_gas_amount: u64,
    pub gas_unit_price: u64,
    pub expiration_timestamp_secs: u64,
    pub chain_id: u8,
    pub module_address: AccountAddress,
    pub module_name: String,
    pub function_name: String,
    pub args: Vec<Vec<u8>>,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// `SHA3-256(SHA3-256(domain) || 0x00 || bytes)`; the leading zero is the
/// user-transaction variant index in the ledger's transaction enum.
pub fn canonical_hash(signed: &[u8]) -> TxHash {
    let prefix = Sha3_256::digest(HASH_DOMAIN);
    let mut hasher = Sha3_256::new();
    hasher.update(prefix);
    hasher.update([0u8]);
    hasher.update(signed);
    TxHash(hasher.finalize().into())
}

pub fn decode_signed_transaction(bytes: &[u8]) -> Result<DecodedTransaction, BcsError> {
    let mut reader = Reader::new(bytes);

    let sender = AccountAddress(reader.fixed()?);
    let sequence_number = reader.u64()?;

    let payload_variant = reader.uleb128()?;
    if payload_variant != PAYLOAD_ENTRY_FUNCTION {
        return Err(BcsError::UnsupportedPayload(payload_variant));
    }
    let module_address = AccountAddress(reader.fixed()?);
    let module_name = reader.identifier()?;
    let function_name = reader.identifier()?;

    let type_arg_count = reader.uleb128()?;
    for _ in 0..type_arg_count {
        skip_type_tag(&mut reader)?;
    }

    let arg_count = reader.uleb128()?;
    let mut args = Vec::with_capacity(arg_count as usize);
    for _ in 0..arg_count {
        args.push(reader.bytes()?);
    }

    let max_gas_amount = reader.u64()?;
    let gas_unit_price = reader.u64()?;
    let expiration_timestamp_secs = reader.u64()?;
    let chain_id = reader.u8()?;

    let authenticator_variant = reader.uleb128()?;
    if authenticator_variant != AUTHENTICATOR_ED25519 {
        return Err(BcsError::UnsupportedAuthenticator(authenticator_variant));
    }
    let public_key = reader.bytes()?;
    let signature = reader.bytes()?;

    if reader.remaining() != 0 {
        return Err(BcsError::TrailingBytes(reader.remaining()));
    }

    Ok(DecodedTransaction {
        sender,
        sequence_number,
        max_gas_amount,
        gas_unit_price,
        expiration_timestamp_secs,
        chain_id,
        module_address,
        module_name,
        function_name,
        args,
        public_key,
        signature,
    })
}

/// Re-encode raw argument blobs as a BCS `Vec<Vec<u8>>` for storage.
pub fn encode_args(args: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    write_uleb128(&mut out, args.len() as u64);
    for arg in args {
        write_uleb128(&mut out, arg.len() as u64);
        out.extend_from_slice(arg);
    }
    out
}

fn write_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Walk over one type tag without keeping it.
fn skip_type_tag(reader: &mut Reader<'_>) -> Result<(), BcsError> {
    let variant = reader.uleb128()?;
    match variant {
        // bool, u8, u64, u128, address, signer, u16, u32, u256
        0..=5 | 8..=10 => Ok(()),
        // vector<T>
        6 => skip_type_tag(reader),
        // struct tag
        7 => {
            let _address: [u8; 32] = reader.fixed()?;
            reader.identifier()?;
            reader.identifier()?;
            let count = reader.uleb128()?;
            for _ in 0..count {
                skip_type_tag(reader)?;
            }
            Ok(())
        }
        other => Err(BcsError::UnknownTypeTag(other)),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], BcsError> {
        if self.remaining() < len {
            return Err(BcsError::Truncated(self.pos));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, BcsError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, BcsError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N], BcsError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn uleb128(&mut self) -> Result<u64, BcsError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 31 {
                return Err(BcsError::BadUleb);
            }
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>, BcsError> {
        let len = self.uleb128()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn identifier(&mut self) -> Result<String, BcsError> {
        let raw = self.bytes()?;
        String::from_utf8(raw).map_err(|_| BcsError::BadIdentifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A real signed transfer captured off the wire.
    const SIGNED_TRANSFER: &str = "fe01b4146468cd24426912cbddf545b918dc9bad4b990dc013aa71491c71feb8\
        0600000000000000\
        02\
        0000000000000000000000000000000000000000000000000000000000000001\
        0a6f6c5f6163636f756e74\
        087472616e73666572\
        00\
        02\
        200000000000000000000000000000000003a3fcfaf8224bd598d96bbaf0c6d99f\
        0838b5560700000000\
        80841e0000000000\
        c800000000000000\
        43fe506600000000\
        01\
        00\
        20b1d5f139f70764efdb2e6e9efbf6d74825ddedfe59e29413334be3fe787a793e\
        4003703db0d71151f9ee73f91bec272ac81f2e4e6684e98d9f30af8441b58f1f54f8654ddd541ac740902b4bf44154d6ec3a49035ae06874ca9b5ad5dc27816a06";

    fn signed_bytes() -> Vec<u8> {
        hex::decode(SIGNED_TRANSFER.replace(char::is_whitespace, "")).unwrap()
    }

    #[test]
    fn decodes_a_real_transfer() {
        let decoded = decode_signed_transaction(&signed_bytes()).unwrap();

        assert_eq!(
            decoded.sender,
            AccountAddress::from_hex(
                "fe01b4146468cd24426912cbddf545b918dc9bad4b990dc013aa71491c71feb8"
            )
            .unwrap()
        );
        assert_eq!(decoded.sequence_number, 6);
        assert_eq!(decoded.max_gas_amount, 2_000_000);
        assert_eq!(decoded.gas_unit_price, 200);
        assert_eq!(decoded.expiration_timestamp_secs, 1_716_584_003);
        assert_eq!(decoded.chain_id, 1);
        assert_eq!(decoded.module_address, AccountAddress::from_hex("0x1").unwrap());
        assert_eq!(decoded.module_name, "ol_account");
        assert_eq!(decoded.function_name, "transfer");
        assert_eq!(decoded.args.len(), 2);
        assert_eq!(decoded.args[1], 123_123_000u64.to_le_bytes());
        assert_eq!(decoded.public_key.len(), 32);
        assert_eq!(decoded.signature.len(), 64);
    }

    #[test]
    fn canonical_hash_matches_the_node() {
        let hash = canonical_hash(&signed_bytes());
        assert_eq!(
            hash,
            TxHash::from_hex("10fa0d856882726ace476e51a5ad63c3a82cd013f1179a90598f33cf75f277d4")
                .unwrap()
        );
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = signed_bytes();
        assert!(matches!(
            decode_signed_transaction(&bytes[..bytes.len() - 10]),
            Err(BcsError::Truncated(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = signed_bytes();
        bytes.push(0);
        assert!(matches!(
            decode_signed_transaction(&bytes),
            Err(BcsError::TrailingBytes(1))
        ));
    }

    #[test]
    fn script_payload_is_unsupported() {
        let mut bytes = signed_bytes();
        // payload variant lives right after the sender and sequence number
        bytes[40] = 0;
        assert!(matches!(
            decode_signed_transaction(&bytes),
            Err(BcsError::UnsupportedPayload(0))
        ));
    }

    #[test]
    fn multi_agent_authenticator_is_unsupported() {
        let mut bytes = signed_bytes();
        let auth_pos = bytes.len() - 1 - 64 - 1 - 32 - 1;
        bytes[auth_pos] = 2;
        assert!(matches!(
            decode_signed_transaction(&bytes),
            Err(BcsError::UnsupportedAuthenticator(2))
        ));
    }

    #[test]
    fn encode_args_round_trips_through_the_reader() {
        let args = vec![vec![1, 2, 3], vec![], vec![9; 200]];
        let encoded = encode_args(&args);
        let mut reader = Reader::new(&encoded);
        let count = reader.uleb128().unwrap();
        let decoded: Vec<Vec<u8>> = (0..count).map(|_| reader.bytes().unwrap()).collect();
        assert_eq!(decoded, args);
        assert_eq!(reader.remaining(), 0);
    }
}
