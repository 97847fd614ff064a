use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Monotonic identifier of one ledger transaction.
pub type Version = u64;

/// Fixed decimal scale of the ledger's coin (micro-units per whole coin).
pub const COIN_SCALE: f64 = 1_000_000.0;

#[derive(Debug, Error)]
pub enum TypesError {
    #[error("invalid address length {0}, expected 16 or 32 bytes")]
    InvalidAddressLength(usize),
    #[error("invalid hash length {0}, expected 32 bytes")]
    InvalidHashLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("unknown pending transaction status {0:?}")]
    UnknownStatus(String),
}

/// 32-byte account address. Legacy 16-byte addresses are left-padded
/// with zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountAddress(pub [u8; 32]);

impl AccountAddress {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        match bytes.len() {
            32 => {
                let mut buf = [0u8; 32];
                buf.copy_from_slice(bytes);
                Ok(Self(buf))
            }
            16 => {
                let mut buf = [0u8; 32];
                buf[16..].copy_from_slice(bytes);
                Ok(Self(buf))
            }
            len => Err(TypesError::InvalidAddressLength(len)),
        }
    }

    pub fn from_hex(s: &str) -> Result<Self, TypesError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        // Short addresses drop leading zeros over the wire.
        let padded = if s.len() < 64 {
            format!("{:0>64}", s)
        } else {
            s.to_string()
        };
        Self::from_bytes(&hex::decode(padded)?)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex_upper(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// 32-byte transaction hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        if bytes.len() != 32 {
            return Err(TypesError::InvalidHashLength(bytes.len()));
        }
        let mut buf = [0u8; 32];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    pub fn from_hex(s: &str) -> Result<Self, TypesError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        Self::from_bytes(&hex::decode(s)?)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Lifecycle of a transaction submitted through this system.
///
/// `OnChain` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingTransactionStatus {
    Unknown,
    OnChain,
    Expired,
}

impl PendingTransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::OnChain => "ON_CHAIN",
            Self::Expired => "EXPIRED",
        }
    }
}

impl FromStr for PendingTransactionStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(Self::Unknown),
            "ON_CHAIN" => Ok(Self::OnChain),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(TypesError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for PendingTransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_address_is_left_padded() {
        let addr = AccountAddress::from_bytes(&[0xAB; 16]).unwrap();
        assert_eq!(&addr.0[..16], &[0u8; 16]);
        assert_eq!(&addr.0[16..], &[0xAB; 16]);
    }

    #[test]
    fn odd_length_addresses_are_rejected() {
        assert!(AccountAddress::from_bytes(&[1u8; 20]).is_err());
    }

    #[test]
    fn address_hex_roundtrip() {
        let addr = AccountAddress::from_hex("0x1").unwrap();
        assert_eq!(addr.0[31], 1);
        assert_eq!(
            addr.to_hex_upper(),
            "0000000000000000000000000000000000000000000000000000000000000001"
        );
    }

    #[test]
    fn status_str_roundtrip() {
        for status in [
            PendingTransactionStatus::Unknown,
            PendingTransactionStatus::OnChain,
            PendingTransactionStatus::Expired,
        ] {
            assert_eq!(
                status.as_str().parse::<PendingTransactionStatus>().unwrap(),
                status
            );
        }
        assert!("PENDING".parse::<PendingTransactionStatus>().is_err());
    }
}
