//! In-process pub/sub for per-wallet notifications.
//!
//! Channels are named `wallet.{ADDRESS}.transaction` and
//! `wallet.{ADDRESS}.movement`, with the address rendered as 64 uppercase
//! hex characters. Publishing to a channel nobody subscribes to is a no-op.

use std::collections::HashMap;

use core_types::types::{AccountAddress, TxHash, Version};
use log::trace;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// Payload on a `wallet.*.transaction` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionNotice {
    pub hash: String,
}

/// Payload on a `wallet.*.movement` channel. The version is carried as a
/// string so the envelope survives consumers that cannot hold a u64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementNotice {
    pub version: String,
}

pub fn transaction_channel(address: &AccountAddress) -> String {
    format!("wallet.{}.transaction", address.to_hex_upper())
}

pub fn movement_channel(address: &AccountAddress) -> String {
    format!("wallet.{}.movement", address.to_hex_upper())
}

/// Fan-out bus keyed by channel name. Senders are created lazily on first
/// subscribe; publishes to unknown channels are dropped.
#[derive(Default)]
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn publish(&self, channel: &str, payload: String) {
        let sender = {
            let mut channels = self.channels.lock();
            match channels.get(channel) {
                Some(sender) if sender.receiver_count() > 0 => Some(sender.clone()),
                Some(_) => {
                    // Last receiver is gone; drop the idle sender so the
                    // registry does not grow with dead wallets.
                    channels.remove(channel);
                    None
                }
                None => None,
            }
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(payload);
            }
            None => trace!("no subscribers on {channel}"),
        }
    }

    /// Number of channels currently held open by at least one past
    /// subscriber.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn publish_transaction(&self, address: &AccountAddress, hash: &TxHash) {
        let notice = TransactionNotice {
            hash: hash.to_hex(),
        };
        if let Ok(payload) = serde_json::to_string(&notice) {
            self.publish(&transaction_channel(address), payload);
        }
    }

    pub fn publish_movement(&self, address: &AccountAddress, version: Version) {
        let notice = MovementNotice {
            version: version.to_string(),
        };
        if let Ok(payload) = serde_json::to_string(&notice) {
            self.publish(&movement_channel(address), payload);
        }
    }
}
