//! REST client for the ledger node API.
//!
//! All consumers go through the [`ChainApi`] trait so services can be
//! exercised against mocks.

pub mod types;

use async_trait::async_trait;
use core_types::retry::RetryPolicy;
use core_types::types::{TxHash, Version};
use log::debug;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use types::{LedgerInfo, TransactionData};

#[derive(Debug, Error)]
pub enum ChainError {
    /// The node knows nothing about the requested transaction.
    #[error("transaction not found: {0}")]
    NotFound(String),
    #[error("transaction not found at version {0}")]
    VersionNotFound(Version),
    #[error("node returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid ledger info: {0}")]
    InvalidLedgerInfo(#[from] std::num::ParseIntError),
}

impl ChainError {
    /// Transport failures and server-side errors are worth another try;
    /// everything else is a definitive answer.
    fn is_transient(&self) -> bool {
        match self {
            ChainError::Http(_) => true,
            ChainError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait ChainApi: Send + Sync + 'static {
    async fn get_ledger_info(&self) -> Result<LedgerInfo, ChainError>;

    /// Fetch up to `limit` committed transactions starting at `start`.
    async fn get_transactions(
        &self,
        start: Version,
        limit: u16,
    ) -> Result<Vec<TransactionData>, ChainError>;

    /// Look up one transaction by hash. `ChainError::NotFound` when the
    /// node has never seen it.
    async fn get_transaction_by_hash(&self, hash: &TxHash)
        -> Result<TransactionData, ChainError>;
}

/// HTTP implementation of [`ChainApi`].
pub struct ChainClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl ChainClient {
    pub fn new(provider: &str, request_timeout: std::time::Duration) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: format!("{}/v1", provider.trim_end_matches('/')),
            retry: RetryPolicy::default_network(),
        })
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ChainError> {
        let res = self.http.get(url).query(query).send().await?;
        if !res.status().is_success() {
            return Err(self.error_for(res).await);
        }
        Ok(res.json().await?)
    }

    async fn error_for(&self, res: reqwest::Response) -> ChainError {
        let status = res.status().as_u16();
        match res.json::<types::NodeErrorBody>().await {
            Ok(body) => {
                if body.error_code.as_deref() == Some("transaction_not_found") {
                    ChainError::NotFound(body.message)
                } else {
                    ChainError::Status {
                        status,
                        message: body.message,
                    }
                }
            }
            Err(_) => ChainError::Status {
                status,
                message: "unparseable error body".to_string(),
            },
        }
    }
}

#[async_trait]
impl ChainApi for ChainClient {
    async fn get_ledger_info(&self) -> Result<LedgerInfo, ChainError> {
        self.retry
            .retry_async_when(
                |_| self.fetch_json(&self.base_url, &[]),
                ChainError::is_transient,
            )
            .await
    }

    async fn get_transactions(
        &self,
        start: Version,
        limit: u16,
    ) -> Result<Vec<TransactionData>, ChainError> {
        debug!("fetching {limit} transaction(s) from version {start}");
        let url = format!("{}/transactions", self.base_url);
        let query = [("start", start.to_string()), ("limit", limit.to_string())];
        self.retry
            .retry_async_when(|_| self.fetch_json(&url, &query), ChainError::is_transient)
            .await
    }

    async fn get_transaction_by_hash(
        &self,
        hash: &TxHash,
    ) -> Result<TransactionData, ChainError> {
        let url = format!("{}/transactions/by_hash/{hash}", self.base_url);
        self.retry
            .retry_async_when(|_| self.fetch_json(&url, &[]), ChainError::is_transient)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_server_errors_are_transient() {
        assert!(ChainError::Status {
            status: 503,
            message: "overloaded".to_string()
        }
        .is_transient());
        assert!(!ChainError::Status {
            status: 404,
            message: "no".to_string()
        }
        .is_transient());
        assert!(!ChainError::NotFound("0xabc".to_string()).is_transient());
        assert!(!ChainError::VersionNotFound(7).is_transient());
    }
}
