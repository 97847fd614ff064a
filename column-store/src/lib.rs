//! Analytical store adapter over the ClickHouse HTTP interface.
//!
//! Owns the two append-only tracking tables that drive idempotent
//! ingestion: `ingested_files` (archive names) and `ingested_versions`
//! (single versions).

use std::collections::BTreeSet;
use std::path::Path;

use core_types::config::ColumnStoreConfig;
use core_types::types::Version;
use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ColumnStoreError {
    #[error("store returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad row: {0}")]
    BadRow(#[from] serde_json::Error),
}

pub struct ColumnStore {
    http: reqwest::Client,
    url: String,
    database: String,
    user: String,
    password: String,
}

impl ColumnStore {
    pub fn new(config: &ColumnStoreConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: config.url.clone(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        }
    }

    fn request(&self, sql: &str) -> reqwest::RequestBuilder {
        self.http
            .post(&self.url)
            .query(&[("database", self.database.as_str()), ("query", sql)])
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
    }

    async fn check(res: reqwest::Response) -> Result<reqwest::Response, ColumnStoreError> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        Err(ColumnStoreError::Status { status, body })
    }

    /// Run a statement with no result set.
    pub async fn command(&self, sql: &str) -> Result<(), ColumnStoreError> {
        let res = self.request(sql).send().await?;
        Self::check(res).await?;
        Ok(())
    }

    /// Run a SELECT and decode each `JSONEachRow` line.
    pub async fn query_rows<T: DeserializeOwned>(
        &self,
        sql: &str,
    ) -> Result<Vec<T>, ColumnStoreError> {
        let sql = format!("{sql} FORMAT JSONEachRow");
        let res = self.request(&sql).send().await?;
        let body = Self::check(res).await?.text().await?;
        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ColumnStoreError::from))
            .collect()
    }

    /// Insert rows as `JSONEachRow` into `table`.
    pub async fn insert_rows(
        &self,
        table: &str,
        rows: &[serde_json::Value],
    ) -> Result<(), ColumnStoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for row in rows {
            body.push_str(&row.to_string());
            body.push('\n');
        }
        let sql = format!("INSERT INTO \"{table}\" FORMAT JSONEachRow");
        let res = self.request(&sql).body(body).send().await?;
        Self::check(res).await?;
        Ok(())
    }

    /// Stream one columnar file into `table`.
    pub async fn insert_parquet_file(
        &self,
        table: &str,
        path: &Path,
    ) -> Result<(), ColumnStoreError> {
        debug!("loading {} into {table}", path.display());
        let bytes = tokio::fs::read(path).await?;
        let sql = format!("INSERT INTO \"{table}\" FORMAT Parquet");
        let res = self.request(&sql).body(bytes).send().await?;
        Self::check(res).await?;
        Ok(())
    }

    /// Archive names already loaded, deduplicated.
    pub async fn ingested_files(&self) -> Result<BTreeSet<String>, ColumnStoreError> {
        #[derive(Deserialize)]
        struct Row {
            name: String,
        }
        let rows: Vec<Row> = self
            .query_rows("SELECT DISTINCT \"name\" FROM \"ingested_files\"")
            .await?;
        Ok(rows.into_iter().map(|row| row.name).collect())
    }

    pub async fn record_ingested_file(&self, name: &str) -> Result<(), ColumnStoreError> {
        self.insert_rows("ingested_files", &[serde_json::json!({ "name": name })])
            .await
    }

    /// Sorted distinct versions above `after` recorded as ingested.
    pub async fn ingested_versions(
        &self,
        after: Option<Version>,
    ) -> Result<Vec<Version>, ColumnStoreError> {
        #[derive(Deserialize)]
        struct Row {
            version: u64,
        }
        let sql = match after {
            Some(after) => format!(
                "SELECT DISTINCT \"version\" FROM \"ingested_versions\" \
                 WHERE \"version\" > {after} ORDER BY \"version\""
            ),
            None => "SELECT DISTINCT \"version\" FROM \"ingested_versions\" ORDER BY \"version\""
                .to_string(),
        };
        let rows: Vec<Row> = self.query_rows(&sql).await?;
        Ok(rows.into_iter().map(|row| row.version).collect())
    }

    pub async fn record_ingested_version(&self, version: Version) -> Result<(), ColumnStoreError> {
        self.insert_rows(
            "ingested_versions",
            &[serde_json::json!({ "version": version })],
        )
        .await
    }

    /// Highest version covered by any loaded batch archive, parsed from the
    /// `"{from}-{to}/..."` names in `ingested_files`. `None` when nothing
    /// batch-shaped has been loaded yet.
    pub async fn last_batch_ingested_version(
        &self,
    ) -> Result<Option<Version>, ColumnStoreError> {
        let files = self.ingested_files().await?;
        Ok(last_batch_version(files.iter().map(String::as_str)))
    }
}

/// Max `to` across names shaped like `"{from}-{to}/{file}"`.
pub fn last_batch_version<'a>(names: impl Iterator<Item = &'a str>) -> Option<Version> {
    names
        .filter_map(|name| {
            let range = name.split('/').next()?;
            let to = range.split('-').nth(1)?;
            to.parse::<Version>().ok()
        })
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_batch_version_parses_range_labels() {
        let names = [
            "0-9900/user_transaction.parquet.tar.gz",
            "10000-19900/event.parquet.tar.gz",
            "10000-19900/user_transaction.parquet.tar.gz",
        ];
        assert_eq!(last_batch_version(names.iter().copied()), Some(19_900));
    }

    #[test]
    fn last_batch_version_ignores_malformed_names() {
        let names = ["garbage", "also/garbage", "1-x/file"];
        assert_eq!(last_batch_version(names.iter().copied()), None);
        assert_eq!(last_batch_version(std::iter::empty::<&str>()), None);
    }
}
