use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::core::Document;
use crate::error::{StoreError, StoreResult};
use crate::remote::stream::{
    parse_sync_stream, StreamDocEntry, SyncStreamWriter, SYNC_STREAM_CONTENT_TYPE,
};
use crate::sync::target::{ReturnDocFn, SyncInfo, SyncTarget};

#[derive(Debug, Deserialize)]
struct SyncInfoWire {
    target_replica_uid: String,
    target_replica_generation: u64,
    source_replica_generation: u64,
    source_transaction_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorWire {
    error: String,
    message: Option<String>,
}

/// `SyncTarget` implementation against a remote database served over HTTP.
/// The URL names the database, e.g. `http://host:port/mydb`.
pub struct HttpSyncTarget {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSyncTarget {
    pub fn connect(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: url.trim_end_matches('/').to_string(),
        }
    }

    fn sync_url(&self, source_replica_uid: &str) -> String {
        format!("{}/sync-from/{}", self.base_url, source_replica_uid)
    }

    /// Map a non-success response back to the typed error it carries.
    async fn error_from_response(response: reqwest::Response) -> StoreError {
        let status = response.status().as_u16();
        match response.json::<ErrorWire>().await {
            Ok(wire) => StoreError::from_wire(status, &wire.error, wire.message.as_deref()),
            Err(_) => StoreError::Http {
                status,
                body: String::new(),
            },
        }
    }

    async fn check(response: reqwest::Response) -> StoreResult<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::error_from_response(response).await)
        }
    }
}

#[async_trait]
impl SyncTarget for HttpSyncTarget {
    async fn get_sync_info(&self, source_replica_uid: &str) -> StoreResult<SyncInfo> {
        let response = self
            .client
            .get(self.sync_url(source_replica_uid))
            .send()
            .await
            .map_err(|_| StoreError::Unavailable)?;
        let wire: SyncInfoWire = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::InvalidJson(e.to_string()))?;
        Ok(SyncInfo {
            target_replica_uid: wire.target_replica_uid,
            target_generation: wire.target_replica_generation,
            source_generation: wire.source_replica_generation,
            source_transaction_id: wire.source_transaction_id,
        })
    }

    async fn record_sync_info(
        &self,
        source_replica_uid: &str,
        source_generation: u64,
        source_transaction_id: &str,
    ) -> StoreResult<()> {
        let response = self
            .client
            .put(self.sync_url(source_replica_uid))
            .json(&json!({
                "generation": source_generation,
                "transaction_id": source_transaction_id,
            }))
            .send()
            .await
            .map_err(|_| StoreError::Unavailable)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn sync_exchange(
        &self,
        docs_by_generation: Vec<(Document, u64, String)>,
        source_replica_uid: &str,
        last_known_generation: u64,
        return_doc_cb: ReturnDocFn<'_>,
    ) -> StoreResult<(u64, String)> {
        let mut writer = SyncStreamWriter::new();
        writer.entry(&json!({"last_known_generation": last_known_generation}))?;
        for (doc, generation, trans_id) in &docs_by_generation {
            writer.entry(&StreamDocEntry::from_doc(doc, *generation, trans_id))?;
        }
        let response = self
            .client
            .post(self.sync_url(source_replica_uid))
            .header(reqwest::header::CONTENT_TYPE, SYNC_STREAM_CONTENT_TYPE)
            .body(writer.finish())
            .send()
            .await
            .map_err(|e| StoreError::BrokenSyncStream(e.to_string()))?;
        let response = Self::check(response).await?;
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::BrokenSyncStream(e.to_string()))?;
        let header = parse_sync_stream(&body, |entry| {
            let generation = entry.gen;
            let trans_id = entry.trans_id.clone();
            return_doc_cb(entry.into_doc(), generation, trans_id)
        })?;
        let new_generation = header
            .get("new_generation")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| StoreError::BrokenSyncStream("header missing new_generation".into()))?;
        let new_transaction_id = header
            .get("new_transaction_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                StoreError::BrokenSyncStream("header missing new_transaction_id".into())
            })?
            .to_string();
        Ok((new_generation, new_transaction_id))
    }
}

/// Convenience wrapper: synchronize a local database with a database
/// served at `url`. Returns the remote generation after the exchange.
pub async fn sync_db_with_url(
    db: &crate::sync::target::SharedDatabase,
    url: &str,
) -> StoreResult<u64> {
    let target = HttpSyncTarget::connect(url);
    let mut synchronizer = crate::sync::Synchronizer::new(std::sync::Arc::clone(db), target);
    synchronizer.sync().await
}
