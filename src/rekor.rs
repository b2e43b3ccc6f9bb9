use crate::record::{InclusionProof, TlogEntry};
use crate::verifiers::tlog::TransparencyLogClient;
use crate::{Result, VerifyError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const REKOR_URL: &str = "https://rekor.sigstore.dev";
const USER_AGENT_VALUE: &str = concat!("sigstore-verdict/", env!("CARGO_PKG_VERSION"));

/// Client for the Rekor transparency log REST API.
#[derive(Debug, Clone)]
pub struct RekorClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct SearchIndex {
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry {
    body: String,
    integrated_time: i64,
    #[serde(rename = "logID")]
    log_id: String,
    log_index: i64,
    #[serde(default)]
    verification: Option<Verification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Verification {
    #[serde(default)]
    signed_entry_timestamp: Option<String>,
    #[serde(default)]
    inclusion_proof: Option<Proof>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Proof {
    log_index: u64,
    tree_size: u64,
    root_hash: String,
    #[serde(default)]
    hashes: Vec<String>,
    #[serde(default)]
    checkpoint: Option<String>,
}

impl RekorClient {
    pub fn new(base_url: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.unwrap_or(REKOR_URL).trim_end_matches('/').to_string(),
        })
    }

    /// UUIDs of the entries recorded for `sha256:<hex>`.
    async fn search(&self, digest: &[u8; 32]) -> Result<Vec<String>> {
        let url = format!("{}/api/v1/index/retrieve", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&SearchIndex {
                hash: format!("sha256:{}", hex::encode(digest)),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(VerifyError::Transport(format!(
                "Rekor search returned {}: {}",
                status, body
            )));
        }

        Ok(response.json().await?)
    }

    async fn entry(&self, uuid: &str) -> Result<Option<TlogEntry>> {
        let url = format!("{}/api/v1/log/entries/{}", self.base_url, uuid);
        let response = self.client.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(VerifyError::Transport(format!(
                "Rekor returned {} for entry {}: {}",
                status, uuid, body
            )));
        }

        let entries: HashMap<String, LogEntry> = response.json().await?;
        entries.into_values().next().map(into_tlog_entry).transpose()
    }
}

fn malformed(what: &str, e: impl std::fmt::Display) -> VerifyError {
    VerifyError::TlogVerification(format!("Malformed {} in Rekor response: {}", what, e))
}

fn into_tlog_entry(entry: LogEntry) -> Result<TlogEntry> {
    let body = BASE64.decode(&entry.body).map_err(|e| malformed("body", e))?;
    let verification = entry.verification.unwrap_or(Verification {
        signed_entry_timestamp: None,
        inclusion_proof: None,
    });

    let signed_entry_timestamp = verification
        .signed_entry_timestamp
        .map(|set| BASE64.decode(set).map_err(|e| malformed("signed entry timestamp", e)))
        .transpose()?;

    let inclusion_proof = verification
        .inclusion_proof
        .map(|proof| -> Result<InclusionProof> {
            Ok(InclusionProof {
                log_index: proof.log_index,
                tree_size: proof.tree_size,
                root_hash: hex::decode(&proof.root_hash).map_err(|e| malformed("root hash", e))?,
                hashes: proof
                    .hashes
                    .iter()
                    .map(|h| hex::decode(h).map_err(|e| malformed("proof hash", e)))
                    .collect::<Result<_>>()?,
                checkpoint: proof.checkpoint,
            })
        })
        .transpose()?;

    Ok(TlogEntry {
        body,
        integrated_time: entry.integrated_time,
        log_index: entry.log_index,
        log_id: entry.log_id,
        signed_entry_timestamp,
        inclusion_proof,
    })
}

#[async_trait]
impl TransparencyLogClient for RekorClient {
    async fn lookup_entry(&self, payload_sha256: &[u8; 32]) -> Result<Option<TlogEntry>> {
        let uuids = self.search(payload_sha256).await?;
        debug!("Rekor returned {} candidate entries", uuids.len());

        for uuid in uuids {
            if let Some(entry) = self.entry(&uuid).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}
