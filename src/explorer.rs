//! Block explorer client (Etherscan v2 multichain API).
//!
//! Fetches the most recent 100 records of one kind for an address and turns
//! the explorer's `{status, message, result}` envelope into a record list or a
//! [`FetchError`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::address::Address;
use crate::error::{FetchError, FetchFailure};
use crate::records::{ActivityRecord, RecordKind};

/// Default explorer endpoint.
pub const DEFAULT_API_URL: &str = "https://api.etherscan.io/v2/api";

/// Base mainnet chain id.
pub const BASE_CHAIN_ID: u64 = 8453;

/// Records requested per query.
pub const PAGE_SIZE: u32 = 100;

const END_BLOCK: u64 = 99_999_999;

/// Source of on-chain activity records.
#[async_trait]
pub trait ExplorerProvider: Send + Sync + 'static {
    /// Fetch the most recent records of `kind` for `address`.
    ///
    /// An address with no activity yields an empty list, not an error.
    async fn fetch(
        &self,
        kind: RecordKind,
        address: &Address,
    ) -> std::result::Result<Vec<ActivityRecord>, FetchError>;
}

/// Explorer client configuration.
#[derive(Debug, Clone)]
pub struct ExplorerConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub chain_id: u64,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Extra attempts after a retryable failure.
    pub max_retries: u32,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            chain_id: BASE_CHAIN_ID,
            timeout: Duration::from_secs(10),
            max_retries: 1,
        }
    }
}

/// HTTP client for the explorer API.
pub struct ExplorerClient {
    cfg: ExplorerConfig,
    client: reqwest::Client,
}

impl ExplorerClient {
    pub fn new(cfg: ExplorerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .wrap_err("failed to build explorer HTTP client")?;
        Ok(Self { cfg, client })
    }

    pub fn has_api_key(&self) -> bool {
        self.cfg.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    fn query(&self, kind: RecordKind, address: &Address) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("chainid", self.cfg.chain_id.to_string()),
            ("module", "account".to_string()),
            ("action", kind.action().to_string()),
            ("address", address.to_string()),
            ("startblock", "0".to_string()),
            ("endblock", END_BLOCK.to_string()),
            ("page", "1".to_string()),
            ("offset", PAGE_SIZE.to_string()),
            ("sort", "desc".to_string()),
        ];
        if let Some(key) = self.cfg.api_key.as_deref().filter(|k| !k.is_empty()) {
            params.push(("apikey", key.to_string()));
        }
        params
    }

    async fn fetch_once(
        &self,
        kind: RecordKind,
        address: &Address,
    ) -> std::result::Result<Vec<ActivityRecord>, FetchFailure> {
        let timeout_ms = self.cfg.timeout.as_millis() as u64;
        let resp = self
            .client
            .get(&self.cfg.api_url)
            .query(&self.query(kind, address))
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout_ms))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchFailure::HttpStatus(status.as_u16()));
        }

        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| map_reqwest_error(e, timeout_ms))?;
        parse_envelope(kind, envelope)
    }
}

#[async_trait]
impl ExplorerProvider for ExplorerClient {
    async fn fetch(
        &self,
        kind: RecordKind,
        address: &Address,
    ) -> std::result::Result<Vec<ActivityRecord>, FetchError> {
        let attempts = self.cfg.max_retries + 1;
        let mut attempt = 1;
        loop {
            let start = Instant::now();
            let result = self.fetch_once(kind, address).await;
            crate::metrics::record_upstream_call(
                kind.action(),
                result.is_ok(),
                start.elapsed().as_millis() as u64,
            );

            match result {
                Ok(records) => {
                    debug!(%address, action = kind.action(), count = records.len(), "explorer fetch ok");
                    return Ok(records);
                }
                Err(failure) if attempt < attempts && failure.is_retryable() => {
                    let delay_ms = backoff_delay_ms(attempt);
                    warn!(%address, action = kind.action(), attempt, delay_ms, error = %failure, "explorer fetch failed, retrying");
                    sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(failure) => {
                    warn!(%address, action = kind.action(), attempt, error = %failure, "explorer fetch failed");
                    return Err(FetchError::new(kind, failure));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Response handling
// ---------------------------------------------------------------------------

/// Explorer response envelope. `status` is "1" on success, "0" otherwise.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: serde_json::Value,
}

fn parse_envelope(
    kind: RecordKind,
    envelope: Envelope,
) -> std::result::Result<Vec<ActivityRecord>, FetchFailure> {
    match envelope.result {
        serde_json::Value::Array(items) if envelope.status == "1" || items.is_empty() => items
            .into_iter()
            .map(|item| ActivityRecord::decode(kind, item))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| FetchFailure::Decode(e.to_string())),
        _ if is_no_records(&envelope.message) => Ok(Vec::new()),
        serde_json::Value::String(detail) if is_rate_limited(&detail) => {
            Err(FetchFailure::RateLimited(detail))
        }
        _ if is_rate_limited(&envelope.message) => Err(FetchFailure::RateLimited(envelope.message)),
        serde_json::Value::String(detail) if !detail.is_empty() => {
            Err(FetchFailure::Upstream(format!("{}: {}", envelope.message, detail)))
        }
        _ if envelope.status == "1" => Err(FetchFailure::Decode(
            "success response without a result list".to_string(),
        )),
        _ => Err(FetchFailure::Upstream(if envelope.message.is_empty() {
            "unknown explorer error".to_string()
        } else {
            envelope.message
        })),
    }
}

fn is_no_records(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.starts_with("no transactions found") || message.starts_with("no records found")
}

/// Throttling replies arrive as HTTP 200 with a `NOTOK` envelope, e.g.
/// "Max calls per sec rate limit reached (5/sec)".
fn is_rate_limited(text: &str) -> bool {
    text.to_ascii_lowercase().contains("rate limit")
}

fn map_reqwest_error(err: reqwest::Error, timeout_ms: u64) -> FetchFailure {
    if err.is_timeout() {
        return FetchFailure::Timeout(timeout_ms);
    }
    if err.is_decode() || err.is_body() {
        return FetchFailure::Decode(err.to_string());
    }
    FetchFailure::Transport(err.to_string())
}

/// Exponential backoff: 100ms, 200ms, 400ms, ... capped at 2s.
fn backoff_delay_ms(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1);
    100u64.saturating_mul(2u64.saturating_pow(exp)).min(2_000)
}
