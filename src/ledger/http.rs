//! HTTP relay to an external custody service.
//!
//! Every instruction is a JSON `POST` carrying the idempotency key, so the
//! custody service can deduplicate retries:
//!
//! ```text
//! POST {endpoint}/escrow          { key, party, amount }
//! POST {endpoint}/yield/deposit   { key, amount }
//! POST {endpoint}/yield/withdraw  { key, amount }
//! POST {endpoint}/payout          { key, party, amount }
//! POST {endpoint}/premium         { key, party, amount }
//! POST {endpoint}/coverage        { key, party, amount }
//! GET  {endpoint}/transactions/{tx_id}
//! ```
//!
//! Amounts travel as decimal wei strings. Auth: `Authorization: Bearer {key}`
//! when an API key is configured.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{IdempotencyKey, LedgerGateway, LedgerReceipt, TxId, TxStatus, YieldWithdrawal};
use crate::types::{Address, LedgerError, Wei};

const BACKEND_NAME: &str = "http";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct InstructionRequest<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    party: Option<&'a Address>,
    amount: Wei,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireStatus {
    Confirmed,
    Pending,
    Failed,
}

#[derive(Debug, Deserialize)]
struct ReceiptResponse {
    tx_id: String,
    status: WireStatus,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    fee: Wei,
}

#[derive(Debug, Deserialize)]
struct WithdrawalResponse {
    #[serde(flatten)]
    receipt: ReceiptResponse,
    principal: Wei,
    #[serde(default)]
    yield_earned: Wei,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: WireStatus,
    #[serde(default)]
    reason: Option<String>,
}

fn to_status(status: WireStatus, reason: Option<String>) -> TxStatus {
    match status {
        WireStatus::Confirmed => TxStatus::Confirmed,
        WireStatus::Pending => TxStatus::Pending,
        WireStatus::Failed => TxStatus::Failed(reason.unwrap_or_else(|| "unspecified".into())),
    }
}

impl From<ReceiptResponse> for LedgerReceipt {
    fn from(r: ReceiptResponse) -> Self {
        LedgerReceipt {
            tx_id: TxId(r.tx_id),
            status: to_status(r.status, r.reason),
            fee: r.fee,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Ledger gateway that forwards custody instructions over HTTP.
pub struct HttpLedgerGateway {
    http: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpLedgerGateway {
    pub fn new(endpoint: &str, api_key: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("WAGER/", env!("CARGO_PKG_VERSION"), " (ledger-gateway)"))
            .build()
            .context("Failed to build HTTP client for ledger gateway")?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    // -- Internal helpers ------------------------------------------------

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key.expose_secret()),
            None => req,
        }
    }

    /// Network errors and 5xx/429 are worth retrying; other 4xx are final.
    async fn check(resp: Response, path: &str) -> Result<Response, LedgerError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            warn!(path, %status, "Ledger service unavailable");
            Err(LedgerError::Transient(format!("{path}: {status}: {body}")))
        } else {
            Err(LedgerError::Rejected(format!("{path}: {status}: {body}")))
        }
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        key: &IdempotencyKey,
        party: Option<&Address>,
        amount: Wei,
    ) -> Result<T, LedgerError> {
        let url = format!("{}{path}", self.endpoint);
        let body = InstructionRequest {
            key: &key.0,
            party,
            amount,
        };

        debug!(url = %url, key = %key, amount = %amount, "Submitting ledger instruction");

        let resp = self
            .authorize(self.http.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| LedgerError::Transient(format!("{path}: {e}")))?;
        let resp = Self::check(resp, path).await?;

        // The instruction may have landed; a retry with the same key is safe.
        resp.json::<T>()
            .await
            .map_err(|e| LedgerError::Transient(format!("{path}: malformed response: {e}")))
    }

    async fn receipt(
        &self,
        path: &str,
        key: &IdempotencyKey,
        party: Option<&Address>,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.post::<ReceiptResponse>(path, key, party, amount)
            .await
            .map(LedgerReceipt::from)
    }
}

#[async_trait]
impl LedgerGateway for HttpLedgerGateway {
    async fn escrow(
        &self,
        key: &IdempotencyKey,
        party: &Address,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.receipt("/escrow", key, Some(party), amount).await
    }

    async fn deposit_to_yield(
        &self,
        key: &IdempotencyKey,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.receipt("/yield/deposit", key, None, amount).await
    }

    async fn withdraw_from_yield(
        &self,
        key: &IdempotencyKey,
        amount: Wei,
    ) -> Result<YieldWithdrawal, LedgerError> {
        let resp: WithdrawalResponse = self.post("/yield/withdraw", key, None, amount).await?;
        Ok(YieldWithdrawal {
            receipt: resp.receipt.into(),
            principal: resp.principal,
            yield_earned: resp.yield_earned,
        })
    }

    async fn payout(
        &self,
        key: &IdempotencyKey,
        party: &Address,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.receipt("/payout", key, Some(party), amount).await
    }

    async fn charge_premium(
        &self,
        key: &IdempotencyKey,
        party: &Address,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.receipt("/premium", key, Some(party), amount).await
    }

    async fn pay_coverage(
        &self,
        key: &IdempotencyKey,
        party: &Address,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.receipt("/coverage", key, Some(party), amount).await
    }

    async fn transaction_status(&self, tx_id: &TxId) -> Result<TxStatus, LedgerError> {
        let path = format!("/transactions/{}", urlencoding::encode(&tx_id.0));
        let url = format!("{}{path}", self.endpoint);

        let resp = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .map_err(|e| LedgerError::Transient(format!("{path}: {e}")))?;
        let resp = Self::check(resp, &path).await?;

        let body: StatusResponse = resp
            .json()
            .await
            .map_err(|e| LedgerError::Transient(format!("{path}: malformed response: {e}")))?;
        Ok(to_status(body.status, body.reason))
    }

    fn name(&self) -> &str {
        BACKEND_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
