//! API route handlers.
//!
//! All endpoints return JSON. Amounts cross this boundary as decimal ETH
//! strings and are converted to wei here. The caller's identity comes
//! from the `x-wallet-address` header.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::engine::{LifecycleEngine, OperationRecord, Outcome};
use crate::storage::MetadataStore;
use crate::types::{
    Address, Bet, BetError, BetId, BetMetadata, BetStatus, Caller, ErrorKind, OperationStatus,
    ResolutionCause, Wei,
};

/// Header carrying the authenticated wallet address.
pub const CALLER_HEADER: &str = "x-wallet-address";

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct ApiState {
    pub engine: Arc<LifecycleEngine>,
    pub metadata: Arc<MetadataStore>,
    /// Title/terms of proposals still waiting on the ledger, by operation id.
    pending_metadata: Mutex<HashMap<Uuid, BetMetadata>>,
}

impl ApiState {
    pub fn new(engine: Arc<LifecycleEngine>, metadata: Arc<MetadataStore>) -> Self {
        Self {
            engine,
            metadata,
            pending_metadata: Mutex::new(HashMap::new()),
        }
    }

    fn park_metadata(&self, operation_id: Uuid, metadata: BetMetadata) {
        self.pending_metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation_id, metadata);
    }

    /// Move the title and terms of proposals that have since committed into
    /// the store. Entries for proposals that failed, or whose record is no
    /// longer kept, are dropped.
    pub fn settle_metadata(&self) {
        let mut pending = self.pending_metadata.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|operation_id, metadata| match self.engine.operation(*operation_id) {
            Ok(record) => match (record.status, record.bet_id) {
                (OperationStatus::Confirmed, Some(bet_id)) => {
                    self.metadata.put(bet_id, metadata.clone());
                    false
                }
                (OperationStatus::Pending | OperationStatus::NeedsReconciliation, _) => true,
                _ => false,
            },
            Err(_) => false,
        });
    }

    #[cfg(test)]
    pub(crate) fn pending_metadata_len(&self) -> usize {
        self.pending_metadata.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub type AppState = Arc<ApiState>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    Bet(BetError),
    BadRequest(String),
}

impl From<BetError> for ApiError {
    fn from(e: BetError) -> Self {
        ApiError::Bet(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorKind::Validation, msg),
            ApiError::Bet(e) => {
                let kind = e.kind();
                let status = match (&e, kind) {
                    (BetError::Unauthenticated, _) => StatusCode::UNAUTHORIZED,
                    (_, ErrorKind::Validation) => StatusCode::BAD_REQUEST,
                    (_, ErrorKind::Authorization) => StatusCode::FORBIDDEN,
                    (_, ErrorKind::Conflict) => StatusCode::CONFLICT,
                    (_, ErrorKind::Ledger) => StatusCode::BAD_GATEWAY,
                    (_, ErrorKind::NotFound) => StatusCode::NOT_FOUND,
                };
                (status, kind, e.to_string())
            }
        };
        if status.is_server_error() {
            warn!(%status, error = %message, "Request failed");
        } else {
            debug!(%status, error = %message, "Request rejected");
        }
        (status, Json(json!({ "error": message, "kind": kind }))).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateBetRequest {
    pub stake_amount: String,
    #[serde(default)]
    pub insurance_opted: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub terms: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinRequest {
    #[serde(default)]
    pub insurance_opted: bool,
    /// Optional; must equal the bet's stake when given.
    #[serde(default)]
    pub stake_amount: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub claimed_winner: String,
}

#[derive(Debug, Deserialize)]
pub struct ArbitrateRequest {
    pub winner: String,
}

/// `GET /api/bets` filters. Both are optional and combine.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Lifecycle status, any case ("proposed", "Matched").
    #[serde(default)]
    pub status: Option<String>,
    /// Words that must all appear in the bet's title.
    #[serde(default)]
    pub q: Option<String>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BetSummary {
    pub bet_id: BetId,
    pub status: BetStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmResponse {
    pub bet_id: BetId,
    pub status: BetStatus,
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimResponse {
    pub bet_id: BetId,
    pub payout_amount: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingResponse {
    pub operation_id: Uuid,
    pub bet_id: Option<BetId>,
    pub status: OperationStatus,
    pub tx_id: Option<String>,
}

impl From<OperationRecord> for PendingResponse {
    fn from(r: OperationRecord) -> Self {
        Self {
            operation_id: r.operation_id,
            bet_id: r.bet_id,
            status: r.status,
            tx_id: r.awaiting.map(|t| t.0),
        }
    }
}

/// A bet as rendered to clients: money in ETH, plus title and terms.
#[derive(Debug, Clone, Serialize)]
pub struct BetView {
    pub id: BetId,
    pub creator: Address,
    pub participant: Option<Address>,
    pub stake_amount: String,
    pub status: BetStatus,
    pub creator_insurance_opted: bool,
    pub participant_insurance_opted: bool,
    pub creator_confirmed_winner: Option<Address>,
    pub participant_confirmed_winner: Option<Address>,
    pub winner: Option<Address>,
    pub resolution: Option<ResolutionCause>,
    pub insurance_claimed: bool,
    pub escrow_balance: String,
    pub yield_deposited: bool,
    pub yield_earned: String,
    pub created_at: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub disputed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub terms: Option<String>,
}

impl BetView {
    pub fn new(bet: Bet, metadata: Option<BetMetadata>) -> Self {
        let (title, terms) = match metadata {
            Some(m) => (Some(m.title), Some(m.terms)),
            None => (None, None),
        };
        Self {
            id: bet.id,
            creator: bet.creator,
            participant: bet.participant,
            stake_amount: bet.stake_amount.to_eth_string(),
            status: bet.status,
            creator_insurance_opted: bet.creator_insurance_opted,
            participant_insurance_opted: bet.participant_insurance_opted,
            creator_confirmed_winner: bet.creator_confirmed_winner,
            participant_confirmed_winner: bet.participant_confirmed_winner,
            winner: bet.winner,
            resolution: bet.resolution,
            insurance_claimed: bet.insurance_claimed,
            escrow_balance: bet.escrow_balance.to_eth_string(),
            yield_deposited: bet.yield_deposited,
            yield_earned: bet.yield_earned.to_eth_string(),
            created_at: bet.created_at,
            matched_at: bet.matched_at,
            disputed_at: bet.disputed_at,
            resolved_at: bet.resolved_at,
            cancelled_at: bet.cancelled_at,
            title,
            terms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationView {
    pub operation_id: Uuid,
    pub bet_id: Option<BetId>,
    pub action: &'static str,
    pub status: OperationStatus,
    pub tx_id: Option<String>,
    pub error: Option<String>,
    pub bet: Option<BetView>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn caller_from(headers: &HeaderMap) -> Result<Caller, ApiError> {
    match headers.get(CALLER_HEADER) {
        None => Ok(Caller::anonymous()),
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| BetError::InvalidAddress("non-ASCII header".into()))?;
            Ok(Caller::new(Address::parse(raw)?))
        }
    }
}

fn bet_id_from(raw: &str) -> Result<BetId, ApiError> {
    Ok(raw.parse::<BetId>()?)
}

fn status_from(raw: &str) -> Result<BetStatus, ApiError> {
    [
        BetStatus::Proposed,
        BetStatus::Matched,
        BetStatus::Disputed,
        BetStatus::Resolved,
        BetStatus::Cancelled,
    ]
    .into_iter()
    .find(|s| s.to_string().eq_ignore_ascii_case(raw.trim()))
    .ok_or_else(|| ApiError::BadRequest(format!("Unknown bet status: {raw}")))
}

fn pending(record: OperationRecord) -> Response {
    (StatusCode::ACCEPTED, Json(PendingResponse::from(record))).into_response()
}

fn summary(bet: &Bet) -> Response {
    Json(BetSummary {
        bet_id: bet.id,
        status: bet.status,
    })
    .into_response()
}

fn respond(outcome: Outcome<Bet>) -> Response {
    match outcome {
        Outcome::Confirmed(bet) => summary(&bet),
        Outcome::Pending(record) => pending(record),
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// POST /api/bets
pub async fn create_bet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateBetRequest>,
) -> ApiResult {
    let caller = caller_from(&headers)?;
    let stake = Wei::from_eth_str(&req.stake_amount)?;
    let metadata = BetMetadata {
        title: req.title,
        terms: req.terms,
    };

    match state.engine.propose(&caller, stake, req.insurance_opted).await? {
        Outcome::Confirmed(bet) => {
            state.metadata.put(bet.id, metadata);
            Ok(summary(&bet))
        }
        Outcome::Pending(record) => {
            state.park_metadata(record.operation_id, metadata);
            Ok(pending(record))
        }
    }
}

/// POST /api/bets/:id/join
pub async fn join_bet(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<JoinRequest>>,
) -> ApiResult {
    let caller = caller_from(&headers)?;
    let bet_id = bet_id_from(&id)?;
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let posted = match &req.stake_amount {
        Some(s) => Some(Wei::from_eth_str(s)?),
        None => None,
    };

    let outcome = state
        .engine
        .join(&caller, bet_id, req.insurance_opted, posted)
        .await?;
    Ok(respond(outcome))
}

/// POST /api/bets/:id/confirm
pub async fn confirm_winner(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ConfirmRequest>,
) -> ApiResult {
    let caller = caller_from(&headers)?;
    let bet_id = bet_id_from(&id)?;
    let winner = Address::parse(&req.claimed_winner)?;

    match state.engine.confirm(&caller, bet_id, &winner).await? {
        Outcome::Confirmed(bet) => Ok(Json(ConfirmResponse {
            bet_id: bet.id,
            status: bet.status,
            resolved: bet.status == BetStatus::Resolved,
        })
        .into_response()),
        Outcome::Pending(record) => Ok(pending(record)),
    }
}

/// POST /api/bets/:id/dispute
pub async fn raise_dispute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    let caller = caller_from(&headers)?;
    let bet_id = bet_id_from(&id)?;
    let bet = state.engine.raise_dispute(&caller, bet_id).await?;
    Ok(summary(&bet))
}

/// POST /api/bets/:id/arbitrate
pub async fn arbitrate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ArbitrateRequest>,
) -> ApiResult {
    let caller = caller_from(&headers)?;
    let bet_id = bet_id_from(&id)?;
    let winner = Address::parse(&req.winner)?;
    let outcome = state.engine.arbitrate(&caller, bet_id, &winner).await?;
    Ok(respond(outcome))
}

/// POST /api/bets/:id/cancel
pub async fn cancel_bet(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    let caller = caller_from(&headers)?;
    let bet_id = bet_id_from(&id)?;
    let outcome = state.engine.cancel(&caller, bet_id).await?;
    Ok(respond(outcome))
}

/// POST /api/bets/:id/claim-insurance
pub async fn claim_insurance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    let caller = caller_from(&headers)?;
    let bet_id = bet_id_from(&id)?;

    match state.engine.claim_insurance(&caller, bet_id).await? {
        Outcome::Confirmed(claim) => Ok(Json(ClaimResponse {
            bet_id: claim.bet.id,
            payout_amount: claim.payout.to_eth_string(),
        })
        .into_response()),
        Outcome::Pending(record) => Ok(pending(record)),
    }
}

/// GET /api/bets/:id
pub async fn get_bet(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let bet_id = bet_id_from(&id)?;
    let bet = state.engine.get(bet_id).await?;
    state.settle_metadata();
    let metadata = state.metadata.get(bet_id);
    Ok(Json(BetView::new(bet, metadata)).into_response())
}

/// GET /api/bets?status=&q=
pub async fn list_bets(State(state): State<AppState>, Query(query): Query<ListQuery>) -> ApiResult {
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(status_from(raw)?),
    };
    let words = query.q.unwrap_or_default();

    state.settle_metadata();
    let bets = state.engine.list().await;
    let views: Vec<BetView> = bets
        .into_iter()
        .filter(|bet| status.map_or(true, |s| bet.status == s))
        .filter(|bet| state.metadata.title_matches(bet.id, &words))
        .map(|bet| {
            let metadata = state.metadata.get(bet.id);
            BetView::new(bet, metadata)
        })
        .collect();
    debug!(results = views.len(), status = ?status, q = %words, "Listed bets");
    Ok(Json(views).into_response())
}

/// GET /api/operations/:op_id
///
/// Drives a parked operation forward and reports where it stands.
pub async fn get_operation(State(state): State<AppState>, Path(op_id): Path<String>) -> ApiResult {
    let operation_id = Uuid::parse_str(op_id.trim())
        .map_err(|_| ApiError::BadRequest(format!("Invalid operation id: {op_id}")))?;
    let record = state.engine.resume(operation_id).await?;
    state.settle_metadata();

    let status = match record.status {
        OperationStatus::Pending => StatusCode::ACCEPTED,
        OperationStatus::Confirmed
        | OperationStatus::Failed
        | OperationStatus::NeedsReconciliation => StatusCode::OK,
    };
    let bet = record.bet.map(|b| {
        let metadata = state.metadata.get(b.id);
        BetView::new(b, metadata)
    });
    let view = OperationView {
        operation_id: record.operation_id,
        bet_id: record.bet_id,
        action: record.action,
        status: record.status,
        tx_id: record.awaiting.map(|t| t.0),
        error: record.error,
        bet,
    };
    Ok((status, Json(view)).into_response())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
