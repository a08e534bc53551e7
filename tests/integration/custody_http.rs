//! The engine driving a custody service over HTTP.
//!
//! The custody service here is a small axum app that fronts a
//! `SimulatedLedger`, so balances can be checked after each scenario.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_err;

use wager::ledger::http::HttpLedgerGateway;
use wager::ledger::simulated::{LedgerOp, SimulatedLedger, SimulatedLedgerConfig};
use wager::ledger::{IdempotencyKey, LedgerGateway, LedgerReceipt, TxId, TxStatus};
use wager::types::{Address, BetStatus, ErrorKind, LedgerError, Wei};

use crate::common::*;

const TOKEN: &str = "custody-token";

struct Custody {
    ledger: Arc<SimulatedLedger>,
}

#[derive(Deserialize)]
struct InstructionBody {
    key: String,
    party: Option<Address>,
    amount: Wei,
}

type Reply = (StatusCode, Json<Value>);

fn wire_status(status: &TxStatus) -> (&'static str, Option<String>) {
    match status {
        TxStatus::Confirmed => ("confirmed", None),
        TxStatus::Pending => ("pending", None),
        TxStatus::Failed(reason) => ("failed", Some(reason.clone())),
    }
}

fn receipt_json(r: &LedgerReceipt) -> Value {
    let (status, reason) = wire_status(&r.status);
    json!({ "tx_id": r.tx_id.0, "status": status, "reason": reason, "fee": r.fee })
}

fn error_reply(e: LedgerError) -> Reply {
    let code = match e {
        LedgerError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    };
    (code, Json(json!({ "error": e.to_string() })))
}

fn reply(result: Result<LedgerReceipt, LedgerError>) -> Reply {
    match result {
        Ok(r) => (StatusCode::OK, Json(receipt_json(&r))),
        Err(e) => error_reply(e),
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {TOKEN}"))
        .unwrap_or(false)
}

fn unauthorized() -> Reply {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad token" })))
}

fn party(body: &InstructionBody) -> Result<&Address, Reply> {
    body.party
        .as_ref()
        .ok_or_else(|| (StatusCode::BAD_REQUEST, Json(json!({ "error": "party required" }))))
}

async fn escrow(State(c): State<Arc<Custody>>, headers: HeaderMap, Json(b): Json<InstructionBody>) -> Reply {
    if !authorized(&headers) {
        return unauthorized();
    }
    match party(&b) {
        Ok(p) => reply(c.ledger.escrow(&IdempotencyKey(b.key.clone()), p, b.amount).await),
        Err(r) => r,
    }
}

async fn payout(State(c): State<Arc<Custody>>, headers: HeaderMap, Json(b): Json<InstructionBody>) -> Reply {
    if !authorized(&headers) {
        return unauthorized();
    }
    match party(&b) {
        Ok(p) => reply(c.ledger.payout(&IdempotencyKey(b.key.clone()), p, b.amount).await),
        Err(r) => r,
    }
}

async fn premium(State(c): State<Arc<Custody>>, headers: HeaderMap, Json(b): Json<InstructionBody>) -> Reply {
    if !authorized(&headers) {
        return unauthorized();
    }
    match party(&b) {
        Ok(p) => reply(c.ledger.charge_premium(&IdempotencyKey(b.key.clone()), p, b.amount).await),
        Err(r) => r,
    }
}

async fn coverage(State(c): State<Arc<Custody>>, headers: HeaderMap, Json(b): Json<InstructionBody>) -> Reply {
    if !authorized(&headers) {
        return unauthorized();
    }
    match party(&b) {
        Ok(p) => reply(c.ledger.pay_coverage(&IdempotencyKey(b.key.clone()), p, b.amount).await),
        Err(r) => r,
    }
}

async fn deposit(State(c): State<Arc<Custody>>, headers: HeaderMap, Json(b): Json<InstructionBody>) -> Reply {
    if !authorized(&headers) {
        return unauthorized();
    }
    reply(c.ledger.deposit_to_yield(&IdempotencyKey(b.key), b.amount).await)
}

async fn withdraw(State(c): State<Arc<Custody>>, headers: HeaderMap, Json(b): Json<InstructionBody>) -> Reply {
    if !authorized(&headers) {
        return unauthorized();
    }
    match c.ledger.withdraw_from_yield(&IdempotencyKey(b.key), b.amount).await {
        Ok(w) => {
            let mut body = receipt_json(&w.receipt);
            body["principal"] = json!(w.principal);
            body["yield_earned"] = json!(w.yield_earned);
            (StatusCode::OK, Json(body))
        }
        Err(e) => error_reply(e),
    }
}

async fn status(State(c): State<Arc<Custody>>, headers: HeaderMap, Path(tx_id): Path<String>) -> Reply {
    if !authorized(&headers) {
        return unauthorized();
    }
    match c.ledger.transaction_status(&TxId(tx_id)).await {
        Ok(s) => {
            let (status, reason) = wire_status(&s);
            (StatusCode::OK, Json(json!({ "status": status, "reason": reason })))
        }
        Err(e) => error_reply(e),
    }
}

/// Serve the custody API under `/custody` on an ephemeral port.
async fn spawn_custody(ledger: Arc<SimulatedLedger>) -> String {
    let routes = Router::new()
        .route("/escrow", post(escrow))
        .route("/payout", post(payout))
        .route("/premium", post(premium))
        .route("/coverage", post(coverage))
        .route("/yield/deposit", post(deposit))
        .route("/yield/withdraw", post(withdraw))
        .route("/transactions/:tx_id", get(status))
        .with_state(Arc::new(Custody { ledger }));
    let app = Router::new().nest("/custody", routes);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/custody/")
}

async fn http_world(token: Option<&str>, confirmations: u32) -> World {
    let ledger = Arc::new(SimulatedLedger::new(SimulatedLedgerConfig {
        yield_bps: 100,
        confirmations_required: confirmations,
        insurance_pool_seed: eth(100),
        ..Default::default()
    }));
    for n in 1..=2 {
        ledger.fund(&addr(n), eth(STARTING_BALANCE_ETH));
    }
    let endpoint = spawn_custody(ledger.clone()).await;
    let gateway = HttpLedgerGateway::new(
        &endpoint,
        token.map(|t| SecretString::new(t.to_string())),
        Duration::from_secs(5),
    )
    .unwrap();
    World::with_ledger(ledger, Arc::new(gateway), true)
}

#[tokio::test]
async fn test_insured_bet_with_yield_over_http() {
    let w = http_world(Some(TOKEN), 0).await;

    let bet = w.engine.propose(&creator(), eth(1), true).await.unwrap().confirmed().unwrap();
    w.engine.join(&participant(), bet.id, true, None).await.unwrap();
    assert_eq!(w.ledger.yield_principal(), eth(2));

    w.engine.confirm(&creator(), bet.id, &addr(1)).await.unwrap();
    let bet = w.engine.confirm(&participant(), bet.id, &addr(1)).await.unwrap().confirmed().unwrap();
    assert_eq!(bet.status, BetStatus::Resolved);
    assert_eq!(bet.yield_earned, Wei(20_000_000_000_000_000));

    let claim = w.engine.claim_insurance(&participant(), bet.id).await.unwrap().confirmed().unwrap();
    assert_eq!(claim.payout, Wei(900_000_000_000_000_000));

    // 10 - 1 - 0.05 + 2 + 0.02
    assert_eq!(w.balance(1), Wei(10_970_000_000_000_000_000));
    // 10 - 1 - 0.05 + 0.9
    assert_eq!(w.balance(2), Wei(9_850_000_000_000_000_000));
    assert_eq!(w.ledger.escrow_pool(), Wei::ZERO);
}

#[tokio::test]
async fn test_service_outage_is_retried_with_same_key() {
    let w = http_world(Some(TOKEN), 0).await;
    w.ledger.fail_next(LedgerOp::Escrow, LedgerError::Transient("node syncing".into()));

    let bet = w.engine.propose(&creator(), eth(1), false).await.unwrap().confirmed().unwrap();
    assert_eq!(bet.status, BetStatus::Proposed);
    assert_eq!(w.ledger.call_count(LedgerOp::Escrow), 2);
    assert_eq!(w.balance(1), eth(9));
}

#[tokio::test]
async fn test_rejected_credentials_leave_no_trace() {
    let w = http_world(Some("wrong-token"), 0).await;

    let err = assert_err!(w.engine.propose(&creator(), eth(1), false).await);
    assert_eq!(err.kind(), ErrorKind::Ledger);
    assert!(w.engine.list().await.is_empty());
    assert_eq!(w.balance(1), eth(10));
    assert_eq!(w.ledger.call_count(LedgerOp::Escrow), 0);
}

#[tokio::test]
async fn test_slow_confirmation_over_http_parks_then_resumes() {
    let w = http_world(Some(TOKEN), 7).await;

    let record = match w.engine.propose(&creator(), eth(1), false).await.unwrap() {
        wager::engine::Outcome::Pending(record) => record,
        wager::engine::Outcome::Confirmed(_) => panic!("proposal should be pending"),
    };
    assert!(w.engine.list().await.is_empty());

    // Three polls per run: still short after the first resume.
    let again = w.engine.resume(record.operation_id).await.unwrap();
    assert_eq!(again.status, wager::types::OperationStatus::Pending);
    let done = w.engine.resume(record.operation_id).await.unwrap();
    assert_eq!(done.status, wager::types::OperationStatus::Confirmed);
    assert_eq!(w.engine.list().await.len(), 1);
    assert_eq!(w.ledger.escrow_pool(), eth(1));
}
