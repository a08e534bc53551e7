//! HTTP API: Axum server in front of the lifecycle engine.
//!
//! Serves the bet REST API. CORS enabled for browser wallets.

pub mod routes;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use routes::{AppState, CALLER_HEADER};

/// Start the API server.
///
/// Binds before returning so a port clash surfaces as an error; serving
/// happens on a background task.
pub async fn spawn_api(state: AppState, port: u16) -> Result<SocketAddr> {
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API port {port}"))?;
    let local = listener.local_addr().context("Failed to read bound API address")?;
    info!(port = local.port(), "API server starting on http://localhost:{}", local.port());

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server error");
        }
    });

    Ok(local)
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(CALLER_HEADER)]);

    Router::new()
        .route("/api/bets", post(routes::create_bet).get(routes::list_bets))
        .route("/api/bets/:id", get(routes::get_bet))
        .route("/api/bets/:id/join", post(routes::join_bet))
        .route("/api/bets/:id/confirm", post(routes::confirm_winner))
        .route("/api/bets/:id/dispute", post(routes::raise_dispute))
        .route("/api/bets/:id/arbitrate", post(routes::arbitrate))
        .route("/api/bets/:id/cancel", post(routes::cancel_bet))
        .route("/api/bets/:id/claim-insurance", post(routes::claim_insurance))
        .route("/api/operations/:op_id", get(routes::get_operation))
        .route("/health", get(routes::health))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
