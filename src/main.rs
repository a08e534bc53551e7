//! WAGER: peer-to-peer bet escrow and settlement service
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the registry, parked operations and simulated custody state
//! from disk (or starts empty), selects the ledger backend, serves the
//! HTTP API, and snapshots state periodically with graceful shutdown.

use anyhow::{Context, Result};
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use wager::api::{self, routes::ApiState};
use wager::config::{self, LedgerBackend};
use wager::engine::clock::SystemClock;
use wager::engine::{LifecycleEngine, ParkedOperation};
use wager::ledger::http::HttpLedgerGateway;
use wager::ledger::simulated::{SimulatedLedger, SimulatedLedgerState};
use wager::ledger::LedgerGateway;
use wager::registry::InMemoryRegistry;
use wager::storage::{self, MetadataStore, Snapshot};

const BANNER: &str = r#"
__        ___    ____ _____ ____
\ \      / / \  / ___| ____|  _ \
 \ \ /\ / / _ \| |  _|  _| | |_) |
  \ V  V / ___ \ |_| | |___|  _ <
   \_/\_/_/   \_\____|_____|_| \_\

  Peer-to-peer escrowed wagers
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = config::AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging(&cfg);

    // Print startup banner
    println!("{BANNER}");
    info!(
        service = %cfg.service.name,
        ledger = ?cfg.ledger.backend,
        yield_enabled = cfg.protocol.yield_enabled,
        "WAGER starting up"
    );

    // -- Restore or create state -----------------------------------------

    let snapshot_path = cfg.storage.snapshot_path.clone();
    let saved = storage::load_snapshot(Some(snapshot_path.as_str()))?;
    let ledger_image = match (&saved, &cfg.ledger.backend) {
        (Some(s), LedgerBackend::Simulated) => s.simulated_ledger_image()?,
        (Some(s), LedgerBackend::Http) if s.ledger.is_some() => {
            warn!("Saved simulated ledger state ignored: the HTTP backend keeps its own");
            None
        }
        _ => None,
    };
    let (registry, metadata, parked) = match saved {
        Some(s) => {
            info!(
                bets = s.registry.bets.len(),
                parked = s.operations.len(),
                saved_at = %s.saved_at,
                "Resumed from saved state"
            );
            (
                InMemoryRegistry::from_snapshot(s.registry),
                MetadataStore::from_entries(s.metadata),
                s.operations,
            )
        }
        None => {
            info!("Fresh start");
            (InMemoryRegistry::new(), MetadataStore::new(), Vec::new())
        }
    };
    let registry = Arc::new(registry);
    let metadata = Arc::new(metadata);

    // -- Initialise components -------------------------------------------

    let (ledger, simulated) = build_ledger(&cfg, ledger_image)?;
    let rules = cfg.protocol.rules()?;
    info!(
        arbitrator = %rules.arbitrator,
        treasury = %rules.treasury,
        premium_bps = rules.fees.premium_bps,
        coverage_bps = rules.fees.coverage_bps,
        cancel_timeout_secs = rules.cancel_timeout.num_seconds(),
        "Protocol rules loaded"
    );

    let engine = Arc::new(LifecycleEngine::new(
        registry.clone(),
        ledger,
        Arc::new(SystemClock),
        rules,
        cfg.ledger.retry_policy(),
    ));
    restore_parked(&engine, parked);

    let state = Arc::new(ApiState::new(engine.clone(), metadata.clone()));
    if cfg.server.enabled {
        api::spawn_api(state.clone(), cfg.server.port).await?;
    } else {
        warn!("API server disabled in config; nothing will accept requests");
    }

    // -- Main loop -------------------------------------------------------

    let mut interval =
        tokio::time::interval(Duration::from_secs(cfg.storage.snapshot_interval_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.storage.snapshot_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep_pending(&engine).await;
                state.settle_metadata();
                let snapshot = take_snapshot(&engine, &registry, &metadata, simulated.as_deref()).await;
                if let Err(e) = storage::save_snapshot(&snapshot, Some(snapshot_path.as_str())) {
                    error!(error = %e, "Failed to save state");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    // Save final state
    state.settle_metadata();
    let snapshot = take_snapshot(&engine, &registry, &metadata, simulated.as_deref()).await;
    storage::save_snapshot(&snapshot, Some(snapshot_path.as_str()))?;
    if !snapshot.operations.is_empty() {
        warn!(
            count = snapshot.operations.len(),
            "Shutting down with ledger operations still unconfirmed; they resume on next start"
        );
    }
    info!(bets = snapshot.registry.bets.len(), "WAGER shut down cleanly.");

    Ok(())
}

/// Select and construct the configured ledger backend. The simulated
/// backend is also returned concretely so its state can be snapshotted.
fn build_ledger(
    cfg: &config::AppConfig,
    image: Option<SimulatedLedgerState>,
) -> Result<(Arc<dyn LedgerGateway>, Option<Arc<SimulatedLedger>>)> {
    match cfg.ledger.backend {
        LedgerBackend::Simulated => {
            let sim_cfg = cfg.ledger.simulated.clone().unwrap_or_default();
            let ledger = Arc::new(SimulatedLedger::new(sim_cfg.ledger_config()?));
            match image {
                Some(image) => {
                    info!(
                        accounts = image.balances.len(),
                        escrow_eth = %image.escrow_pool.to_eth_string(),
                        "Restored simulated ledger state"
                    );
                    ledger.restore_state(image);
                }
                None => {
                    for (address, amount) in sim_cfg.funded_accounts()? {
                        ledger.fund(&address, amount);
                        info!(account = %address, balance_eth = %amount.to_eth_string(), "Funded simulated account");
                    }
                }
            }
            info!(yield_bps = sim_cfg.yield_bps, "Using simulated ledger");
            let gateway: Arc<dyn LedgerGateway> = ledger.clone();
            Ok((gateway, Some(ledger)))
        }
        LedgerBackend::Http => {
            let http_cfg = cfg
                .ledger
                .http
                .as_ref()
                .context("[ledger.http] section required for backend = \"http\"")?;
            let api_key = match &http_cfg.api_key_env {
                Some(env) => Some(SecretString::new(config::AppConfig::resolve_env(env)?)),
                None => None,
            };
            let gateway = HttpLedgerGateway::new(
                &http_cfg.endpoint,
                api_key,
                Duration::from_secs(http_cfg.timeout_secs),
            )?;
            info!(endpoint = %http_cfg.endpoint, "Using HTTP ledger gateway");
            let gateway: Arc<dyn LedgerGateway> = Arc::new(gateway);
            Ok((gateway, None))
        }
    }
}

fn restore_parked(engine: &LifecycleEngine, parked: Vec<ParkedOperation>) {
    if parked.is_empty() {
        return;
    }
    info!(count = parked.len(), "Re-registering operations parked before shutdown");
    engine.restore_parked(parked);
}

/// Registry, parked operations and custody state captured at one point
/// with no plan in flight.
async fn take_snapshot(
    engine: &LifecycleEngine,
    registry: &InMemoryRegistry,
    metadata: &MetadataStore,
    simulated: Option<&SimulatedLedger>,
) -> Snapshot {
    engine
        .quiescent(|operations| {
            Snapshot::new(registry.snapshot(), metadata.entries())
                .with_operations(operations)
                .with_ledger(simulated.map(SimulatedLedger::export_state))
        })
        .await
}

/// Give every parked operation another chance to confirm.
async fn sweep_pending(engine: &LifecycleEngine) {
    for op in engine.pending_operations() {
        match engine.resume(op.operation_id).await {
            Ok(record) => info!(
                operation_id = %record.operation_id,
                status = %record.status,
                "Swept parked operation"
            ),
            Err(e) => warn!(operation_id = %op.operation_id, error = %e, "Failed to resume operation"),
        }
    }
}

fn init_logging(cfg: &config::AppConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("wager=info"));

    let json_logging = std::env::var("WAGER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    tracing::debug!(service = %cfg.service.name, "Logging initialised");
}
