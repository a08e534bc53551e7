//! State saved mid-operation and loaded into a fresh process.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio_test::assert_err;

use wager::engine::clock::ManualClock;
use wager::engine::{LifecycleEngine, Outcome};
use wager::ledger::simulated::{LedgerOp, SimulatedLedger, SimulatedLedgerConfig};
use wager::registry::InMemoryRegistry;
use wager::storage::{self, MetadataStore, Snapshot};
use wager::types::{BetError, BetStatus, OperationStatus};

use crate::common::*;

struct Node {
    engine: LifecycleEngine,
    registry: Arc<InMemoryRegistry>,
    ledger: Arc<SimulatedLedger>,
    clock: Arc<ManualClock>,
}

impl Node {
    fn new(registry: InMemoryRegistry, ledger: SimulatedLedger) -> Self {
        let registry = Arc::new(registry);
        let ledger = Arc::new(ledger);
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = LifecycleEngine::new(
            registry.clone(),
            ledger.clone(),
            clock.clone(),
            rules(false),
            fast_policy(),
        );
        Self { engine, registry, ledger, clock }
    }

    async fn snapshot(&self) -> Snapshot {
        self.engine
            .quiescent(|operations| {
                Snapshot::new(self.registry.snapshot(), MetadataStore::new().entries())
                    .with_operations(operations)
                    .with_ledger(Some(self.ledger.export_state()))
            })
            .await
    }
}

fn state_file() -> String {
    let mut p = std::env::temp_dir();
    p.push(format!("wager_restart_{}.json", uuid::Uuid::new_v4()));
    p.to_string_lossy().to_string()
}

#[tokio::test]
async fn test_parked_cancel_finishes_after_restart_without_double_refund() {
    let first = Node::new(InMemoryRegistry::new(), SimulatedLedger::new(SimulatedLedgerConfig::default()));
    first.ledger.fund(&addr(1), eth(STARTING_BALANCE_ETH));
    first.ledger.fund(&addr(2), eth(STARTING_BALANCE_ETH));

    let bet = first.engine.propose(&creator(), eth(1), false).await.unwrap().confirmed().unwrap();
    first.engine.join(&participant(), bet.id, false, None).await.unwrap();
    first.clock.advance(ChronoDuration::hours(25));

    // The creator's refund is submitted but still one confirmation short.
    first.ledger.set_confirmations_required(4);
    let parked = match first.engine.cancel(&creator(), bet.id).await.unwrap() {
        Outcome::Pending(record) => record,
        Outcome::Confirmed(_) => panic!("cancel should be parked"),
    };
    assert!(parked.awaiting.is_some());

    let path = state_file();
    storage::save_snapshot(&first.snapshot().await, Some(path.as_str())).unwrap();
    drop(first);

    let saved = storage::load_snapshot(Some(path.as_str())).unwrap().unwrap();
    storage::delete_snapshot(Some(path.as_str())).unwrap();
    assert_eq!(saved.operations.len(), 1);
    let image = saved.simulated_ledger_image().unwrap().unwrap();

    let ledger = SimulatedLedger::new(SimulatedLedgerConfig::default());
    ledger.restore_state(image);
    let second = Node::new(InMemoryRegistry::from_snapshot(saved.registry), ledger);
    second.engine.restore_parked(saved.operations);
    second.clock.advance(ChronoDuration::hours(25));

    // The bet is still held by the restored operation.
    let err = assert_err!(second.engine.cancel(&creator(), bet.id).await);
    assert!(matches!(err, BetError::OperationPending(id) if id == bet.id));
    let pending = second.engine.pending_operations();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation_id, parked.operation_id);
    assert_eq!(pending[0].awaiting, parked.awaiting);

    let done = second.engine.resume(parked.operation_id).await.unwrap();
    assert_eq!(done.status, OperationStatus::Confirmed);
    assert_eq!(second.engine.get(bet.id).await.unwrap().status, BetStatus::Cancelled);

    // Only the participant's refund was submitted after the restart.
    assert_eq!(second.ledger.call_count(LedgerOp::Payout), 1);
    assert_eq!(second.ledger.balance_of(&addr(1)), eth(STARTING_BALANCE_ETH));
    assert_eq!(second.ledger.balance_of(&addr(2)), eth(STARTING_BALANCE_ETH));
    assert_eq!(second.ledger.escrow_pool(), eth(0));
    assert!(second.engine.pending_operations().is_empty());
}

#[tokio::test]
async fn test_snapshot_without_ledger_image_is_not_restored() {
    let node = Node::new(InMemoryRegistry::new(), SimulatedLedger::new(SimulatedLedgerConfig::default()));
    node.ledger.fund(&addr(1), eth(STARTING_BALANCE_ETH));
    node.engine.propose(&creator(), eth(1), false).await.unwrap();

    let snapshot = node.snapshot().await.with_ledger(None);
    assert!(snapshot.simulated_ledger_image().is_err());
}
