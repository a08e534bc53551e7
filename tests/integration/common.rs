//! Shared fixtures for integration testing.
//!
//! Builds a `LifecycleEngine` over a funded `SimulatedLedger` and a
//! `ManualClock`, so every scenario is deterministic and needs no
//! external services.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use wager::engine::clock::ManualClock;
use wager::engine::fees::FeeSchedule;
use wager::engine::settlement::RetryPolicy;
use wager::engine::{LifecycleEngine, ProtocolRules};
use wager::ledger::simulated::{SimulatedLedger, SimulatedLedgerConfig};
use wager::ledger::LedgerGateway;
use wager::registry::InMemoryRegistry;
use wager::types::{Address, Caller, Wei};

pub const STARTING_BALANCE_ETH: u64 = 10;

pub fn addr(n: u8) -> Address {
    Address::parse(&format!("0x{:040x}", n)).unwrap()
}

pub fn creator() -> Caller {
    Caller::new(addr(1))
}

pub fn participant() -> Caller {
    Caller::new(addr(2))
}

pub fn arbitrator() -> Address {
    addr(0xa0)
}

pub fn treasury() -> Address {
    addr(0xee)
}

pub fn eth(n: u64) -> Wei {
    Wei::from_eth_units(n)
}

pub fn rules(yield_enabled: bool) -> ProtocolRules {
    ProtocolRules {
        fees: FeeSchedule::default(),
        cancel_timeout: ChronoDuration::hours(24),
        arbitrator: arbitrator(),
        treasury: treasury(),
        yield_enabled,
    }
}

/// No sleeping between retries or polls.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        retry_backoff: Duration::ZERO,
        poll_attempts: 3,
        poll_interval: Duration::ZERO,
        max_roll_forward: 3,
    }
}

pub struct World {
    pub engine: Arc<LifecycleEngine>,
    pub ledger: Arc<SimulatedLedger>,
    pub clock: Arc<ManualClock>,
}

impl World {
    /// Accounts `0x..01` through `0x..{funded}` start with 10 ETH each.
    pub fn new(yield_enabled: bool, yield_bps: u32, funded: u8) -> Self {
        let ledger = Arc::new(SimulatedLedger::new(SimulatedLedgerConfig {
            yield_bps,
            fee: Wei(21_000),
            insurance_pool_seed: eth(100),
            ..Default::default()
        }));
        for n in 1..=funded {
            ledger.fund(&addr(n), eth(STARTING_BALANCE_ETH));
        }
        Self::with_ledger(ledger.clone(), ledger, yield_enabled)
    }

    /// Engine talking to `gateway`; `ledger` is the custody state behind it.
    pub fn with_ledger(
        ledger: Arc<SimulatedLedger>,
        gateway: Arc<dyn LedgerGateway>,
        yield_enabled: bool,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = Arc::new(LifecycleEngine::new(
            Arc::new(InMemoryRegistry::new()),
            gateway,
            clock.clone(),
            rules(yield_enabled),
            fast_policy(),
        ));
        Self { engine, ledger, clock }
    }

    pub fn balance(&self, n: u8) -> Wei {
        self.ledger.balance_of(&addr(n))
    }
}
