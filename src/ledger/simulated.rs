//! Simulated custody backend.
//!
//! An in-memory stand-in for the settlement contract: account balances,
//! a pooled escrow, a yield facility that pays a fixed rate on withdrawal,
//! and an insurance pool. Transactions can be made to wait for a number of
//! status polls before they confirm, and failures can be injected per
//! operation for testing.
//!
//! Custody state can be exported as a [`SimulatedLedgerState`] and loaded
//! back, so balances and pools survive a restart alongside the registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use super::{IdempotencyKey, LedgerGateway, LedgerReceipt, TxId, TxStatus, YieldWithdrawal};
use crate::types::{Address, LedgerError, Wei};

const BACKEND_NAME: &str = "simulated";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SimulatedLedgerConfig {
    /// Yield paid by the facility on each withdrawal, in bps of principal.
    pub yield_bps: u32,
    /// Status polls a transaction waits before it confirms (0 = immediate).
    pub confirmations_required: u32,
    /// Network fee reported on each receipt. Paid by the operator, never
    /// taken from principal.
    pub fee: Wei,
    /// Starting balance of the insurance pool.
    pub insurance_pool_seed: Wei,
}

impl Default for SimulatedLedgerConfig {
    fn default() -> Self {
        Self {
            yield_bps: 0,
            confirmations_required: 0,
            fee: Wei::ZERO,
            insurance_pool_seed: Wei::ZERO,
        }
    }
}

/// Operation selector for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    Escrow,
    DepositToYield,
    WithdrawFromYield,
    Payout,
    ChargePremium,
    PayCoverage,
    Status,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Movement {
    Escrow { party: Address, amount: Wei },
    DepositToYield { amount: Wei },
    WithdrawFromYield { amount: Wei, yield_earned: Wei },
    Payout { party: Address, amount: Wei },
    Premium { party: Address, amount: Wei },
    Coverage { party: Address, amount: Wei },
}

#[derive(Debug)]
struct Submitted {
    movement: Movement,
    polls_left: u32,
    status: TxStatus,
}

/// A transaction as persisted, keyed by the instruction that created it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TransactionEntry {
    tx_id: TxId,
    key: IdempotencyKey,
    movement: Movement,
    polls_left: u32,
    status: TxStatus,
}

/// Serializable image of the custody state. Injected failures and call
/// counters are not part of it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulatedLedgerState {
    pub balances: Vec<(Address, Wei)>,
    pub escrow_pool: Wei,
    pub yield_principal: Wei,
    pub insurance_pool: Wei,
    pub fees_paid: Wei,
    next_tx: u64,
    transactions: Vec<TransactionEntry>,
}

#[derive(Debug, Default)]
struct SimState {
    balances: HashMap<Address, Wei>,
    escrow_pool: Wei,
    yield_principal: Wei,
    insurance_pool: Wei,
    fees_paid: Wei,
    next_tx: u64,
    txs: HashMap<TxId, Submitted>,
    by_key: HashMap<IdempotencyKey, TxId>,
    failures: HashMap<LedgerOp, VecDeque<LedgerError>>,
    calls: HashMap<LedgerOp, usize>,
}

impl SimState {
    fn balance(&self, who: &Address) -> Wei {
        self.balances.get(who).copied().unwrap_or(Wei::ZERO)
    }

    /// Check a movement against current balances without applying it.
    fn check(&self, movement: &Movement) -> Result<(), String> {
        let insufficient = |what: &str, have: Wei, need: Wei| {
            format!("insufficient {what}: need {need}, have {have}")
        };
        match movement {
            Movement::Escrow { party, amount } | Movement::Premium { party, amount } => {
                let have = self.balance(party);
                if have < *amount {
                    return Err(insufficient(&format!("funds for {party}"), have, *amount));
                }
            }
            Movement::DepositToYield { amount } | Movement::Payout { amount, .. } => {
                if self.escrow_pool < *amount {
                    return Err(insufficient("escrow", self.escrow_pool, *amount));
                }
            }
            Movement::WithdrawFromYield { amount, .. } => {
                if self.yield_principal < *amount {
                    return Err(insufficient("yield principal", self.yield_principal, *amount));
                }
            }
            Movement::Coverage { amount, .. } => {
                if self.insurance_pool < *amount {
                    return Err(insufficient("insurance pool", self.insurance_pool, *amount));
                }
            }
        }
        Ok(())
    }

    fn credit(&mut self, who: &Address, amount: Wei) {
        let entry = self.balances.entry(who.clone()).or_insert(Wei::ZERO);
        *entry = Wei(entry.0.saturating_add(amount.0));
    }

    fn debit(&mut self, who: &Address, amount: Wei) {
        let entry = self.balances.entry(who.clone()).or_insert(Wei::ZERO);
        *entry = entry.saturating_sub(amount);
    }

    fn apply(&mut self, movement: &Movement) -> Result<(), String> {
        self.check(movement)?;
        match movement {
            Movement::Escrow { party, amount } => {
                self.debit(party, *amount);
                self.escrow_pool = Wei(self.escrow_pool.0 + amount.0);
            }
            Movement::DepositToYield { amount } => {
                self.escrow_pool = self.escrow_pool.saturating_sub(*amount);
                self.yield_principal = Wei(self.yield_principal.0 + amount.0);
            }
            Movement::WithdrawFromYield { amount, yield_earned } => {
                self.yield_principal = self.yield_principal.saturating_sub(*amount);
                self.escrow_pool = Wei(self.escrow_pool.0 + amount.0 + yield_earned.0);
            }
            Movement::Payout { party, amount } => {
                self.escrow_pool = self.escrow_pool.saturating_sub(*amount);
                self.credit(party, *amount);
            }
            Movement::Premium { party, amount } => {
                self.debit(party, *amount);
                self.insurance_pool = Wei(self.insurance_pool.0 + amount.0);
            }
            Movement::Coverage { party, amount } => {
                self.insurance_pool = self.insurance_pool.saturating_sub(*amount);
                self.credit(party, *amount);
            }
        }
        Ok(())
    }

    fn take_failure(&mut self, op: LedgerOp) -> Option<LedgerError> {
        *self.calls.entry(op).or_insert(0) += 1;
        self.failures.get_mut(&op).and_then(|q| q.pop_front())
    }

    fn export(&self) -> SimulatedLedgerState {
        let mut balances: Vec<_> = self.balances.iter().map(|(a, w)| (a.clone(), *w)).collect();
        balances.sort();
        let mut transactions: Vec<_> = self
            .by_key
            .iter()
            .filter_map(|(key, tx_id)| {
                self.txs.get(tx_id).map(|tx| TransactionEntry {
                    tx_id: tx_id.clone(),
                    key: key.clone(),
                    movement: tx.movement.clone(),
                    polls_left: tx.polls_left,
                    status: tx.status.clone(),
                })
            })
            .collect();
        transactions.sort_by(|a, b| a.tx_id.0.cmp(&b.tx_id.0));
        SimulatedLedgerState {
            balances,
            escrow_pool: self.escrow_pool,
            yield_principal: self.yield_principal,
            insurance_pool: self.insurance_pool,
            fees_paid: self.fees_paid,
            next_tx: self.next_tx,
            transactions,
        }
    }

    fn import(&mut self, image: SimulatedLedgerState) {
        self.balances = image.balances.into_iter().collect();
        self.escrow_pool = image.escrow_pool;
        self.yield_principal = image.yield_principal;
        self.insurance_pool = image.insurance_pool;
        self.fees_paid = image.fees_paid;
        self.next_tx = image.next_tx;
        self.txs.clear();
        self.by_key.clear();
        for entry in image.transactions {
            self.by_key.insert(entry.key, entry.tx_id.clone());
            self.txs.insert(
                entry.tx_id,
                Submitted {
                    movement: entry.movement,
                    polls_left: entry.polls_left,
                    status: entry.status,
                },
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// In-memory custody backend.
pub struct SimulatedLedger {
    config: Mutex<SimulatedLedgerConfig>,
    state: Mutex<SimState>,
}

impl SimulatedLedger {
    pub fn new(config: SimulatedLedgerConfig) -> Self {
        let state = SimState {
            insurance_pool: config.insurance_pool_seed,
            ..SimState::default()
        };
        Self {
            config: Mutex::new(config),
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settings(&self) -> SimulatedLedgerConfig {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Current custody state, for persistence.
    pub fn export_state(&self) -> SimulatedLedgerState {
        self.state().export()
    }

    /// Replace custody state with a previously exported image. Injected
    /// failures and call counters are kept.
    pub fn restore_state(&self, image: SimulatedLedgerState) {
        self.state().import(image);
    }

    // -- Test & operator hooks -------------------------------------------

    /// Credit an account with spendable funds.
    pub fn fund(&self, who: &Address, amount: Wei) {
        self.state().credit(who, amount);
    }

    pub fn balance_of(&self, who: &Address) -> Wei {
        self.state().balance(who)
    }

    pub fn escrow_pool(&self) -> Wei {
        self.state().escrow_pool
    }

    pub fn yield_principal(&self) -> Wei {
        self.state().yield_principal
    }

    pub fn insurance_pool(&self) -> Wei {
        self.state().insurance_pool
    }

    pub fn fees_paid(&self) -> Wei {
        self.state().fees_paid
    }

    /// Make the next call of `op` fail with `error`. Queues if called repeatedly.
    pub fn fail_next(&self, op: LedgerOp, error: LedgerError) {
        self.state().failures.entry(op).or_default().push_back(error);
    }

    pub fn call_count(&self, op: LedgerOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn set_confirmations_required(&self, polls: u32) {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).confirmations_required = polls;
    }

    /// Drop a pending transaction: it will report `Failed` and move no funds.
    pub fn drop_transaction(&self, tx_id: &TxId) {
        if let Some(tx) = self.state().txs.get_mut(tx_id) {
            if tx.status == TxStatus::Pending {
                tx.status = TxStatus::Failed("dropped from mempool".into());
            }
        }
    }

    /// Ids of transactions still awaiting confirmation.
    pub fn pending_transactions(&self) -> Vec<TxId> {
        let state = self.state();
        let mut ids: Vec<TxId> = state
            .txs
            .iter()
            .filter(|(_, tx)| tx.status == TxStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        ids
    }

    // -- Core ----------------------------------------------------------------

    fn submit(
        &self,
        op: LedgerOp,
        key: &IdempotencyKey,
        movement: Movement,
    ) -> Result<LedgerReceipt, LedgerError> {
        let settings = self.settings();
        let mut state = self.state();

        if let Some(err) = state.take_failure(op) {
            return Err(err);
        }

        if let Some(tx_id) = state.by_key.get(key).cloned() {
            let status = state
                .txs
                .get(&tx_id)
                .map(|tx| tx.status.clone())
                .unwrap_or(TxStatus::Confirmed);
            debug!(key = %key, tx_id = %tx_id, "Duplicate instruction, returning original receipt");
            return Ok(LedgerReceipt { tx_id, status, fee: settings.fee });
        }

        state.check(&movement).map_err(LedgerError::Rejected)?;

        state.next_tx += 1;
        let tx_id = TxId(format!("sim-{:06}", state.next_tx));
        state.fees_paid = Wei(state.fees_paid.0 + settings.fee.0);

        let status = if settings.confirmations_required == 0 {
            state.apply(&movement).map_err(LedgerError::Rejected)?;
            TxStatus::Confirmed
        } else {
            TxStatus::Pending
        };

        state.txs.insert(
            tx_id.clone(),
            Submitted {
                movement,
                polls_left: settings.confirmations_required,
                status: status.clone(),
            },
        );
        state.by_key.insert(key.clone(), tx_id.clone());

        debug!(op = ?op, key = %key, tx_id = %tx_id, status = ?status, "Instruction submitted");
        Ok(LedgerReceipt { tx_id, status, fee: settings.fee })
    }
}

#[async_trait]
impl LedgerGateway for SimulatedLedger {
    async fn escrow(
        &self,
        key: &IdempotencyKey,
        party: &Address,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.submit(
            LedgerOp::Escrow,
            key,
            Movement::Escrow { party: party.clone(), amount },
        )
    }

    async fn deposit_to_yield(
        &self,
        key: &IdempotencyKey,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.submit(LedgerOp::DepositToYield, key, Movement::DepositToYield { amount })
    }

    async fn withdraw_from_yield(
        &self,
        key: &IdempotencyKey,
        amount: Wei,
    ) -> Result<YieldWithdrawal, LedgerError> {
        let yield_earned = amount.apply_bps(self.settings().yield_bps);
        let receipt = self.submit(
            LedgerOp::WithdrawFromYield,
            key,
            Movement::WithdrawFromYield { amount, yield_earned },
        )?;
        // A duplicate key returns the originally recorded amounts.
        let state = self.state();
        let (principal, yield_earned) = match state.txs.get(&receipt.tx_id).map(|t| &t.movement) {
            Some(Movement::WithdrawFromYield { amount, yield_earned }) => (*amount, *yield_earned),
            _ => (amount, yield_earned),
        };
        Ok(YieldWithdrawal { receipt, principal, yield_earned })
    }

    async fn payout(
        &self,
        key: &IdempotencyKey,
        party: &Address,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.submit(
            LedgerOp::Payout,
            key,
            Movement::Payout { party: party.clone(), amount },
        )
    }

    async fn charge_premium(
        &self,
        key: &IdempotencyKey,
        party: &Address,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.submit(
            LedgerOp::ChargePremium,
            key,
            Movement::Premium { party: party.clone(), amount },
        )
    }

    async fn pay_coverage(
        &self,
        key: &IdempotencyKey,
        party: &Address,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.submit(
            LedgerOp::PayCoverage,
            key,
            Movement::Coverage { party: party.clone(), amount },
        )
    }

    async fn transaction_status(&self, tx_id: &TxId) -> Result<TxStatus, LedgerError> {
        let mut state = self.state();
        if let Some(err) = state.take_failure(LedgerOp::Status) {
            return Err(err);
        }

        let (movement, ready) = {
            let tx = state
                .txs
                .get_mut(tx_id)
                .ok_or_else(|| LedgerError::Rejected(format!("unknown transaction {tx_id}")))?;
            if tx.status != TxStatus::Pending {
                return Ok(tx.status.clone());
            }
            tx.polls_left = tx.polls_left.saturating_sub(1);
            (tx.movement.clone(), tx.polls_left == 0)
        };

        if !ready {
            return Ok(TxStatus::Pending);
        }

        let status = match state.apply(&movement) {
            Ok(()) => TxStatus::Confirmed,
            Err(reason) => TxStatus::Failed(reason),
        };
        if let Some(tx) = state.txs.get_mut(tx_id) {
            tx.status = status.clone();
        }
        debug!(tx_id = %tx_id, status = ?status, "Transaction finalised");
        Ok(status)
    }

    fn name(&self) -> &str {
        BACKEND_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
