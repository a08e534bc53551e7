//! Lifecycle engine: the only entry point that changes a bet.
//!
//! Every operation runs the same three phases under the bet's operation
//! lock:
//!
//! 1. validate caller and state against the registry;
//! 2. run the ledger plan (see [`settlement`]);
//! 3. commit the state change to the registry.
//!
//! A plan that cannot confirm within the poll budget is parked with an
//! operation id. Further operations on that bet are refused until
//! [`LifecycleEngine::resume`] completes or fails it. Parked plans are
//! exported with [`LifecycleEngine::parked_operations`] so a restart can
//! pick them up where they stopped.

pub mod clock;
pub mod fees;
pub mod settlement;

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock as AsyncRwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ledger::{LedgerGateway, TxId};
use crate::registry::BetRegistry;
use crate::types::{
    Address, Bet, BetError, BetId, BetStatus, Caller, ConfirmationState, OperationStatus,
    ResolutionCause, Wei,
};
use clock::Clock;
use fees::FeeSchedule;
use settlement::{Instruction, Progress, RetryPolicy, RunOutcome, Settlement, YieldShare};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Protocol constants the engine enforces.
#[derive(Debug, Clone)]
pub struct ProtocolRules {
    pub fees: FeeSchedule,
    /// Minimum bet age before the creator may cancel.
    pub cancel_timeout: ChronoDuration,
    /// The only identity allowed to decide disputes.
    pub arbitrator: Address,
    /// Receives the protocol's share of yield.
    pub treasury: Address,
    /// Whether matched escrow is deposited into the yield facility.
    pub yield_enabled: bool,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Where an operation stands. Also the body of a pending response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRecord {
    pub operation_id: Uuid,
    pub bet_id: Option<BetId>,
    pub action: &'static str,
    pub status: OperationStatus,
    /// Transaction the operation is waiting on, if known.
    pub awaiting: Option<TxId>,
    pub error: Option<String>,
    pub bet: Option<Bet>,
}

/// Result of a lifecycle operation whose ledger work either confirmed or
/// is still in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Confirmed(T),
    Pending(OperationRecord),
}

impl<T> Outcome<T> {
    pub fn confirmed(self) -> Option<T> {
        match self {
            Outcome::Confirmed(v) => Some(v),
            Outcome::Pending(_) => None,
        }
    }

    fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Confirmed(v) => Outcome::Confirmed(f(v)),
            Outcome::Pending(r) => Outcome::Pending(r),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsuranceClaim {
    pub bet: Bet,
    pub payout: Wei,
}

// ---------------------------------------------------------------------------
// Internal bookkeeping
// ---------------------------------------------------------------------------

/// Finished operation records kept for status queries.
pub const DEFAULT_RECORD_LIMIT: usize = 1024;

/// Registry change applied once the ledger plan has confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Commit {
    Create { caller: Caller, stake: Wei, insured: bool },
    Join { bet_id: BetId, participant: Address, insured: bool, yield_deposited: bool },
    Resolve { bet_id: BetId, winner: Address, cause: ResolutionCause },
    /// The confirmation that completed an agreement. Recorded together
    /// with the resolution so a failed settlement leaves no trace.
    ConfirmAndResolve { bet_id: BetId, party: Address, winner: Address },
    Cancel { bet_id: BetId },
    ClaimInsurance { bet_id: BetId, claimant: Address },
}

impl Commit {
    fn bet_id(&self) -> Option<BetId> {
        match self {
            Commit::Create { .. } => None,
            Commit::Join { bet_id, .. }
            | Commit::Resolve { bet_id, .. }
            | Commit::ConfirmAndResolve { bet_id, .. }
            | Commit::Cancel { bet_id }
            | Commit::ClaimInsurance { bet_id, .. } => Some(*bet_id),
        }
    }

    fn action(&self) -> &'static str {
        match self {
            Commit::Create { .. } => "propose",
            Commit::Join { .. } => "join",
            Commit::Resolve { .. } | Commit::ConfirmAndResolve { .. } => "resolve",
            Commit::Cancel { .. } => "cancel",
            Commit::ClaimInsurance { .. } => "claim insurance",
        }
    }
}

/// A parked plan with everything needed to finish it, including after a
/// restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkedOperation {
    operation_id: Uuid,
    plan: Vec<Instruction>,
    progress: Progress,
    commit: Commit,
    /// Set once the plan stalled after releasing funds.
    #[serde(default)]
    stalled: Option<String>,
}

impl ParkedOperation {
    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn bet_id(&self) -> Option<BetId> {
        self.commit.bet_id()
    }

    fn record(&self) -> OperationRecord {
        OperationRecord {
            operation_id: self.operation_id,
            bet_id: self.commit.bet_id(),
            action: self.commit.action(),
            status: if self.stalled.is_some() {
                OperationStatus::NeedsReconciliation
            } else {
                OperationStatus::Pending
            },
            awaiting: self.progress.awaiting().cloned(),
            error: self.stalled.clone(),
            bet: None,
        }
    }
}

#[derive(Default)]
struct Operations {
    records: HashMap<Uuid, OperationRecord>,
    parked: HashMap<Uuid, ParkedOperation>,
    by_bet: HashMap<BetId, Uuid>,
    /// Parked operations a `resume` is currently driving.
    running: HashSet<Uuid>,
    /// Finished records, oldest first.
    finished: VecDeque<Uuid>,
}

impl Operations {
    /// Register parked work and its bet lock. Replaces any earlier copy.
    fn park(&mut self, work: ParkedOperation) -> OperationRecord {
        let record = work.record();
        if let Some(id) = work.bet_id() {
            self.by_bet.insert(id, work.operation_id);
        }
        self.running.remove(&work.operation_id);
        self.records.insert(work.operation_id, record.clone());
        self.parked.insert(work.operation_id, work);
        record
    }

    /// Drop the parked work and release the bet. The record stays queryable
    /// until `limit` newer operations have finished.
    fn finish(&mut self, operation_id: Uuid, limit: usize) {
        if let Some(work) = self.parked.remove(&operation_id) {
            if let Some(id) = work.bet_id() {
                self.by_bet.remove(&id);
            }
        }
        self.running.remove(&operation_id);
        self.finished.push_back(operation_id);
        while self.finished.len() > limit {
            if let Some(old) = self.finished.pop_front() {
                self.records.remove(&old);
            }
        }
    }
}

/// One async mutex per bet, held from validation through commit.
#[derive(Default)]
struct BetLocks {
    inner: Mutex<HashMap<BetId, Arc<AsyncMutex<()>>>>,
}

impl BetLocks {
    async fn acquire(&self, id: BetId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct LifecycleEngine {
    registry: Arc<dyn BetRegistry>,
    ledger: Arc<dyn LedgerGateway>,
    clock: Arc<dyn Clock>,
    rules: ProtocolRules,
    policy: RetryPolicy,
    locks: BetLocks,
    operations: Mutex<Operations>,
    record_limit: usize,
    /// Held shared by every running plan from first ledger call to commit,
    /// and exclusively while state is captured for persistence.
    in_flight: AsyncRwLock<()>,
}

impl LifecycleEngine {
    pub fn new(
        registry: Arc<dyn BetRegistry>,
        ledger: Arc<dyn LedgerGateway>,
        clock: Arc<dyn Clock>,
        rules: ProtocolRules,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            ledger,
            clock,
            rules,
            policy,
            locks: BetLocks::default(),
            operations: Mutex::new(Operations::default()),
            record_limit: DEFAULT_RECORD_LIMIT,
            in_flight: AsyncRwLock::new(()),
        }
    }

    /// Keep at most `limit` finished operation records.
    pub fn with_record_limit(mut self, limit: usize) -> Self {
        self.record_limit = limit;
        self
    }

    pub fn rules(&self) -> &ProtocolRules {
        &self.rules
    }

    // -- Queries ---------------------------------------------------------

    pub async fn get(&self, bet_id: BetId) -> Result<Bet, BetError> {
        self.registry.get(bet_id).await
    }

    pub async fn list(&self) -> Vec<Bet> {
        self.registry.list().await
    }

    /// Status of an operation that was parked at some point.
    pub fn operation(&self, operation_id: Uuid) -> Result<OperationRecord, BetError> {
        self.ops()
            .records
            .get(&operation_id)
            .cloned()
            .ok_or(BetError::OperationNotFound(operation_id))
    }

    /// Operations still waiting on the ledger.
    pub fn pending_operations(&self) -> Vec<OperationRecord> {
        let ops = self.ops();
        let mut pending: Vec<_> = ops
            .parked
            .keys()
            .filter_map(|id| ops.records.get(id))
            .filter(|r| r.status == OperationStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.bet_id);
        pending
    }

    /// Every parked operation, stalled ones included, for persistence.
    pub fn parked_operations(&self) -> Vec<ParkedOperation> {
        let mut parked: Vec<_> = self.ops().parked.values().cloned().collect();
        parked.sort_by_key(|p| (p.bet_id(), p.operation_id));
        parked
    }

    /// Wait until no plan is between ledger and registry, then run `capture`
    /// with the parked operations. Anything `capture` reads from the
    /// registry or ledger agrees with that list.
    pub async fn quiescent<T>(&self, capture: impl FnOnce(Vec<ParkedOperation>) -> T) -> T {
        let _exclusive = self.in_flight.write().await;
        capture(self.parked_operations())
    }

    /// Re-register operations saved by `parked_operations`. Their bets stay
    /// locked until each one is resumed to completion.
    pub fn restore_parked(&self, parked: Vec<ParkedOperation>) {
        let mut ops = self.ops();
        for work in parked {
            let record = ops.park(work);
            info!(
                operation_id = %record.operation_id,
                bet_id = ?record.bet_id,
                action = record.action,
                status = %record.status,
                "Restored parked operation"
            );
        }
    }

    // -- Lifecycle operations -------------------------------------------

    /// Open a bet: escrow the creator's stake, then charge the premium if
    /// insured.
    pub async fn propose(
        &self,
        caller: &Caller,
        stake_amount: Wei,
        insured: bool,
    ) -> Result<Outcome<Bet>, BetError> {
        let creator = caller.identity()?.clone();
        if stake_amount.is_zero() || Bet::pot_for(stake_amount).is_none() {
            return Err(BetError::InvalidAmount);
        }

        let mut plan = vec![Instruction::Escrow {
            party: creator.clone(),
            amount: stake_amount,
        }];
        if insured {
            plan.push(Instruction::ChargePremium {
                party: creator.clone(),
                amount: self.rules.fees.premium(stake_amount),
            });
        }

        let commit = Commit::Create {
            caller: caller.clone(),
            stake: stake_amount,
            insured,
        };
        self.execute(plan, commit).await
    }

    /// Take the open seat on a proposed bet.
    ///
    /// `posted_stake`, when given, must equal the bet's stake.
    pub async fn join(
        &self,
        caller: &Caller,
        bet_id: BetId,
        insured: bool,
        posted_stake: Option<Wei>,
    ) -> Result<Outcome<Bet>, BetError> {
        let participant = caller.identity()?.clone();
        let _guard = self.locks.acquire(bet_id).await;
        self.ensure_idle(bet_id)?;

        let bet = self.registry.get(bet_id).await?;
        bet.check_joinable(&participant)?;
        if let Some(actual) = posted_stake {
            if actual != bet.stake_amount {
                return Err(BetError::StakeMismatch {
                    expected: bet.stake_amount,
                    actual,
                });
            }
        }

        let mut plan = vec![Instruction::Escrow {
            party: participant.clone(),
            amount: bet.stake_amount,
        }];
        if self.rules.yield_enabled {
            plan.push(Instruction::DepositToYield { amount: bet.pot() });
        }
        if insured {
            plan.push(Instruction::ChargePremium {
                party: participant.clone(),
                amount: self.rules.fees.premium(bet.stake_amount),
            });
        }

        let commit = Commit::Join {
            bet_id,
            participant,
            insured,
            yield_deposited: self.rules.yield_enabled,
        };
        self.execute(plan, commit).await
    }

    /// Record the caller's belief of the winner.
    ///
    /// Agreement settles the bet and records the final confirmation in the
    /// same registry update, so a failed settlement leaves the bet exactly
    /// as it was. Conflicting confirmations move it to `Disputed`.
    pub async fn confirm(
        &self,
        caller: &Caller,
        bet_id: BetId,
        claimed_winner: &Address,
    ) -> Result<Outcome<Bet>, BetError> {
        let party = caller.identity()?.clone();
        let _guard = self.locks.acquire(bet_id).await;
        self.ensure_idle(bet_id)?;

        let bet = self.registry.get(bet_id).await?;
        let mut draft = bet.clone();
        draft.apply_confirmation(&party, claimed_winner)?;

        match draft.confirmation_state() {
            ConfirmationState::Incomplete => {
                let bet = self
                    .registry
                    .record_confirmation(bet_id, &party, claimed_winner)
                    .await?;
                debug!(bet_id = %bet_id, party = %party, winner = %claimed_winner, "Confirmation recorded");
                Ok(Outcome::Confirmed(bet))
            }
            ConfirmationState::Conflicting => {
                self.registry
                    .record_confirmation(bet_id, &party, claimed_winner)
                    .await?;
                let bet = self.registry.mark_disputed(bet_id, self.clock.now()).await?;
                warn!(bet_id = %bet_id, "Confirmations conflict; bet disputed");
                Ok(Outcome::Confirmed(bet))
            }
            ConfirmationState::Agreed(winner) => {
                let commit = Commit::ConfirmAndResolve {
                    bet_id,
                    party,
                    winner: winner.clone(),
                };
                self.settle_resolution(&bet, winner, commit).await
            }
        }
    }

    /// Either party may escalate a matched bet to the arbitrator.
    pub async fn raise_dispute(&self, caller: &Caller, bet_id: BetId) -> Result<Bet, BetError> {
        let party = caller.identity()?.clone();
        let _guard = self.locks.acquire(bet_id).await;
        self.ensure_idle(bet_id)?;

        let bet = self.registry.get(bet_id).await?;
        if !bet.is_party(&party) {
            return Err(BetError::NotAParty(party));
        }
        let bet = self.registry.mark_disputed(bet_id, self.clock.now()).await?;
        info!(bet_id = %bet_id, raised_by = %party, "Dispute raised");
        Ok(bet)
    }

    /// Decide a disputed bet. Arbitrator only.
    pub async fn arbitrate(
        &self,
        caller: &Caller,
        bet_id: BetId,
        winner: &Address,
    ) -> Result<Outcome<Bet>, BetError> {
        let who = caller.identity()?;
        if who != &self.rules.arbitrator {
            return Err(BetError::NotArbitrator);
        }
        let _guard = self.locks.acquire(bet_id).await;
        self.ensure_idle(bet_id)?;

        let bet = self.registry.get(bet_id).await?;
        if bet.status != BetStatus::Disputed {
            return Err(BetError::InvalidTransition {
                id: bet_id,
                status: bet.status,
                action: "arbitrate",
            });
        }
        if !bet.is_party(winner) {
            return Err(BetError::InvalidWinner(winner.clone()));
        }
        let commit = Commit::Resolve {
            bet_id,
            winner: winner.clone(),
            cause: ResolutionCause::ArbitratorDecision,
        };
        self.settle_resolution(&bet, winner.clone(), commit).await
    }

    /// Creator-only refund once the bet has aged past the cancellation
    /// timeout. Realised yield goes to the treasury.
    pub async fn cancel(&self, caller: &Caller, bet_id: BetId) -> Result<Outcome<Bet>, BetError> {
        let who = caller.identity()?.clone();
        let _guard = self.locks.acquire(bet_id).await;
        self.ensure_idle(bet_id)?;

        let bet = self.registry.get(bet_id).await?;
        if !bet.is_creator(&who) {
            return Err(BetError::NotCreator);
        }
        if !matches!(bet.status, BetStatus::Proposed | BetStatus::Matched) {
            return Err(BetError::InvalidTransition {
                id: bet_id,
                status: bet.status,
                action: "cancel",
            });
        }
        let elapsed = self.clock.now() - bet.created_at;
        if elapsed < self.rules.cancel_timeout {
            let remaining = (self.rules.cancel_timeout - elapsed).num_seconds().max(1);
            return Err(BetError::CancellationTooEarly {
                id: bet_id,
                remaining_secs: remaining,
            });
        }

        let mut plan = Vec::new();
        if bet.yield_deposited {
            plan.push(Instruction::WithdrawFromYield { amount: bet.pot() });
        }
        plan.push(Instruction::Payout {
            to: bet.creator.clone(),
            base: bet.stake_amount,
            share: YieldShare::None,
        });
        if let Some(participant) = &bet.participant {
            plan.push(Instruction::Payout {
                to: participant.clone(),
                base: bet.stake_amount,
                share: YieldShare::None,
            });
        }
        if bet.yield_deposited {
            plan.push(Instruction::Payout {
                to: self.rules.treasury.clone(),
                base: Wei::ZERO,
                share: YieldShare::All,
            });
        }

        self.execute(plan, Commit::Cancel { bet_id }).await
    }

    /// Pay the losing, insured party `coverage_bps` of their stake.
    pub async fn claim_insurance(
        &self,
        caller: &Caller,
        bet_id: BetId,
    ) -> Result<Outcome<InsuranceClaim>, BetError> {
        let claimant = caller.identity()?.clone();
        let _guard = self.locks.acquire(bet_id).await;
        self.ensure_idle(bet_id)?;

        let bet = self.registry.get(bet_id).await?;
        bet.check_insurance_claim(&claimant)?;

        let payout = self.rules.fees.coverage(bet.stake_amount);
        let plan = vec![Instruction::PayCoverage {
            party: claimant.clone(),
            amount: payout,
        }];
        let outcome = self
            .execute(plan, Commit::ClaimInsurance { bet_id, claimant })
            .await?;
        Ok(outcome.map(|bet| InsuranceClaim { bet, payout }))
    }

    /// Drive a parked operation forward.
    ///
    /// Returns the operation's record: `Confirmed` once the registry
    /// committed, `Pending` if the ledger still has not confirmed,
    /// `Failed` after compensation, or `NeedsReconciliation` once a plan
    /// that already released funds has stalled.
    pub async fn resume(&self, operation_id: Uuid) -> Result<OperationRecord, BetError> {
        let bet_id = {
            let ops = self.ops();
            match ops.parked.get(&operation_id) {
                Some(work) if work.stalled.is_none() => work.bet_id(),
                _ => {
                    return ops
                        .records
                        .get(&operation_id)
                        .cloned()
                        .ok_or(BetError::OperationNotFound(operation_id))
                }
            }
        };

        let _guard = match bet_id {
            Some(id) => Some(self.locks.acquire(id).await),
            None => None,
        };
        // Another resume may have finished or claimed it while we waited.
        let claimed = {
            let mut ops = self.ops();
            let work = ops
                .parked
                .get(&operation_id)
                .filter(|w| w.stalled.is_none())
                .cloned();
            match work {
                Some(work) if ops.running.insert(operation_id) => Some(work),
                _ => None,
            }
        };
        let Some(mut work) = claimed else {
            return self.operation(operation_id);
        };

        let _running = self.in_flight.read().await;
        let outcome = self
            .settlement()
            .run(&operation_id, &work.plan, &mut work.progress)
            .await;

        match outcome {
            RunOutcome::Completed => {
                let committed = self.commit(&work.commit, &work.progress).await;
                let mut ops = self.ops();
                let mut record = work.record();
                match committed {
                    Ok(bet) => {
                        info!(operation_id = %operation_id, bet_id = %bet.id, "Parked operation confirmed");
                        record.status = OperationStatus::Confirmed;
                        record.bet_id = Some(bet.id);
                        record.bet = Some(bet);
                    }
                    Err(e) => {
                        record.status = OperationStatus::Failed;
                        record.error = Some(e.to_string());
                    }
                }
                record.awaiting = None;
                ops.records.insert(operation_id, record.clone());
                ops.finish(operation_id, self.record_limit);
                Ok(record)
            }
            RunOutcome::Parked(_) => {
                debug!(operation_id = %operation_id, "Operation still pending");
                Ok(self.ops().park(work))
            }
            RunOutcome::Stalled(e) => {
                error!(operation_id = %operation_id, bet_id = ?bet_id, error = %e, "Parked operation needs reconciliation");
                work.stalled = Some(e.to_string());
                Ok(self.ops().park(work))
            }
            RunOutcome::Failed(e) => {
                warn!(operation_id = %operation_id, error = %e, "Parked operation failed");
                let bet = match bet_id {
                    Some(id) => self.registry.get(id).await.ok(),
                    None => None,
                };
                let mut record = work.record();
                record.status = OperationStatus::Failed;
                record.awaiting = None;
                record.error = Some(e.to_string());
                record.bet = bet;
                let mut ops = self.ops();
                ops.records.insert(operation_id, record.clone());
                ops.finish(operation_id, self.record_limit);
                Ok(record)
            }
        }
    }

    // -- Internal helpers ------------------------------------------------

    fn ops(&self) -> std::sync::MutexGuard<'_, Operations> {
        self.operations.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settlement(&self) -> Settlement<'_> {
        Settlement::new(self.ledger.as_ref(), &self.policy, &self.rules.fees)
    }

    fn ensure_idle(&self, bet_id: BetId) -> Result<(), BetError> {
        if self.ops().by_bet.contains_key(&bet_id) {
            return Err(BetError::OperationPending(bet_id));
        }
        Ok(())
    }

    /// Release the pot to the winner, with the winner's share of any yield;
    /// the rest of the yield goes to the treasury.
    async fn settle_resolution(
        &self,
        bet: &Bet,
        winner: Address,
        commit: Commit,
    ) -> Result<Outcome<Bet>, BetError> {
        let mut plan = Vec::new();
        if bet.yield_deposited {
            plan.push(Instruction::WithdrawFromYield { amount: bet.pot() });
        }
        plan.push(Instruction::Payout {
            to: winner.clone(),
            base: bet.pot(),
            share: if bet.yield_deposited { YieldShare::Winner } else { YieldShare::None },
        });
        if bet.yield_deposited {
            plan.push(Instruction::Payout {
                to: self.rules.treasury.clone(),
                base: Wei::ZERO,
                share: YieldShare::Protocol,
            });
        }

        self.execute(plan, commit).await
    }

    async fn execute(&self, plan: Vec<Instruction>, commit: Commit) -> Result<Outcome<Bet>, BetError> {
        let _running = self.in_flight.read().await;
        let operation_id = Uuid::new_v4();
        let mut progress = Progress::default();
        let outcome = self.settlement().run(&operation_id, &plan, &mut progress).await;

        match outcome {
            RunOutcome::Completed => {
                let bet = self.commit(&commit, &progress).await?;
                Ok(Outcome::Confirmed(bet))
            }
            RunOutcome::Parked(_) => {
                info!(
                    operation_id = %operation_id,
                    bet_id = ?commit.bet_id(),
                    action = commit.action(),
                    "Operation parked awaiting ledger confirmation"
                );
                let work = ParkedOperation {
                    operation_id,
                    plan,
                    progress,
                    commit,
                    stalled: None,
                };
                Ok(Outcome::Pending(self.ops().park(work)))
            }
            RunOutcome::Stalled(e) => {
                error!(
                    operation_id = %operation_id,
                    bet_id = ?commit.bet_id(),
                    action = commit.action(),
                    error = %e,
                    "Operation released funds and then stalled; needs reconciliation"
                );
                let work = ParkedOperation {
                    operation_id,
                    plan,
                    progress,
                    commit,
                    stalled: Some(e.to_string()),
                };
                Ok(Outcome::Pending(self.ops().park(work)))
            }
            RunOutcome::Failed(e) => {
                warn!(action = commit.action(), bet_id = ?commit.bet_id(), error = %e, "Ledger plan failed");
                Err(BetError::Ledger(e))
            }
        }
    }

    async fn commit(&self, commit: &Commit, progress: &Progress) -> Result<Bet, BetError> {
        let now = self.clock.now();
        let result = match commit {
            Commit::Create { caller, stake, insured } => {
                match self.registry.create(caller, *stake, *insured, now).await {
                    Ok(id) => self.registry.get(id).await,
                    Err(e) => Err(e),
                }
            }
            Commit::Join {
                bet_id,
                participant,
                insured,
                yield_deposited,
            } => {
                self.registry
                    .try_join(*bet_id, participant, *insured, *yield_deposited, now)
                    .await
            }
            Commit::Resolve { bet_id, winner, cause } => {
                self.registry
                    .finalize(*bet_id, winner, *cause, progress.yield_earned, now)
                    .await
            }
            Commit::ConfirmAndResolve { bet_id, party, winner } => {
                self.registry
                    .finalize_confirmed(*bet_id, party, winner, progress.yield_earned, now)
                    .await
            }
            Commit::Cancel { bet_id } => self.registry.cancel(*bet_id, progress.yield_earned, now).await,
            Commit::ClaimInsurance { bet_id, claimant } => {
                self.registry.mark_insurance_claimed(*bet_id, claimant).await
            }
        };

        match &result {
            Ok(bet) => info!(
                bet_id = %bet.id,
                action = commit.action(),
                status = %bet.status,
                yield_earned = %progress.yield_earned,
                ledger_fees = %progress.fees,
                "Committed"
            ),
            Err(e) => error!(
                action = commit.action(),
                bet_id = ?commit.bet_id(),
                error = %e,
                "Ledger settled but registry refused the commit; reconcile manually"
            ),
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
