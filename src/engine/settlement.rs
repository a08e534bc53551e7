//! Settlement executor.
//!
//! Runs an ordered list of custody instructions against the ledger for
//! one lifecycle operation. Each step gets a stable idempotency key
//! derived from the operation id and its position, so retries and
//! resumption never move funds twice.
//!
//! Failure handling depends on how far the plan got:
//! - while every completed step is reversible (escrow, yield deposit or
//!   withdrawal) the completed steps are undone in reverse order and the
//!   operation fails;
//! - once a payout, premium or coverage transfer has gone out, the plan
//!   can only roll forward, so the operation is parked and `resume`
//!   re-submits the failed step under the same key. A step the ledger
//!   keeps rejecting stalls the plan after `max_roll_forward` runs.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::fees::FeeSchedule;
use crate::ledger::{IdempotencyKey, LedgerGateway, LedgerReceipt, TxId, TxStatus};
use crate::types::{Address, LedgerError, Wei};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Retry and confirmation-polling budget for ledger calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after a transient failure.
    pub max_retries: u32,
    /// Base backoff; attempt `n` waits `n × retry_backoff`.
    pub retry_backoff: Duration,
    /// Status polls before an unconfirmed transaction is parked.
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    /// Runs in which a post-payout step may be rejected before the plan
    /// is handed over for manual reconciliation.
    pub max_roll_forward: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
            poll_attempts: 10,
            poll_interval: Duration::from_millis(500),
            max_roll_forward: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

/// Which part of the realised yield rides on a payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum YieldShare {
    None,
    /// The winner's share per `winner_yield_share_bps`.
    Winner,
    /// The remainder after the winner's share.
    Protocol,
    /// Everything (cancellation sends all yield to the treasury).
    All,
}

/// One custody instruction in a settlement plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Escrow { party: Address, amount: Wei },
    DepositToYield { amount: Wei },
    WithdrawFromYield { amount: Wei },
    /// Pays `base` plus the selected share of the yield realised earlier
    /// in the same plan.
    Payout { to: Address, base: Wei, share: YieldShare },
    ChargePremium { party: Address, amount: Wei },
    PayCoverage { party: Address, amount: Wei },
}

impl Instruction {
    fn label(&self) -> &'static str {
        match self {
            Instruction::Escrow { .. } => "escrow",
            Instruction::DepositToYield { .. } => "yield-deposit",
            Instruction::WithdrawFromYield { .. } => "yield-withdraw",
            Instruction::Payout { .. } => "payout",
            Instruction::ChargePremium { .. } => "premium",
            Instruction::PayCoverage { .. } => "coverage",
        }
    }

    /// Funds that left custody cannot be pulled back.
    fn is_reversible(&self) -> bool {
        matches!(
            self,
            Instruction::Escrow { .. }
                | Instruction::DepositToYield { .. }
                | Instruction::WithdrawFromYield { .. }
        )
    }

    /// The instruction that undoes this one, for `amount` actually moved.
    fn compensation(&self, amount: Wei) -> Option<Instruction> {
        match self {
            Instruction::Escrow { party, .. } => Some(Instruction::Payout {
                to: party.clone(),
                base: amount,
                share: YieldShare::None,
            }),
            Instruction::DepositToYield { .. } => Some(Instruction::WithdrawFromYield { amount }),
            Instruction::WithdrawFromYield { .. } => Some(Instruction::DepositToYield { amount }),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Escrow { party, amount } => write!(f, "escrow {amount} from {party}"),
            Instruction::DepositToYield { amount } => write!(f, "deposit {amount} to yield"),
            Instruction::WithdrawFromYield { amount } => write!(f, "withdraw {amount} from yield"),
            Instruction::Payout { to, base, share } => {
                write!(f, "pay {base} (+{share:?} yield) to {to}")
            }
            Instruction::ChargePremium { party, amount } => {
                write!(f, "charge {amount} premium to {party}")
            }
            Instruction::PayCoverage { party, amount } => write!(f, "pay {amount} coverage to {party}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CompletedStep {
    index: usize,
    instruction: Instruction,
    amount: Wei,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InFlight {
    tx_id: TxId,
    amount: Wei,
    yield_earned: Wei,
}

/// How far a plan has run. Carried across parking, resumption and
/// restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    next_step: usize,
    completed: Vec<CompletedStep>,
    in_flight: Option<InFlight>,
    /// Runs that ended with a post-payout step rejected.
    #[serde(default)]
    rejected_runs: u32,
    /// Yield realised by a `WithdrawFromYield` step.
    pub yield_earned: Wei,
    /// Backend fees reported by every receipt, compensation included.
    pub fees: Wei,
}

impl Progress {
    /// Transaction the plan is waiting on, if any.
    pub fn awaiting(&self) -> Option<&TxId> {
        self.in_flight.as_ref().map(|f| &f.tx_id)
    }

    /// `(recipient, amount)` for every payout or coverage transfer made.
    pub fn transfers(&self) -> Vec<(Address, Wei)> {
        self.completed
            .iter()
            .filter_map(|step| match &step.instruction {
                Instruction::Payout { to, .. } => Some((to.clone(), step.amount)),
                Instruction::PayCoverage { party, .. } => Some((party.clone(), step.amount)),
                _ => None,
            })
            .collect()
    }

    fn complete(&mut self, instruction: Instruction, amount: Wei, yield_earned: Wei) {
        if matches!(instruction, Instruction::WithdrawFromYield { .. }) {
            self.yield_earned = yield_earned;
        }
        self.completed.push(CompletedStep {
            index: self.next_step,
            instruction,
            amount,
        });
        self.next_step += 1;
    }

    fn past_point_of_no_return(&self) -> bool {
        self.completed.iter().any(|s| !s.instruction.is_reversible())
    }
}

/// Result of running (or resuming) a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every step confirmed; the registry may commit.
    Completed,
    /// Waiting on the given transaction, or (with `None`) on a retry of a
    /// step that failed after funds had already gone out.
    Parked(Option<TxId>),
    /// Funds went out and the next step is still rejected after the
    /// roll-forward budget. Needs an operator.
    Stalled(LedgerError),
    /// Nothing moved, or everything that moved has been undone.
    Failed(LedgerError),
}

struct Submitted {
    receipt: LedgerReceipt,
    yield_earned: Wei,
}

impl From<LedgerReceipt> for Submitted {
    fn from(receipt: LedgerReceipt) -> Self {
        Submitted {
            receipt,
            yield_earned: Wei::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Settlement<'a> {
    ledger: &'a dyn LedgerGateway,
    policy: &'a RetryPolicy,
    fees: &'a FeeSchedule,
}

impl<'a> Settlement<'a> {
    pub fn new(ledger: &'a dyn LedgerGateway, policy: &'a RetryPolicy, fees: &'a FeeSchedule) -> Self {
        Self { ledger, policy, fees }
    }

    /// Run `plan` from wherever `progress` left off.
    pub async fn run(&self, op_id: &Uuid, plan: &[Instruction], progress: &mut Progress) -> RunOutcome {
        if let Some(in_flight) = progress.in_flight.take() {
            let Some(instruction) = plan.get(progress.next_step).cloned() else {
                return RunOutcome::Completed;
            };
            match self.await_confirmation(&in_flight.tx_id).await {
                Ok(true) => progress.complete(instruction, in_flight.amount, in_flight.yield_earned),
                Ok(false) => {
                    let tx_id = in_flight.tx_id.clone();
                    progress.in_flight = Some(in_flight);
                    return RunOutcome::Parked(Some(tx_id));
                }
                Err(e) => return self.abort(op_id, progress, e).await,
            }
        }

        while let Some(instruction) = plan.get(progress.next_step) {
            let amount = self.amount_for(instruction, progress);
            if amount.is_zero() {
                debug!(op_id = %op_id, step = progress.next_step, "Skipping zero-amount {}", instruction.label());
                progress.next_step += 1;
                continue;
            }

            let key = IdempotencyKey::new(op_id, &format!("{}-{}", progress.next_step, instruction.label()));
            let submitted = match self.submit_with_retry(&key, instruction, amount).await {
                Ok(s) => s,
                Err(e) => return self.abort(op_id, progress, e).await,
            };
            progress.fees = progress.fees.saturating_add(submitted.receipt.fee);

            let tx_id = submitted.receipt.tx_id;
            match submitted.receipt.status {
                TxStatus::Confirmed => {}
                TxStatus::Failed(reason) => {
                    let err = LedgerError::TransactionFailed { tx_id: tx_id.0, reason };
                    return self.abort(op_id, progress, err).await;
                }
                TxStatus::Pending => match self.await_confirmation(&tx_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(op_id = %op_id, tx_id = %tx_id, "Ledger transaction unconfirmed; parking operation");
                        progress.in_flight = Some(InFlight {
                            tx_id: tx_id.clone(),
                            amount,
                            yield_earned: submitted.yield_earned,
                        });
                        return RunOutcome::Parked(Some(tx_id));
                    }
                    Err(e) => return self.abort(op_id, progress, e).await,
                },
            }

            debug!(op_id = %op_id, tx_id = %tx_id, "Confirmed: {instruction}");
            progress.complete(instruction.clone(), amount, submitted.yield_earned);
        }

        RunOutcome::Completed
    }

    // -- Internal helpers ------------------------------------------------

    fn amount_for(&self, instruction: &Instruction, progress: &Progress) -> Wei {
        match instruction {
            Instruction::Escrow { amount, .. }
            | Instruction::DepositToYield { amount }
            | Instruction::WithdrawFromYield { amount }
            | Instruction::ChargePremium { amount, .. }
            | Instruction::PayCoverage { amount, .. } => *amount,
            Instruction::Payout { base, share, .. } => {
                let split = self.fees.split_yield(progress.yield_earned);
                let extra = match share {
                    YieldShare::None => Wei::ZERO,
                    YieldShare::Winner => split.winner,
                    YieldShare::Protocol => split.protocol,
                    YieldShare::All => progress.yield_earned,
                };
                base.saturating_add(extra)
            }
        }
    }

    async fn submit(
        &self,
        key: &IdempotencyKey,
        instruction: &Instruction,
        amount: Wei,
    ) -> Result<Submitted, LedgerError> {
        match instruction {
            Instruction::Escrow { party, .. } => self.ledger.escrow(key, party, amount).await.map(Into::into),
            Instruction::DepositToYield { .. } => {
                self.ledger.deposit_to_yield(key, amount).await.map(Into::into)
            }
            Instruction::WithdrawFromYield { .. } => {
                let w = self.ledger.withdraw_from_yield(key, amount).await?;
                Ok(Submitted {
                    receipt: w.receipt,
                    yield_earned: w.yield_earned,
                })
            }
            Instruction::Payout { to, .. } => self.ledger.payout(key, to, amount).await.map(Into::into),
            Instruction::ChargePremium { party, .. } => {
                self.ledger.charge_premium(key, party, amount).await.map(Into::into)
            }
            Instruction::PayCoverage { party, .. } => {
                self.ledger.pay_coverage(key, party, amount).await.map(Into::into)
            }
        }
    }

    /// Retry transient failures with the same key.
    async fn submit_with_retry(
        &self,
        key: &IdempotencyKey,
        instruction: &Instruction,
        amount: Wei,
    ) -> Result<Submitted, LedgerError> {
        let mut attempt = 0u32;
        loop {
            match self.submit(key, instruction, amount).await {
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    warn!(key = %key, attempt, error = %e, "Transient ledger failure, retrying");
                    tokio::time::sleep(self.policy.retry_backoff * attempt).await;
                }
                other => return other,
            }
        }
    }

    /// `Ok(true)` once confirmed, `Ok(false)` if still pending after the
    /// poll budget.
    async fn await_confirmation(&self, tx_id: &TxId) -> Result<bool, LedgerError> {
        for _ in 0..self.policy.poll_attempts {
            tokio::time::sleep(self.policy.poll_interval).await;
            match self.ledger.transaction_status(tx_id).await {
                Ok(TxStatus::Confirmed) => return Ok(true),
                Ok(TxStatus::Pending) => {}
                Ok(TxStatus::Failed(reason)) => {
                    return Err(LedgerError::TransactionFailed {
                        tx_id: tx_id.0.clone(),
                        reason,
                    })
                }
                Err(e) if e.is_transient() => {
                    debug!(tx_id = %tx_id, error = %e, "Status poll failed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    async fn abort(&self, op_id: &Uuid, progress: &mut Progress, err: LedgerError) -> RunOutcome {
        if progress.past_point_of_no_return() {
            if !err.is_transient() {
                progress.rejected_runs += 1;
            }
            if progress.rejected_runs >= self.policy.max_roll_forward {
                error!(
                    op_id = %op_id,
                    step = progress.next_step,
                    rejected_runs = progress.rejected_runs,
                    error = %err,
                    "Settlement step keeps failing after funds were released; needs reconciliation"
                );
                return RunOutcome::Stalled(err);
            }
            error!(
                op_id = %op_id,
                step = progress.next_step,
                error = %err,
                "Settlement step failed after funds were released; parking for resume"
            );
            return RunOutcome::Parked(None);
        }

        if !progress.completed.is_empty() {
            warn!(
                op_id = %op_id,
                steps = progress.completed.len(),
                error = %err,
                "Settlement failed; compensating completed steps"
            );
        }

        for step in progress.completed.iter().rev() {
            let Some(undo) = step.instruction.compensation(step.amount) else {
                continue;
            };
            let key = IdempotencyKey::new(op_id, &format!("{}-undo", step.index));
            match self.submit_with_retry(&key, &undo, step.amount).await {
                Ok(sub) => {
                    progress.fees = progress.fees.saturating_add(sub.receipt.fee);
                    let confirmed = match sub.receipt.status {
                        TxStatus::Confirmed => Ok(true),
                        TxStatus::Pending => self.await_confirmation(&sub.receipt.tx_id).await,
                        TxStatus::Failed(reason) => Err(LedgerError::TransactionFailed {
                            tx_id: sub.receipt.tx_id.0.clone(),
                            reason,
                        }),
                    };
                    match confirmed {
                        Ok(true) => info!(op_id = %op_id, "Compensated: {undo}"),
                        Ok(false) => warn!(
                            op_id = %op_id,
                            tx_id = %sub.receipt.tx_id,
                            "Compensation submitted but unconfirmed: {undo}"
                        ),
                        Err(e) => error!(op_id = %op_id, error = %e, "Compensation failed: {undo}"),
                    }
                }
                Err(e) => error!(op_id = %op_id, error = %e, "Compensation failed: {undo}"),
            }
        }

        progress.completed.clear();
        RunOutcome::Failed(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
