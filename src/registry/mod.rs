//! Bet registry: the single source of truth for bet state.
//!
//! Defines the `BetRegistry` trait and an in-memory implementation.
//! Every mutation is a compare-and-set against the bet's current
//! status/participant, applied under that bet's own lock, so unrelated
//! bets never contend and racing writers on one bet get a deterministic
//! winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use crate::types::{
    Address, Bet, BetError, BetId, BetStatus, Caller, ConfirmationState, ResolutionCause, Wei,
};

/// Durable, consistent storage and lookup of bet records.
///
/// Implementations must make each method atomic with respect to
/// concurrent callers on the same bet.
#[async_trait]
pub trait BetRegistry: Send + Sync {
    /// Create a `Proposed` bet owned by the caller.
    async fn create(
        &self,
        caller: &Caller,
        stake_amount: Wei,
        creator_insurance_opted: bool,
        now: DateTime<Utc>,
    ) -> Result<BetId, BetError>;

    async fn get(&self, id: BetId) -> Result<Bet, BetError>;

    /// Set the participant if, and only if, nobody has joined yet.
    async fn try_join(
        &self,
        id: BetId,
        participant: &Address,
        participant_insurance_opted: bool,
        yield_deposited: bool,
        now: DateTime<Utc>,
    ) -> Result<Bet, BetError>;

    /// Record one party's belief of the winner. Only while `Matched`, and
    /// refused once both parties have confirmed.
    async fn record_confirmation(
        &self,
        id: BetId,
        confirming_party: &Address,
        claimed_winner: &Address,
    ) -> Result<Bet, BetError>;

    /// `Matched → Disputed`.
    async fn mark_disputed(&self, id: BetId, now: DateTime<Utc>) -> Result<Bet, BetError>;

    /// Record the confirmation that completes an agreement and resolve the
    /// bet for `winner` in one step. Refused unless the confirmation makes
    /// both parties agree on `winner`. Idempotent once resolved that way.
    async fn finalize_confirmed(
        &self,
        id: BetId,
        confirming_party: &Address,
        winner: &Address,
        yield_earned: Wei,
        now: DateTime<Utc>,
    ) -> Result<Bet, BetError>;

    /// `Matched | Disputed → Resolved`. Idempotent for the same winner.
    async fn finalize(
        &self,
        id: BetId,
        winner: &Address,
        cause: ResolutionCause,
        yield_earned: Wei,
        now: DateTime<Utc>,
    ) -> Result<Bet, BetError>;

    /// `Proposed | Matched → Cancelled`. Timeout eligibility is the engine's call.
    async fn cancel(&self, id: BetId, yield_earned: Wei, now: DateTime<Utc>) -> Result<Bet, BetError>;

    /// Flip the insurance idempotency guard for the losing, insured party.
    async fn mark_insurance_claimed(&self, id: BetId, claimant: &Address) -> Result<Bet, BetError>;

    /// All bets, ordered by id.
    async fn list(&self) -> Vec<Bet>;
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Serializable image of the registry for persistence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub next_id: u64,
    pub bets: Vec<Bet>,
}

// ---------------------------------------------------------------------------
// In-memory registry
// ---------------------------------------------------------------------------

/// Registry backed by a map of individually locked bet records.
///
/// The outer `RwLock` only guards membership (taken for writing on create);
/// per-bet `Mutex`es serialize writes to a single record.
pub struct InMemoryRegistry {
    next_id: AtomicU64,
    bets: RwLock<HashMap<BetId, Arc<Mutex<Bet>>>>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            bets: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild a registry from a persisted snapshot.
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let max_seen = snapshot.bets.iter().map(|b| b.id.0 + 1).max().unwrap_or(0);
        let next_id = snapshot.next_id.max(max_seen);
        let bets = snapshot
            .bets
            .into_iter()
            .map(|b| (b.id, Arc::new(Mutex::new(b))))
            .collect();
        Self {
            next_id: AtomicU64::new(next_id),
            bets: RwLock::new(bets),
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            next_id: self.next_id.load(Ordering::SeqCst),
            bets: self.all_bets(),
        }
    }

    fn all_bets(&self) -> Vec<Bet> {
        let map = self.bets.read().unwrap_or_else(|e| e.into_inner());
        let mut bets: Vec<Bet> = map
            .values()
            .map(|slot| slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .collect();
        bets.sort_by_key(|b| b.id);
        bets
    }

    fn slot(&self, id: BetId) -> Result<Arc<Mutex<Bet>>, BetError> {
        let map = self.bets.read().unwrap_or_else(|e| e.into_inner());
        map.get(&id).cloned().ok_or(BetError::NotFound(id))
    }

    /// Apply `f` to a working copy under the bet's lock and write it back
    /// only if every check passed.
    fn update<F>(&self, id: BetId, f: F) -> Result<Bet, BetError>
    where
        F: FnOnce(&mut Bet) -> Result<(), BetError>,
    {
        let slot = self.slot(id)?;
        let mut current = slot.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = current.clone();
        f(&mut next)?;
        *current = next.clone();
        Ok(next)
    }
}

/// `Matched | Disputed → Resolved`, or a no-op if already resolved for
/// `winner`.
fn resolve(
    bet: &mut Bet,
    winner: &Address,
    cause: ResolutionCause,
    yield_earned: Wei,
    now: DateTime<Utc>,
) -> Result<(), BetError> {
    if !bet.is_party(winner) {
        return Err(BetError::InvalidWinner(winner.clone()));
    }
    match bet.status {
        BetStatus::Resolved if bet.winner.as_ref() == Some(winner) => Ok(()),
        BetStatus::Resolved => Err(BetError::ResolutionConflict(bet.id)),
        BetStatus::Matched | BetStatus::Disputed => {
            bet.status = BetStatus::Resolved;
            bet.winner = Some(winner.clone());
            bet.resolution = Some(cause);
            bet.escrow_balance = Wei::ZERO;
            bet.yield_earned = yield_earned;
            bet.resolved_at = Some(now);
            Ok(())
        }
        status => Err(BetError::InvalidTransition {
            id: bet.id,
            status,
            action: "resolve",
        }),
    }
}

#[async_trait]
impl BetRegistry for InMemoryRegistry {
    async fn create(
        &self,
        caller: &Caller,
        stake_amount: Wei,
        creator_insurance_opted: bool,
        now: DateTime<Utc>,
    ) -> Result<BetId, BetError> {
        let creator = caller.identity()?;
        if stake_amount.is_zero() || Bet::pot_for(stake_amount).is_none() {
            return Err(BetError::InvalidAmount);
        }

        let id = BetId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let bet = Bet::new(id, creator.clone(), stake_amount, creator_insurance_opted, now);

        let mut map = self.bets.write().unwrap_or_else(|e| e.into_inner());
        map.insert(id, Arc::new(Mutex::new(bet)));

        debug!(bet_id = %id, creator = %creator, stake = %stake_amount, "Bet record created");
        Ok(id)
    }

    async fn get(&self, id: BetId) -> Result<Bet, BetError> {
        let slot = self.slot(id)?;
        let bet = slot.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(bet)
    }

    async fn try_join(
        &self,
        id: BetId,
        participant: &Address,
        participant_insurance_opted: bool,
        yield_deposited: bool,
        now: DateTime<Utc>,
    ) -> Result<Bet, BetError> {
        self.update(id, |bet| {
            bet.check_joinable(participant)?;
            bet.participant = Some(participant.clone());
            bet.participant_insurance_opted = participant_insurance_opted;
            bet.status = BetStatus::Matched;
            bet.matched_at = Some(now);
            bet.escrow_balance = bet.pot();
            bet.yield_deposited = yield_deposited;
            Ok(())
        })
    }

    async fn record_confirmation(
        &self,
        id: BetId,
        confirming_party: &Address,
        claimed_winner: &Address,
    ) -> Result<Bet, BetError> {
        self.update(id, |bet| bet.apply_confirmation(confirming_party, claimed_winner))
    }

    async fn mark_disputed(&self, id: BetId, now: DateTime<Utc>) -> Result<Bet, BetError> {
        self.update(id, |bet| {
            if bet.status != BetStatus::Matched {
                return Err(BetError::NotMatched { id, status: bet.status });
            }
            bet.status = BetStatus::Disputed;
            bet.disputed_at = Some(now);
            Ok(())
        })
    }

    async fn finalize(
        &self,
        id: BetId,
        winner: &Address,
        cause: ResolutionCause,
        yield_earned: Wei,
        now: DateTime<Utc>,
    ) -> Result<Bet, BetError> {
        self.update(id, |bet| resolve(bet, winner, cause, yield_earned, now))
    }

    async fn finalize_confirmed(
        &self,
        id: BetId,
        confirming_party: &Address,
        winner: &Address,
        yield_earned: Wei,
        now: DateTime<Utc>,
    ) -> Result<Bet, BetError> {
        self.update(id, |bet| {
            if bet.status == BetStatus::Resolved
                && bet.resolution == Some(ResolutionCause::MutualConfirmation)
            {
                return resolve(bet, winner, ResolutionCause::MutualConfirmation, yield_earned, now);
            }
            bet.apply_confirmation(confirming_party, winner)?;
            if bet.confirmation_state() != ConfirmationState::Agreed(winner.clone()) {
                return Err(BetError::ResolutionConflict(id));
            }
            resolve(bet, winner, ResolutionCause::MutualConfirmation, yield_earned, now)
        })
    }

    async fn cancel(&self, id: BetId, yield_earned: Wei, now: DateTime<Utc>) -> Result<Bet, BetError> {
        self.update(id, |bet| {
            if !matches!(bet.status, BetStatus::Proposed | BetStatus::Matched) {
                return Err(BetError::InvalidTransition {
                    id,
                    status: bet.status,
                    action: "cancel",
                });
            }
            bet.status = BetStatus::Cancelled;
            bet.escrow_balance = Wei::ZERO;
            bet.yield_earned = yield_earned;
            bet.cancelled_at = Some(now);
            Ok(())
        })
    }

    async fn mark_insurance_claimed(&self, id: BetId, claimant: &Address) -> Result<Bet, BetError> {
        self.update(id, |bet| {
            bet.check_insurance_claim(claimant)?;
            bet.insurance_claimed = true;
            Ok(())
        })
    }

    async fn list(&self) -> Vec<Bet> {
        self.all_bets()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
