//! Shared types for the WAGER service.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that registry, ledger,
//! and engine modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

/// Number of fractional digits in one ETH.
pub const ETH_DECIMALS: u32 = 18;

/// 10^18 wei per ETH.
pub const WEI_PER_ETH: u128 = 1_000_000_000_000_000_000;

/// Basis-point denominator (100% = 10 000 bps).
pub const BPS_DENOMINATOR: u128 = 10_000;

/// An amount of the base currency in its smallest indivisible unit.
///
/// All protocol arithmetic happens on `Wei`. Conversion to and from the
/// human-readable ETH string happens only at the API boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Wei(pub u128);

impl Wei {
    pub const ZERO: Wei = Wei(0);

    pub fn new(amount: u128) -> Self {
        Wei(amount)
    }

    /// Whole ETH, for tests and config seeds.
    pub fn from_eth_units(eth: u64) -> Self {
        Wei(eth as u128 * WEI_PER_ETH)
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Wei) -> Option<Wei> {
        self.0.checked_add(other.0).map(Wei)
    }

    pub fn checked_sub(self, other: Wei) -> Option<Wei> {
        self.0.checked_sub(other.0).map(Wei)
    }

    pub fn saturating_add(self, other: Wei) -> Wei {
        Wei(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Wei) -> Wei {
        Wei(self.0.saturating_sub(other.0))
    }

    pub fn checked_mul(self, factor: u128) -> Option<Wei> {
        self.0.checked_mul(factor).map(Wei)
    }

    /// `self × bps / 10 000`, truncated toward zero.
    ///
    /// Split into quotient and remainder so the product never overflows.
    /// Every fee, coverage and yield split goes through this one rounding rule.
    pub fn apply_bps(self, bps: u32) -> Wei {
        let bps = bps as u128;
        let whole = self.0 / BPS_DENOMINATOR;
        let rem = self.0 % BPS_DENOMINATOR;
        Wei(whole * bps + (rem * bps) / BPS_DENOMINATOR)
    }

    /// Parse a decimal ETH string ("1.5", "0.000000000000000001").
    pub fn from_eth_str(s: &str) -> Result<Self, BetError> {
        let trimmed = s.trim();
        let value = Decimal::from_str(trimmed)
            .map_err(|_| BetError::InvalidAmountFormat(trimmed.to_string()))?;
        Self::from_eth(value).map_err(|e| match e {
            BetError::InvalidAmountFormat(_) => BetError::InvalidAmountFormat(trimmed.to_string()),
            other => other,
        })
    }

    /// Convert a decimal ETH value into wei. Rejects negatives and
    /// values with more than 18 fractional digits.
    pub fn from_eth(value: Decimal) -> Result<Self, BetError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(BetError::InvalidAmount);
        }
        let value = value.normalize();
        let scale = value.scale();
        if scale > ETH_DECIMALS {
            return Err(BetError::InvalidAmountFormat(value.to_string()));
        }
        let mantissa = u128::try_from(value.mantissa())
            .map_err(|_| BetError::InvalidAmountFormat(value.to_string()))?;
        mantissa
            .checked_mul(10u128.pow(ETH_DECIMALS - scale))
            .map(Wei)
            .ok_or_else(|| BetError::InvalidAmountFormat(value.to_string()))
    }

    /// Render as a decimal ETH string with trailing zeros trimmed ("2", "0.05").
    pub fn to_eth_string(self) -> String {
        let whole = self.0 / WEI_PER_ETH;
        let frac = self.0 % WEI_PER_ETH;
        if frac == 0 {
            return whole.to_string();
        }
        let frac = format!("{frac:018}");
        format!("{whole}.{}", frac.trim_end_matches('0'))
    }
}

impl fmt::Display for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} wei", self.0)
    }
}

impl From<Wei> for String {
    fn from(w: Wei) -> Self {
        w.0.to_string()
    }
}

impl TryFrom<String> for Wei {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse::<u128>()
            .map(Wei)
            .map_err(|e| format!("invalid wei amount {s:?}: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// A 20-byte account address, stored lowercase with its `0x` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(s: &str) -> Result<Self, BetError> {
        let s = s.trim();
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(|| BetError::InvalidAddress(s.to_string()))?;
        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BetError::InvalidAddress(s.to_string()));
        }
        Ok(Address(format!("0x{}", hex.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = BetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.0
    }
}

impl TryFrom<String> for Address {
    type Error = BetError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

/// Sequential bet identifier, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BetId(pub u64);

impl fmt::Display for BetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BetId {
    type Err = BetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(BetId)
            .map_err(|_| BetError::InvalidBetId(s.to_string()))
    }
}

/// The authenticated identity behind a request.
///
/// Resolved by the API layer from a signed request or session. The core
/// treats it as already verified; an absent identity is `Unauthenticated`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller(Option<Address>);

impl Caller {
    pub fn new(address: Address) -> Self {
        Caller(Some(address))
    }

    pub fn anonymous() -> Self {
        Caller(None)
    }

    pub fn identity(&self) -> Result<&Address, BetError> {
        self.0.as_ref().ok_or(BetError::Unauthenticated)
    }
}

impl From<Address> for Caller {
    fn from(address: Address) -> Self {
        Caller::new(address)
    }
}

// ---------------------------------------------------------------------------
// Bet
// ---------------------------------------------------------------------------

/// Bet lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BetStatus {
    Proposed,
    Matched,
    Resolved,
    Disputed,
    Cancelled,
}

impl BetStatus {
    /// `Resolved` and `Cancelled` never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BetStatus::Resolved | BetStatus::Cancelled)
    }
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetStatus::Proposed => write!(f, "Proposed"),
            BetStatus::Matched => write!(f, "Matched"),
            BetStatus::Resolved => write!(f, "Resolved"),
            BetStatus::Disputed => write!(f, "Disputed"),
            BetStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Why a bet was resolved. Both causes feed the same finalize path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionCause {
    MutualConfirmation,
    ArbitratorDecision,
}

impl fmt::Display for ResolutionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionCause::MutualConfirmation => write!(f, "mutual confirmation"),
            ResolutionCause::ArbitratorDecision => write!(f, "arbitrator decision"),
        }
    }
}

/// Where the two winner confirmations stand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationState {
    /// At least one party has not confirmed yet.
    Incomplete,
    Agreed(Address),
    Conflicting,
}

/// A two-party wager with an escrowed equal stake and a single winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    pub id: BetId,
    pub creator: Address,
    /// Unset ("TBD") until someone joins.
    pub participant: Option<Address>,
    pub stake_amount: Wei,
    pub status: BetStatus,
    pub creator_insurance_opted: bool,
    pub participant_insurance_opted: bool,
    pub creator_confirmed_winner: Option<Address>,
    pub participant_confirmed_winner: Option<Address>,
    pub winner: Option<Address>,
    pub resolution: Option<ResolutionCause>,
    pub insurance_claimed: bool,
    /// Principal held by the ledger on behalf of this bet.
    pub escrow_balance: Wei,
    pub yield_deposited: bool,
    /// Yield realised when the escrow left the yield facility.
    pub yield_earned: Wei,
    pub created_at: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub disputed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Bet {
    pub fn new(
        id: BetId,
        creator: Address,
        stake_amount: Wei,
        creator_insurance_opted: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            creator,
            participant: None,
            stake_amount,
            status: BetStatus::Proposed,
            creator_insurance_opted,
            participant_insurance_opted: false,
            creator_confirmed_winner: None,
            participant_confirmed_winner: None,
            winner: None,
            resolution: None,
            insurance_claimed: false,
            escrow_balance: stake_amount,
            yield_deposited: false,
            yield_earned: Wei::ZERO,
            created_at,
            matched_at: None,
            disputed_at: None,
            resolved_at: None,
            cancelled_at: None,
        }
    }

    pub fn is_creator(&self, who: &Address) -> bool {
        &self.creator == who
    }

    pub fn is_participant(&self, who: &Address) -> bool {
        self.participant.as_ref() == Some(who)
    }

    pub fn is_party(&self, who: &Address) -> bool {
        self.is_creator(who) || self.is_participant(who)
    }

    /// Whether `who` bought insurance on this bet.
    pub fn insured(&self, who: &Address) -> bool {
        if self.is_creator(who) {
            self.creator_insurance_opted
        } else if self.is_participant(who) {
            self.participant_insurance_opted
        } else {
            false
        }
    }

    /// The party that did not win, once a winner is set.
    pub fn loser(&self) -> Option<&Address> {
        let winner = self.winner.as_ref()?;
        if winner == &self.creator {
            self.participant.as_ref()
        } else {
            Some(&self.creator)
        }
    }

    /// Combined escrow once matched: both stakes.
    pub fn pot(&self) -> Wei {
        Self::pot_for(self.stake_amount).unwrap_or(Wei(u128::MAX))
    }

    /// Pot for a stake, `None` when doubling it would overflow. Proposals
    /// with such a stake are refused, so `pot` never hits the cap.
    pub fn pot_for(stake_amount: Wei) -> Option<Wei> {
        stake_amount.0.checked_mul(2).map(Wei)
    }

    /// Set `party`'s belief of the winner. A party may change their mind
    /// until the other side has confirmed too.
    pub fn apply_confirmation(&mut self, party: &Address, claimed_winner: &Address) -> Result<(), BetError> {
        if !self.is_party(party) {
            return Err(BetError::NotAParty(party.clone()));
        }
        if self.status != BetStatus::Matched {
            return Err(BetError::NotMatched { id: self.id, status: self.status });
        }
        if !self.is_party(claimed_winner) {
            return Err(BetError::InvalidWinner(claimed_winner.clone()));
        }
        if self.creator_confirmed_winner.is_some() && self.participant_confirmed_winner.is_some() {
            return Err(BetError::ConfirmationsClosed(self.id));
        }
        if self.is_creator(party) {
            self.creator_confirmed_winner = Some(claimed_winner.clone());
        } else {
            self.participant_confirmed_winner = Some(claimed_winner.clone());
        }
        Ok(())
    }

    /// Whether `participant` may take the open seat on this bet.
    pub fn check_joinable(&self, participant: &Address) -> Result<(), BetError> {
        if self.participant.is_some() {
            return Err(BetError::AlreadyJoined(self.id));
        }
        if self.status != BetStatus::Proposed {
            return Err(BetError::InvalidTransition {
                id: self.id,
                status: self.status,
                action: "join",
            });
        }
        if self.is_creator(participant) {
            return Err(BetError::SelfBet);
        }
        Ok(())
    }

    /// Whether `claimant` is owed the insurance payout: resolved, unclaimed,
    /// the losing party, and opted in.
    pub fn check_insurance_claim(&self, claimant: &Address) -> Result<(), BetError> {
        if self.status != BetStatus::Resolved {
            return Err(BetError::InvalidTransition {
                id: self.id,
                status: self.status,
                action: "claim insurance on",
            });
        }
        if self.insurance_claimed {
            return Err(BetError::AlreadyClaimed(self.id));
        }
        if !self.is_party(claimant) {
            return Err(BetError::NotAParty(claimant.clone()));
        }
        if self.winner.as_ref() == Some(claimant) {
            return Err(BetError::NotEligible("claimant won the bet".into()));
        }
        if !self.insured(claimant) {
            return Err(BetError::NotEligible("claimant did not opt into insurance".into()));
        }
        Ok(())
    }

    pub fn confirmation_state(&self) -> ConfirmationState {
        match (&self.creator_confirmed_winner, &self.participant_confirmed_winner) {
            (Some(a), Some(b)) if a == b => ConfirmationState::Agreed(a.clone()),
            (Some(_), Some(_)) => ConfirmationState::Conflicting,
            _ => ConfirmationState::Incomplete,
        }
    }
}

impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bet #{} [{}] {} vs {} for {} ETH",
            self.id,
            self.status,
            self.creator,
            self.participant
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "TBD".to_string()),
            self.stake_amount.to_eth_string(),
        )
    }
}

/// Metadata kept off the settlement path (title and terms of the wager).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BetMetadata {
    pub title: String,
    pub terms: String,
}

// ---------------------------------------------------------------------------
// Operation outcome
// ---------------------------------------------------------------------------

/// How a lifecycle operation's ledger work stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Confirmed,
    Pending,
    Failed,
    /// Funds were released but the plan could not finish. The bet stays
    /// locked until an operator settles it by hand.
    NeedsReconciliation,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Confirmed => write!(f, "Confirmed"),
            OperationStatus::Pending => write!(f, "Pending"),
            OperationStatus::Failed => write!(f, "Failed"),
            OperationStatus::NeedsReconciliation => write!(f, "NeedsReconciliation"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors reported by a ledger/custody backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Network or node trouble; the same instruction may be retried.
    #[error("Transient ledger error: {0}")]
    Transient(String),

    /// The backend refused the instruction (insufficient funds, invalid party).
    #[error("Ledger rejected instruction: {0}")]
    Rejected(String),

    /// A previously submitted transaction was dropped or reverted.
    #[error("Ledger transaction {tx_id} failed: {reason}")]
    TransactionFailed { tx_id: String, reason: String },
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }
}

/// The five error kinds callers can tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Validation,
    Authorization,
    Conflict,
    Ledger,
    NotFound,
}

/// Domain errors for the bet lifecycle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BetError {
    // -- Validation --
    #[error("Stake amount must be positive and no more than half the representable maximum")]
    InvalidAmount,

    #[error("Malformed amount: {0}")]
    InvalidAmountFormat(String),

    #[error("Stake mismatch: bet requires {expected}, got {actual}")]
    StakeMismatch { expected: Wei, actual: Wei },

    #[error("Creator cannot join their own bet")]
    SelfBet,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid bet id: {0}")]
    InvalidBetId(String),

    #[error("Winner {0} is not a party to this bet")]
    InvalidWinner(Address),

    // -- Authorization --
    #[error("Caller identity could not be established")]
    Unauthenticated,

    #[error("{0} is not a party to this bet")]
    NotAParty(Address),

    #[error("Only the creator may perform this action")]
    NotCreator,

    #[error("Only the arbitrator may resolve disputes")]
    NotArbitrator,

    #[error("Not eligible for insurance payout: {0}")]
    NotEligible(String),

    // -- Conflict --
    #[error("Bet {0} already has a participant")]
    AlreadyJoined(BetId),

    #[error("Bet {id} is {status}, expected Matched")]
    NotMatched { id: BetId, status: BetStatus },

    #[error("Cannot {action} bet {id} while {status}")]
    InvalidTransition { id: BetId, status: BetStatus, action: &'static str },

    #[error("Bet {0} already resolved with a different winner")]
    ResolutionConflict(BetId),

    #[error("Both parties have already confirmed bet {0}")]
    ConfirmationsClosed(BetId),

    #[error("Insurance already claimed on bet {0}")]
    AlreadyClaimed(BetId),

    #[error("Bet {id} cannot be cancelled for another {remaining_secs}s")]
    CancellationTooEarly { id: BetId, remaining_secs: i64 },

    #[error("Bet {0} has a ledger operation awaiting confirmation")]
    OperationPending(BetId),

    // -- Not found --
    #[error("Bet not found: {0}")]
    NotFound(BetId),

    #[error("Operation not found: {0}")]
    OperationNotFound(uuid::Uuid),

    // -- Ledger --
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl BetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BetError::InvalidAmount
            | BetError::InvalidAmountFormat(_)
            | BetError::StakeMismatch { .. }
            | BetError::SelfBet
            | BetError::InvalidAddress(_)
            | BetError::InvalidBetId(_)
            | BetError::InvalidWinner(_) => ErrorKind::Validation,

            BetError::Unauthenticated
            | BetError::NotAParty(_)
            | BetError::NotCreator
            | BetError::NotArbitrator
            | BetError::NotEligible(_) => ErrorKind::Authorization,

            BetError::AlreadyJoined(_)
            | BetError::NotMatched { .. }
            | BetError::InvalidTransition { .. }
            | BetError::ResolutionConflict(_)
            | BetError::ConfirmationsClosed(_)
            | BetError::AlreadyClaimed(_)
            | BetError::CancellationTooEarly { .. }
            | BetError::OperationPending(_) => ErrorKind::Conflict,

            BetError::NotFound(_) | BetError::OperationNotFound(_) => ErrorKind::NotFound,

            BetError::Ledger(_) => ErrorKind::Ledger,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
