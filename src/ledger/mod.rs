//! Ledger gateway: custody operations behind one trait.
//!
//! Defines the `LedgerGateway` trait and provides implementations for:
//! - `SimulatedLedger`: in-memory custody with escrow, yield and insurance pools
//! - `HttpLedgerGateway`: JSON relay to an external custody/chain service

pub mod http;
pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Address, LedgerError, Wei};

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

/// Backend transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub String);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Finality of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Confirmed,
    Pending,
    Failed(String),
}

/// Returned by every custody instruction. The fee is reported apart from
/// the principal so settlement accounting stays exact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub tx_id: TxId,
    pub status: TxStatus,
    pub fee: Wei,
}

/// Result of pulling escrow out of the yield facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldWithdrawal {
    pub receipt: LedgerReceipt,
    pub principal: Wei,
    pub yield_earned: Wei,
}

/// Deduplication key for one custody instruction.
///
/// Retrying with the same key must never move funds twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    pub fn new(operation_id: &uuid::Uuid, step: &str) -> Self {
        IdempotencyKey(format!("{operation_id}:{step}"))
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// Abstraction over value-custody backends.
///
/// All operations may be slow (a chain round-trip) and may fail transiently
/// or permanently. Implementations never retry internally; the lifecycle
/// engine owns the retry policy and reuses the idempotency key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Take `amount` from `party` into escrow custody.
    async fn escrow(
        &self,
        key: &IdempotencyKey,
        party: &Address,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError>;

    /// Move escrowed principal into the yield facility.
    async fn deposit_to_yield(
        &self,
        key: &IdempotencyKey,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError>;

    /// Move principal (plus whatever it earned) back into escrow.
    async fn withdraw_from_yield(
        &self,
        key: &IdempotencyKey,
        amount: Wei,
    ) -> Result<YieldWithdrawal, LedgerError>;

    /// Release escrowed funds to `party`.
    async fn payout(
        &self,
        key: &IdempotencyKey,
        party: &Address,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError>;

    /// Charge an insurance premium from `party` into the insurance pool.
    async fn charge_premium(
        &self,
        key: &IdempotencyKey,
        party: &Address,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError>;

    /// Pay an insurance claim out of the insurance pool.
    async fn pay_coverage(
        &self,
        key: &IdempotencyKey,
        party: &Address,
        amount: Wei,
    ) -> Result<LedgerReceipt, LedgerError>;

    /// Current finality of a previously submitted transaction.
    async fn transaction_status(&self, tx_id: &TxId) -> Result<TxStatus, LedgerError>;

    /// Backend name for logging and identification.
    fn name(&self) -> &str;
}
