//! Premium, coverage and yield-split arithmetic.
//!
//! Every percentage is in basis points and goes through
//! [`Wei::apply_bps`], so premiums, coverage payouts and yield shares
//! all truncate the same way.

use serde::{Deserialize, Serialize};

use crate::types::{Wei, BPS_DENOMINATOR};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Fee and coverage rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Insurance premium charged at opt-in (500 = 5%).
    pub premium_bps: u32,
    /// Share of the loser's stake refunded by insurance (9000 = 90%).
    pub coverage_bps: u32,
    /// Share of realised yield paid to the winner; the rest goes to the treasury.
    pub winner_yield_share_bps: u32,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            premium_bps: 500,
            coverage_bps: 9_000,
            winner_yield_share_bps: 10_000,
        }
    }
}

/// How realised yield is divided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YieldSplit {
    pub winner: Wei,
    pub protocol: Wei,
}

impl FeeSchedule {
    /// Reject rates above 100%.
    pub fn validate(&self) -> Result<(), String> {
        let max = BPS_DENOMINATOR as u32;
        for (name, value) in [
            ("premium_bps", self.premium_bps),
            ("coverage_bps", self.coverage_bps),
            ("winner_yield_share_bps", self.winner_yield_share_bps),
        ] {
            if value > max {
                return Err(format!("{name} must be at most {max}, got {value}"));
            }
        }
        Ok(())
    }

    pub fn premium(&self, stake: Wei) -> Wei {
        stake.apply_bps(self.premium_bps)
    }

    pub fn coverage(&self, stake: Wei) -> Wei {
        stake.apply_bps(self.coverage_bps)
    }

    /// The protocol takes the remainder, so the two parts always sum to `earned`.
    pub fn split_yield(&self, earned: Wei) -> YieldSplit {
        let winner = earned.apply_bps(self.winner_yield_share_bps);
        YieldSplit {
            winner,
            protocol: earned.saturating_sub(winner),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
