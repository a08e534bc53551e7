//! End-to-end bet lifecycles over the simulated custody backend.

use chrono::Duration as ChronoDuration;
use tokio_test::{assert_err, assert_ok};

use wager::engine::Outcome;
use wager::ledger::simulated::LedgerOp;
use wager::types::{BetError, BetStatus, Caller, ErrorKind, LedgerError, OperationStatus, ResolutionCause, Wei};

use crate::common::*;

#[tokio::test]
async fn test_one_eth_bet_resolved_by_agreement() {
    let w = World::new(false, 0, 2);
    let creator_addr = addr(1);

    let bet = assert_ok!(w.engine.propose(&creator(), eth(1), false).await)
        .confirmed()
        .unwrap();
    assert_eq!(bet.status, BetStatus::Proposed);
    assert_eq!(w.ledger.escrow_pool(), eth(1));

    let bet = assert_ok!(w.engine.join(&participant(), bet.id, false, Some(eth(1))).await)
        .confirmed()
        .unwrap();
    assert_eq!(bet.status, BetStatus::Matched);
    assert!(bet.matched_at.is_some());
    assert_eq!(bet.escrow_balance, eth(2));
    assert_eq!(w.ledger.escrow_pool(), eth(2));

    w.engine.confirm(&creator(), bet.id, &creator_addr).await.unwrap();
    let bet = assert_ok!(w.engine.confirm(&participant(), bet.id, &creator_addr).await)
        .confirmed()
        .unwrap();

    assert_eq!(bet.status, BetStatus::Resolved);
    assert_eq!(bet.winner, Some(creator_addr));
    assert_eq!(bet.resolution, Some(ResolutionCause::MutualConfirmation));
    assert_eq!(w.ledger.escrow_pool(), Wei::ZERO);
    // Creator gets the whole 2 ETH pot, participant nothing back.
    assert_eq!(w.balance(1), eth(11));
    assert_eq!(w.balance(2), eth(9));
}

#[tokio::test]
async fn test_conflicting_confirmations_only_arbitrator_resolves() {
    let w = World::new(false, 0, 3);
    let bet = w.engine.propose(&creator(), eth(1), false).await.unwrap().confirmed().unwrap();
    w.engine.join(&participant(), bet.id, false, None).await.unwrap();

    w.engine.confirm(&creator(), bet.id, &addr(1)).await.unwrap();
    let bet = w.engine.confirm(&participant(), bet.id, &addr(2)).await.unwrap().confirmed().unwrap();
    assert_eq!(bet.status, BetStatus::Disputed);
    assert!(bet.disputed_at.is_some());

    // Neither a party nor an outsider can decide it.
    for who in [creator(), participant(), Caller::new(addr(3))] {
        let err = assert_err!(w.engine.arbitrate(&who, bet.id, &addr(1)).await);
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }
    // A disputed bet no longer accepts confirmations.
    let err = assert_err!(w.engine.confirm(&creator(), bet.id, &addr(1)).await);
    assert!(matches!(err, BetError::NotMatched { .. }));

    let bet = w
        .engine
        .arbitrate(&Caller::new(arbitrator()), bet.id, &addr(2))
        .await
        .unwrap()
        .confirmed()
        .unwrap();
    assert_eq!(bet.status, BetStatus::Resolved);
    assert_eq!(bet.winner, Some(addr(2)));
    assert_eq!(bet.resolution, Some(ResolutionCause::ArbitratorDecision));
    assert_eq!(w.balance(2), eth(11));

    // Final: the arbitrator cannot reverse it.
    let err = assert_err!(
        w.engine
            .arbitrate(&Caller::new(arbitrator()), bet.id, &addr(1))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_explicit_dispute_then_arbitration() {
    let w = World::new(false, 0, 2);
    let bet = w.engine.propose(&creator(), eth(2), false).await.unwrap().confirmed().unwrap();
    w.engine.join(&participant(), bet.id, false, None).await.unwrap();

    let err = assert_err!(w.engine.raise_dispute(&Caller::new(addr(7)), bet.id).await);
    assert!(matches!(err, BetError::NotAParty(_)));

    let bet = assert_ok!(w.engine.raise_dispute(&participant(), bet.id).await);
    assert_eq!(bet.status, BetStatus::Disputed);

    w.engine
        .arbitrate(&Caller::new(arbitrator()), bet.id, &addr(1))
        .await
        .unwrap();
    assert_eq!(w.balance(1), eth(12));
    assert_eq!(w.balance(2), eth(8));
}

#[tokio::test]
async fn test_stake_conservation_with_insurance() {
    let w = World::new(false, 0, 2);
    let stake = eth(1);
    let pool_before = w.ledger.insurance_pool();

    let bet = w.engine.propose(&creator(), stake, true).await.unwrap().confirmed().unwrap();
    w.engine.join(&participant(), bet.id, true, None).await.unwrap();
    w.engine.confirm(&creator(), bet.id, &addr(1)).await.unwrap();
    w.engine.confirm(&participant(), bet.id, &addr(1)).await.unwrap();

    let claim = w
        .engine
        .claim_insurance(&participant(), bet.id)
        .await
        .unwrap()
        .confirmed()
        .unwrap();

    let premium = Wei(50_000_000_000_000_000);
    let coverage = Wei(900_000_000_000_000_000);
    assert_eq!(claim.payout, coverage);

    // Winner receives exactly 2S from escrow; coverage comes from the pool.
    let winner_gain = w.balance(1).0 + premium.0 + stake.0 - eth(STARTING_BALANCE_ETH).0;
    assert_eq!(winner_gain, 2 * stake.0);
    assert_eq!(w.ledger.escrow_pool(), Wei::ZERO);
    assert_eq!(
        w.ledger.insurance_pool().0,
        pool_before.0 + 2 * premium.0 - coverage.0
    );
    assert!(claim.payout.0 <= 2 * stake.0);
}

#[tokio::test]
async fn test_claim_insurance_succeeds_once() {
    let w = World::new(false, 0, 2);
    let bet = w.engine.propose(&creator(), eth(1), true).await.unwrap().confirmed().unwrap();
    w.engine.join(&participant(), bet.id, false, None).await.unwrap();

    // Not resolved yet.
    let err = assert_err!(w.engine.claim_insurance(&creator(), bet.id).await);
    assert_eq!(err.kind(), ErrorKind::Conflict);

    w.engine.confirm(&creator(), bet.id, &addr(2)).await.unwrap();
    w.engine.confirm(&participant(), bet.id, &addr(2)).await.unwrap();

    // The winner and the uninsured are not eligible.
    let err = assert_err!(w.engine.claim_insurance(&participant(), bet.id).await);
    assert!(matches!(err, BetError::NotEligible(_)));

    let first = w.engine.claim_insurance(&creator(), bet.id).await;
    assert!(matches!(first, Ok(Outcome::Confirmed(_))));

    let second = assert_err!(w.engine.claim_insurance(&creator(), bet.id).await);
    assert!(matches!(second, BetError::AlreadyClaimed(_)));
    assert_eq!(w.ledger.call_count(LedgerOp::PayCoverage), 1);
}

#[tokio::test]
async fn test_cancel_after_timeout_returns_principal_only() {
    let w = World::new(true, 100, 2);
    let bet = w.engine.propose(&creator(), eth(1), true).await.unwrap().confirmed().unwrap();
    w.engine.join(&participant(), bet.id, false, None).await.unwrap();
    assert_eq!(w.ledger.yield_principal(), eth(2));

    w.clock.advance(ChronoDuration::hours(23));
    let err = assert_err!(w.engine.cancel(&creator(), bet.id).await);
    assert!(matches!(err, BetError::CancellationTooEarly { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    w.clock.advance(ChronoDuration::hours(1));
    let err = assert_err!(w.engine.cancel(&participant(), bet.id).await);
    assert!(matches!(err, BetError::NotCreator));

    let bet = w.engine.cancel(&creator(), bet.id).await.unwrap().confirmed().unwrap();
    assert_eq!(bet.status, BetStatus::Cancelled);
    assert!(bet.cancelled_at.is_some());

    // Premium stays in the pool; yield goes to the treasury.
    assert_eq!(w.balance(1), Wei(eth(10).0 - 50_000_000_000_000_000));
    assert_eq!(w.balance(2), eth(10));
    assert_eq!(w.ledger.balance_of(&treasury()), Wei(20_000_000_000_000_000));
    assert_eq!(w.ledger.escrow_pool(), Wei::ZERO);
    assert_eq!(w.ledger.yield_principal(), Wei::ZERO);

    // Terminal.
    let err = assert_err!(w.engine.join(&Caller::new(addr(3)), bet.id, false, None).await);
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_resolution_with_yield_splits_to_treasury() {
    let w = World::new(true, 100, 2);
    let bet = w.engine.propose(&creator(), eth(1), false).await.unwrap().confirmed().unwrap();
    w.engine.join(&participant(), bet.id, false, None).await.unwrap();

    w.engine.confirm(&creator(), bet.id, &addr(1)).await.unwrap();
    let bet = w.engine.confirm(&participant(), bet.id, &addr(1)).await.unwrap().confirmed().unwrap();

    // Default schedule gives the winner the whole 0.02 ETH of yield.
    assert_eq!(bet.yield_earned, Wei(20_000_000_000_000_000));
    assert_eq!(w.balance(1), Wei(11_020_000_000_000_000_000));
    assert_eq!(w.ledger.balance_of(&treasury()), Wei::ZERO);
}

#[tokio::test]
async fn test_join_ledger_failure_leaves_registry_untouched() {
    let w = World::new(true, 100, 2);
    let bet = w.engine.propose(&creator(), eth(1), false).await.unwrap().confirmed().unwrap();

    w.ledger
        .fail_next(LedgerOp::DepositToYield, LedgerError::Rejected("facility paused".into()));
    let err = assert_err!(w.engine.join(&participant(), bet.id, false, None).await);
    assert_eq!(err.kind(), ErrorKind::Ledger);

    let bet = w.engine.get(bet.id).await.unwrap();
    assert_eq!(bet.status, BetStatus::Proposed);
    assert!(bet.participant.is_none());
    // The participant's escrow was refunded.
    assert_eq!(w.balance(2), eth(10));
    assert_eq!(w.ledger.escrow_pool(), eth(1));

    // Retrying the whole operation is safe.
    let bet = w.engine.join(&participant(), bet.id, false, None).await.unwrap().confirmed().unwrap();
    assert_eq!(bet.status, BetStatus::Matched);
    assert_eq!(w.ledger.yield_principal(), eth(2));
}

#[tokio::test]
async fn test_resolution_ledger_failure_leaves_registry_unchanged() {
    let w = World::new(true, 100, 2);
    let bet = w.engine.propose(&creator(), eth(1), false).await.unwrap().confirmed().unwrap();
    w.engine.join(&participant(), bet.id, false, None).await.unwrap();

    w.engine.confirm(&creator(), bet.id, &addr(1)).await.unwrap();
    let before = w.engine.get(bet.id).await.unwrap();

    w.ledger
        .fail_next(LedgerOp::WithdrawFromYield, LedgerError::Rejected("facility paused".into()));
    let err = assert_err!(w.engine.confirm(&participant(), bet.id, &addr(1)).await);
    assert!(matches!(err, BetError::Ledger(_)));

    let after = w.engine.get(bet.id).await.unwrap();
    assert_eq!(after, before);
    assert!(after.participant_confirmed_winner.is_none());
    assert_eq!(w.ledger.yield_principal(), eth(2));

    // The agreement settles once the facility is back.
    let bet = w.engine.confirm(&participant(), bet.id, &addr(1)).await.unwrap().confirmed().unwrap();
    assert_eq!(bet.status, BetStatus::Resolved);
    assert_eq!(bet.winner, Some(addr(1)));
    assert_eq!(bet.participant_confirmed_winner, Some(addr(1)));
}

#[tokio::test]
async fn test_votes_are_locked_once_both_parties_confirmed() {
    let w = World::new(false, 0, 2);
    let bet = w.engine.propose(&creator(), eth(1), false).await.unwrap().confirmed().unwrap();
    w.engine.join(&participant(), bet.id, false, None).await.unwrap();

    // A party may change their mind before the other side votes.
    w.engine.confirm(&creator(), bet.id, &addr(2)).await.unwrap();
    let bet = w.engine.confirm(&creator(), bet.id, &addr(1)).await.unwrap().confirmed().unwrap();
    assert_eq!(bet.creator_confirmed_winner, Some(addr(1)));
    assert_eq!(bet.status, BetStatus::Matched);

    let bet = w.engine.confirm(&participant(), bet.id, &addr(2)).await.unwrap().confirmed().unwrap();
    assert_eq!(bet.status, BetStatus::Disputed);

    let err = assert_err!(w.engine.confirm(&participant(), bet.id, &addr(1)).await);
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let bet = w.engine.get(bet.id).await.unwrap();
    assert_eq!(bet.participant_confirmed_winner, Some(addr(2)));
    assert_eq!(w.ledger.escrow_pool(), eth(2));
}

#[tokio::test]
async fn test_transient_failures_are_retried_without_double_escrow() {
    let w = World::new(false, 0, 1);
    w.ledger.fail_next(LedgerOp::Escrow, LedgerError::Transient("timeout".into()));
    w.ledger.fail_next(LedgerOp::Escrow, LedgerError::Transient("timeout".into()));

    let bet = w.engine.propose(&creator(), eth(1), false).await.unwrap().confirmed().unwrap();
    assert_eq!(bet.status, BetStatus::Proposed);
    assert_eq!(w.ledger.call_count(LedgerOp::Escrow), 3);
    assert_eq!(w.ledger.escrow_pool(), eth(1));
    assert_eq!(w.balance(1), eth(9));
}

#[tokio::test]
async fn test_pending_resolution_commits_only_after_confirmation() {
    let w = World::new(false, 0, 2);
    let bet = w.engine.propose(&creator(), eth(1), false).await.unwrap().confirmed().unwrap();
    w.engine.join(&participant(), bet.id, false, None).await.unwrap();
    w.engine.confirm(&creator(), bet.id, &addr(1)).await.unwrap();

    // Three polls per run; the payout needs four.
    w.ledger.set_confirmations_required(4);
    let record = match w.engine.confirm(&participant(), bet.id, &addr(1)).await.unwrap() {
        Outcome::Pending(record) => record,
        Outcome::Confirmed(_) => panic!("settlement should be pending"),
    };
    assert_eq!(record.action, "resolve");
    assert!(record.awaiting.is_some());

    // Not terminal while the payout is unconfirmed.
    assert_eq!(w.engine.get(bet.id).await.unwrap().status, BetStatus::Matched);
    let err = assert_err!(w.engine.raise_dispute(&participant(), bet.id).await);
    assert!(matches!(err, BetError::OperationPending(_)));
    assert_eq!(w.engine.operation(record.operation_id).unwrap().status, OperationStatus::Pending);

    let done = w.engine.resume(record.operation_id).await.unwrap();
    assert_eq!(done.status, OperationStatus::Confirmed);
    let bet = done.bet.unwrap();
    assert_eq!(bet.status, BetStatus::Resolved);
    assert_eq!(w.balance(1), eth(11));
}

#[tokio::test]
async fn test_dropped_transaction_fails_operation() {
    let w = World::new(false, 0, 1);
    w.ledger.set_confirmations_required(10);

    let record = match w.engine.propose(&creator(), eth(1), false).await.unwrap() {
        Outcome::Pending(record) => record,
        Outcome::Confirmed(_) => panic!("proposal should be pending"),
    };
    assert_eq!(record.bet_id, None);

    let tx = w.ledger.pending_transactions();
    assert_eq!(tx.len(), 1);
    w.ledger.drop_transaction(&tx[0]);

    let done = w.engine.resume(record.operation_id).await.unwrap();
    assert_eq!(done.status, OperationStatus::Failed);
    assert!(done.error.is_some());
    assert!(w.engine.list().await.is_empty());
    assert_eq!(w.balance(1), eth(10));
}

#[tokio::test]
async fn test_unknown_bet_and_anonymous_caller() {
    let w = World::new(false, 0, 1);
    let err = assert_err!(w.engine.get(wager::types::BetId(42)).await);
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = assert_err!(w.engine.join(&participant(), wager::types::BetId(42), false, None).await);
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = assert_err!(w.engine.propose(&Caller::anonymous(), eth(1), false).await);
    assert!(matches!(err, BetError::Unauthenticated));
}

#[tokio::test]
async fn test_creator_cannot_join_own_bet() {
    let w = World::new(false, 0, 1);
    let bet = w.engine.propose(&creator(), eth(1), false).await.unwrap().confirmed().unwrap();
    let err = assert_err!(w.engine.join(&creator(), bet.id, false, None).await);
    assert!(matches!(err, BetError::SelfBet));
    assert_eq!(err.kind(), ErrorKind::Validation);
}
