//! Race behaviour: concurrent joiners, concurrent bets.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;

use wager::registry::{BetRegistry, InMemoryRegistry};
use wager::types::{BetError, BetStatus, Caller, ErrorKind};

use crate::common::*;

const RACERS: u8 = 32;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_have_exactly_one_winner() {
    let w = World::new(false, 0, RACERS + 2);
    let bet = w.engine.propose(&creator(), eth(1), false).await.unwrap().confirmed().unwrap();

    let attempts = (3..RACERS + 3).map(|n| {
        let engine = w.engine.clone();
        async move { (n, engine.join(&Caller::new(addr(n)), bet.id, false, None).await) }
    });
    let results = join_all(attempts).await;

    let winners: Vec<u8> = results
        .iter()
        .filter(|(_, r)| r.is_ok())
        .map(|(n, _)| *n)
        .collect();
    assert_eq!(winners.len(), 1);
    for (_, result) in results.iter().filter(|(_, r)| r.is_err()) {
        let err = result.as_ref().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(matches!(err, BetError::AlreadyJoined(_)));
    }

    let bet = w.engine.get(bet.id).await.unwrap();
    assert_eq!(bet.status, BetStatus::Matched);
    assert_eq!(bet.participant, Some(addr(winners[0])));
    // Only the winner's stake ever left their account.
    assert_eq!(w.ledger.escrow_pool(), eth(2));
    for n in 3..RACERS + 3 {
        let expected = if n == winners[0] { eth(9) } else { eth(10) };
        assert_eq!(w.balance(n), expected, "account {n}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_try_join_is_compare_and_set() {
    let registry = Arc::new(InMemoryRegistry::new());
    let id = registry
        .create(&creator(), eth(1), false, Utc::now())
        .await
        .unwrap();

    let handles: Vec<_> = (3..RACERS + 3)
        .map(|n| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.try_join(id, &addr(n), false, false, Utc::now()).await })
        })
        .collect();

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(matches!(e, BetError::AlreadyJoined(_))),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unrelated_bets_progress_concurrently() {
    let w = World::new(false, 0, 20);

    // Ten creators, ten joiners, ten independent bets.
    let proposals = (1..=10u8).map(|n| {
        let engine = w.engine.clone();
        async move { engine.propose(&Caller::new(addr(n)), eth(1), false).await }
    });
    let bets: Vec<_> = join_all(proposals)
        .await
        .into_iter()
        .map(|r| r.unwrap().confirmed().unwrap())
        .collect();

    let joins = bets.iter().zip(11..=20u8).map(|(bet, n)| {
        let engine = w.engine.clone();
        let id = bet.id;
        async move { engine.join(&Caller::new(addr(n)), id, false, None).await }
    });
    for result in join_all(joins).await {
        assert_eq!(result.unwrap().confirmed().unwrap().status, BetStatus::Matched);
    }

    let listed = w.engine.list().await;
    assert_eq!(listed.len(), 10);
    assert!(listed.windows(2).all(|p| p[0].id < p[1].id));
    assert_eq!(w.ledger.escrow_pool(), eth(20));
}
