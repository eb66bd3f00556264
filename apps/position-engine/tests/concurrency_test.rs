//! Races between closers, openers and the background loops.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{engine, long, open};
use futures::future::join_all;
use position_engine::domain::OrderSide;
use position_engine::gateway::OrderKind;
use position_engine::risk::RejectReason;
use position_engine::{CloseOutcome, CloseReason, OpenOutcome, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_closes_exit_once() {
    let t = engine();
    open(&t, long("BTCUSDT")).await;
    let engine = Arc::new(t.engine);

    let closers = (0..8).map(|i| {
        let engine = Arc::clone(&engine);
        let reason = if i % 2 == 0 {
            CloseReason::Manual
        } else {
            CloseReason::Emergency
        };
        tokio::spawn(async move { engine.close("BTCUSDT", reason).await })
    });
    let outcomes: Vec<CloseOutcome> = join_all(closers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let closed = outcomes
        .iter()
        .filter(|o| matches!(o, CloseOutcome::Closed(_)))
        .count();
    let skipped = outcomes
        .iter()
        .filter(|o| matches!(o, CloseOutcome::Skipped))
        .count();
    assert_eq!(closed, 1, "{outcomes:?}");
    assert_eq!(skipped, 7);

    let exits = t
        .exchange
        .fills_for("BTCUSDT")
        .into_iter()
        .filter(|f| f.side == OrderSide::Sell)
        .count();
    assert!(exits >= 1);
    assert!(t.exchange.position("BTCUSDT", Side::Long).is_none());
    assert_eq!(t.journal.trades().len(), 1);
    assert!(engine.controller().registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_entries_on_one_symbol_open_once() {
    let t = engine();
    let engine = Arc::new(t.engine);

    let openers = (0..4).map(|_| {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.submit(long("BTCUSDT")).await })
    });
    let outcomes: Vec<OpenOutcome> = join_all(openers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let opened = outcomes.iter().filter(|o| o.is_opened()).count();
    assert_eq!(opened, 1, "{outcomes:?}");
    assert!(outcomes.iter().filter(|o| !o.is_opened()).all(|o| matches!(
        o,
        OpenOutcome::Rejected(RejectReason::AlreadyOpen | RejectReason::EntryInFlight)
    )));

    let entries = t
        .exchange
        .fills_for("BTCUSDT")
        .into_iter()
        .filter(|f| f.side == OrderSide::Buy)
        .map(|f| f.quantity)
        .sum::<Decimal>();
    let position = engine.controller().registry().get("BTCUSDT").unwrap();
    assert_eq!(entries, position.original_qty);
    assert_eq!(t.exchange.open_orders_of("BTCUSDT", OrderKind::StopMarket).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_close_racing_the_monitor_settles_once() {
    let t = engine();
    open(&t, long("BTCUSDT")).await;
    // below the 98 stop: the monitor wants out too
    t.exchange.set_mark_price("BTCUSDT", dec!(97));
    let engine = Arc::new(t.engine);

    let closer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.close("BTCUSDT", CloseReason::Manual).await })
    };
    let ticker = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.monitor().run_once(Utc::now()).await })
    };
    let manual = closer.await.unwrap().unwrap();
    let tick = ticker.await.unwrap();

    let by_monitor = tick.closed.len();
    let by_hand = usize::from(matches!(manual, CloseOutcome::Closed(_)));
    assert_eq!(by_monitor + by_hand, 1, "{manual:?} / {tick:?}");
    assert_eq!(t.journal.trades().len(), 1);
    assert!(engine.controller().registry().is_empty());
    assert!(t.exchange.position("BTCUSDT", Side::Long).is_none());
}
