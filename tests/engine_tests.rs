mod common;

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use polycopy::config::{RiskConfig, SizingConfig};
use polycopy::db::{bankroll_repo, risk_repo, trade_repo};
use polycopy::execution::bankroll::VirtualBankroll;
use polycopy::execution::copy_engine::{CopyEngine, CopyEngineConfig};
use polycopy::execution::executor::{Executor, PaperExecutor};
use polycopy::execution::risk_manager::RiskManager;
use polycopy::models::{
    Side, TradeMode, WhaleSignal, WhaleStatsSnapshot, WhaleStatus, WhaleTradeEvent,
};
use polycopy::services::PriceCache;

const WHALE: &str = "0xaaaa000000000000000000000000000000000001";

type EngineParts = (CopyEngine, Arc<VirtualBankroll>, Arc<RiskManager>, PriceCache);

fn engine_setup_with_risk(
    pool: sqlx::PgPool,
    initial: Decimal,
    risk_config: RiskConfig,
) -> EngineParts {
    let bankroll = Arc::new(VirtualBankroll::new(pool.clone(), initial));
    let risk = Arc::new(RiskManager::new(pool.clone(), risk_config, initial));
    let prices = PriceCache::new();
    let sizing = SizingConfig::default();

    let executor = Executor::Paper(PaperExecutor::new(
        Arc::clone(&bankroll),
        sizing.commission_rate,
        sizing.gas_cost_usd,
    ));

    let engine = CopyEngine::new(
        pool,
        executor,
        Arc::clone(&risk),
        Arc::clone(&bankroll),
        prices.clone(),
        CopyEngineConfig {
            mode: TradeMode::Paper,
            risk_score_max: 6,
            sizing,
        },
    );

    (engine, bankroll, risk, prices)
}

fn engine_setup(pool: sqlx::PgPool, initial: Decimal) -> EngineParts {
    engine_setup_with_risk(pool, initial, RiskConfig::default())
}

fn signal(market: &str, side: Side, price: Decimal, external_id: &str) -> WhaleSignal {
    WhaleSignal {
        trade: WhaleTradeEvent {
            wallet: WHALE.into(),
            market_id: market.into(),
            side,
            size_usd: dec!(500),
            price,
            traded_at: Utc::now(),
            trade_external_id: external_id.into(),
        },
        whale_stats: WhaleStatsSnapshot {
            status: WhaleStatus::Ranked,
            risk_score: 3,
            rank_score_norm: Decimal::ONE,
            total_trades: 12,
            total_volume_usd: dec!(2400),
        },
        detected_at: Utc::now(),
    }
}

#[tokio::test]
async fn cold_start_one_qualifying_whale_one_trade() {
    let pool = common::setup_test_db().await;
    let (mut engine, bankroll, _risk, _prices) = engine_setup(pool.clone(), dec!(100));

    // Quarter-Kelly on a top-ranked whale at 0.40 caps at 5% of bankroll.
    engine
        .on_whale_trade(&signal("mkt_1", Side::Buy, dec!(0.40), "s1"))
        .await
        .unwrap();

    assert_eq!(engine.open_position_count(), 1);

    let open = trade_repo::open_trades(&pool).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].size, dec!(5.00));
    assert_eq!(open[0].price, dec!(0.40));
    assert_eq!(open[0].whale_source.as_deref(), Some(WHALE));

    let snapshot = bankroll_repo::latest_snapshot(&pool).await.unwrap().unwrap();
    assert_eq!(snapshot.allocated, dec!(5.00));
    // available = 100 − 5 − commission − gas
    let expected_available = dec!(95) - open[0].commission - open[0].gas_cost_usd;
    assert_eq!(snapshot.available, expected_available);
    assert_eq!(bankroll.open_position_count().await, 1);
}

#[tokio::test]
async fn identical_signals_within_window_open_one_position() {
    let pool = common::setup_test_db().await;
    let (mut engine, _bankroll, _risk, _prices) = engine_setup(pool.clone(), dec!(100));

    let first = signal("mkt_1", Side::Buy, dec!(0.40), "dup");
    let replay = first.clone();

    engine.on_whale_trade(&first).await.unwrap();
    engine.on_whale_trade(&replay).await.unwrap();

    assert_eq!(engine.open_position_count(), 1);
    assert_eq!(trade_repo::open_trades(&pool).await.unwrap().len(), 1);
}

#[tokio::test]
async fn same_direction_repeat_is_ignored_by_default() {
    let pool = common::setup_test_db().await;
    let (mut engine, _bankroll, _risk, _prices) = engine_setup(pool.clone(), dec!(100));

    engine
        .on_whale_trade(&signal("mkt_1", Side::Buy, dec!(0.40), "a"))
        .await
        .unwrap();
    // Different external id and price: not a dedup hit, but same direction.
    engine
        .on_whale_trade(&signal("mkt_1", Side::Buy, dec!(0.42), "b"))
        .await
        .unwrap();

    assert_eq!(engine.open_position_count(), 1);
    assert_eq!(trade_repo::open_trades(&pool).await.unwrap().len(), 1);
}

#[tokio::test]
async fn opposite_signal_closes_the_copied_position() {
    let pool = common::setup_test_db().await;
    let (mut engine, bankroll, _risk, _prices) = engine_setup(pool.clone(), dec!(100));

    engine
        .on_whale_trade(&signal("mkt_1", Side::Buy, dec!(0.40), "open"))
        .await
        .unwrap();
    engine
        .on_whale_trade(&signal("mkt_1", Side::Sell, dec!(0.50), "close"))
        .await
        .unwrap();

    assert_eq!(engine.open_position_count(), 0);
    assert_eq!(bankroll.open_position_count().await, 0);

    let (closed, wins, _losses, realized) = trade_repo::closed_trade_totals(&pool).await.unwrap();
    assert_eq!(closed, 1);
    // 0.40 → 0.50 buy exit is profitable net of fees.
    assert_eq!(wins, 1);
    assert!(realized > Decimal::ZERO);
}

#[tokio::test]
async fn low_quality_whale_is_rejected() {
    let pool = common::setup_test_db().await;
    let (mut engine, _bankroll, _risk, _prices) = engine_setup(pool.clone(), dec!(100));

    let mut weak = signal("mkt_1", Side::Buy, dec!(0.40), "weak");
    weak.whale_stats.risk_score = 8; // above the default ceiling of 6
    engine.on_whale_trade(&weak).await.unwrap();

    let mut unqualified = signal("mkt_2", Side::Buy, dec!(0.40), "unq");
    unqualified.whale_stats.status = WhaleStatus::Discovered;
    engine.on_whale_trade(&unqualified).await.unwrap();

    assert_eq!(engine.open_position_count(), 0);
    assert_eq!(trade_repo::total_trade_count(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn malformed_price_is_skipped() {
    let pool = common::setup_test_db().await;
    let (mut engine, _bankroll, _risk, _prices) = engine_setup(pool.clone(), dec!(100));

    engine
        .on_whale_trade(&signal("mkt_1", Side::Buy, dec!(1.20), "bad"))
        .await
        .unwrap();
    engine
        .on_whale_trade(&signal("mkt_2", Side::Buy, dec!(0), "worse"))
        .await
        .unwrap();

    assert_eq!(engine.open_position_count(), 0);
}

#[tokio::test]
async fn kill_switch_trips_after_three_consecutive_losses() {
    let pool = common::setup_test_db().await;
    let initial = dec!(100);
    let risk = Arc::new(RiskManager::new(pool.clone(), RiskConfig::default(), initial));

    // Three losing closes in a row.
    for i in 0..3 {
        risk.record_outcome(&format!("mkt_{i}"), dec!(2), dec!(-0.50)).await;
    }

    // The fourth trade is refused and a critical event is on record.
    let refused = risk
        .can_trade("mkt_next", dec!(2), TradeMode::Paper, None)
        .await;
    assert!(refused.is_err());
    assert!(risk.is_killed().await);

    let critical = risk_repo::count_critical_since(&pool, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(critical, 1);
}

#[tokio::test]
async fn engine_skips_signals_while_killed_and_records_the_block() {
    let pool = common::setup_test_db().await;
    let (mut engine, _bankroll, risk, _prices) = engine_setup(pool.clone(), dec!(100));

    risk.trigger_kill_switch("manual trigger").await;

    engine
        .on_whale_trade(&signal("mkt_1", Side::Buy, dec!(0.40), "blocked"))
        .await
        .unwrap();

    assert_eq!(engine.open_position_count(), 0);
    assert_eq!(trade_repo::total_trade_count(&pool).await.unwrap(), 0);

    let events = risk_repo::recent_events(&pool, 10).await.unwrap();
    assert!(events.iter().any(|e| e.kind == "risk_block"));
    assert!(events.iter().any(|e| e.kind == "kill_switch" && e.severity == "critical"));
}

#[tokio::test]
async fn kill_switch_with_emergency_unwind_force_closes_positions() {
    let pool = common::setup_test_db().await;
    let risk_config = RiskConfig {
        emergency_unwind: true,
        ..RiskConfig::default()
    };
    let (mut engine, bankroll, risk, prices) =
        engine_setup_with_risk(pool.clone(), dec!(100), risk_config);

    engine
        .on_whale_trade(&signal("mkt_1", Side::Buy, dec!(0.40), "open-a"))
        .await
        .unwrap();
    engine
        .on_whale_trade(&signal("mkt_2", Side::Buy, dec!(0.50), "open-b"))
        .await
        .unwrap();
    assert_eq!(engine.open_position_count(), 2);

    // Both markets have a known price when the switch trips.
    prices.update("mkt_1", dec!(0.45));
    prices.update("mkt_2", dec!(0.48));
    risk.trigger_kill_switch("manual trigger").await;
    engine.handle_kill_switch().await.unwrap();

    // The sweep closed everything without waiting for further signals.
    assert_eq!(engine.open_position_count(), 0);
    assert_eq!(bankroll.open_position_count().await, 0);

    let (closed, _, _, _) = trade_repo::closed_trade_totals(&pool).await.unwrap();
    assert_eq!(closed, 2);
    assert!(trade_repo::open_trades(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn unwind_without_known_price_closes_on_next_priced_signal() {
    let pool = common::setup_test_db().await;
    let risk_config = RiskConfig {
        emergency_unwind: true,
        ..RiskConfig::default()
    };
    let (mut engine, bankroll, risk, _prices) =
        engine_setup_with_risk(pool.clone(), dec!(100), risk_config);

    engine
        .on_whale_trade(&signal("mkt_1", Side::Buy, dec!(0.40), "open"))
        .await
        .unwrap();

    // No cached price: the sweep must leave the position open rather than
    // invent an exit.
    risk.trigger_kill_switch("manual trigger").await;
    engine.handle_kill_switch().await.unwrap();
    assert_eq!(engine.open_position_count(), 1);

    // The next signal carrying a real market price closes it.
    engine
        .on_whale_trade(&signal("mkt_1", Side::Buy, dec!(0.45), "late-price"))
        .await
        .unwrap();
    assert_eq!(engine.open_position_count(), 0);
    assert_eq!(bankroll.open_position_count().await, 0);
}

#[tokio::test]
async fn unwind_disabled_leaves_positions_open_on_kill() {
    let pool = common::setup_test_db().await;
    let (mut engine, bankroll, risk, prices) = engine_setup(pool.clone(), dec!(100));

    engine
        .on_whale_trade(&signal("mkt_1", Side::Buy, dec!(0.40), "open"))
        .await
        .unwrap();
    prices.update("mkt_1", dec!(0.45));

    risk.trigger_kill_switch("manual trigger").await;
    engine.handle_kill_switch().await.unwrap();

    // Default config: positions stay in place, only new opens are blocked.
    assert_eq!(engine.open_position_count(), 1);
    assert_eq!(bankroll.open_position_count().await, 1);
    assert_eq!(trade_repo::open_trades(&pool).await.unwrap().len(), 1);
}
