mod common;

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::mpsc;

use polycopy::config::{DataApiConfig, QualificationConfig, RankingConfig};
use polycopy::db::{whale_repo, whale_trade_repo};
use polycopy::intelligence::detector::{DetectorConfig, WhaleDetector};
use polycopy::models::{Side, WhaleEvent, WhaleEventKind, WhaleSignal, WhaleStatus};
use polycopy::polymarket::DataClient;

const WHALE: &str = "0xaaaa000000000000000000000000000000000001";

/// Data client pointed at a dead endpoint: every fetch fails fast and the
/// tracker recomputes from the store alone.
fn offline_data_client() -> DataClient {
    DataClient::new(
        reqwest::Client::new(),
        DataApiConfig {
            base_url: "http://127.0.0.1:1".into(),
            rate_per_minute: 6_000,
            timeout: Duration::from_secs(1),
            max_retries: 0,
        },
    )
}

fn detector_config() -> DetectorConfig {
    DetectorConfig {
        polling_interval: Duration::from_secs(60),
        daily_trade_threshold: 5,
        min_trade_size_usd: Decimal::from(50),
        qualification: QualificationConfig::default(),
        ranking: RankingConfig::default(),
    }
}

async fn build_detector(
    pool: sqlx::PgPool,
) -> (
    WhaleDetector,
    mpsc::Receiver<WhaleEvent>,
    mpsc::Receiver<WhaleSignal>,
) {
    let (events_tx, events_rx) = mpsc::channel(64);
    let (signal_tx, signal_rx) = mpsc::channel(64);
    let detector = WhaleDetector::new(pool, offline_data_client(), detector_config(), events_tx, signal_tx)
        .await
        .unwrap();
    (detector, events_rx, signal_rx)
}

#[tokio::test]
async fn repeated_activity_discovers_a_whale() {
    let pool = common::setup_test_db().await;
    let (mut detector, mut events_rx, _signal_rx) = build_detector(pool.clone()).await;

    // Five qualifying-size trades inside 24h cross the discovery threshold.
    for i in 0..5 {
        let event = common::trade_event(
            WHALE,
            "mkt_1",
            Side::Buy,
            Decimal::from(200),
            Decimal::new(40, 2),
            i,
            &format!("disc-{i}"),
        );
        detector.observe_trade(&event).await.unwrap();
    }

    let whale = whale_repo::get_whale(&pool, WHALE).await.unwrap().unwrap();
    assert_eq!(whale.status(), WhaleStatus::Discovered);

    let event = events_rx.try_recv().unwrap();
    assert_eq!(event.kind, WhaleEventKind::Discovered);
    assert_eq!(detector.tracked_count(), 1);
}

#[tokio::test]
async fn small_trades_never_discover() {
    let pool = common::setup_test_db().await;
    let (mut detector, _events_rx, _signal_rx) = build_detector(pool.clone()).await;

    for i in 0..20 {
        let event = common::trade_event(
            WHALE,
            "mkt_1",
            Side::Buy,
            Decimal::from(10), // below the $50 floor
            Decimal::new(40, 2),
            0,
            &format!("small-{i}"),
        );
        detector.observe_trade(&event).await.unwrap();
    }

    assert!(whale_repo::get_whale(&pool, WHALE).await.unwrap().is_none());
}

#[tokio::test]
async fn nine_trades_stay_discovered_ten_qualify() {
    let pool = common::setup_test_db().await;
    let (mut detector, mut events_rx, _signal_rx) = build_detector(pool.clone()).await;

    // Discovery plus history: exactly 9 persisted trades.
    for i in 0..5 {
        let event = common::trade_event(
            WHALE,
            "mkt_1",
            Side::Buy,
            Decimal::from(200),
            Decimal::new(40, 2),
            i,
            &format!("t-{i}"),
        );
        detector.observe_trade(&event).await.unwrap();
    }
    // Discovery persisted only the threshold-crossing trade; backfill to 9.
    for i in 5..13 {
        let event = common::trade_event(
            WHALE,
            "mkt_1",
            Side::Buy,
            Decimal::from(200),
            Decimal::new(40, 2),
            (i % 48) as i64,
            &format!("t-{i}"),
        );
        whale_trade_repo::insert_whale_trade(&pool, &event).await.unwrap();
    }
    assert_eq!(whale_trade_repo::count_for_whale(&pool, WHALE).await.unwrap(), 9);

    detector.run_cycle().await.unwrap();
    let whale = whale_repo::get_whale(&pool, WHALE).await.unwrap().unwrap();
    assert_eq!(whale.status(), WhaleStatus::Discovered, "one trade short must not qualify");

    // The tenth trade tips the gate on the next cycle.
    let event = common::trade_event(
        WHALE,
        "mkt_1",
        Side::Buy,
        Decimal::from(200),
        Decimal::new(40, 2),
        1,
        "t-final",
    );
    whale_trade_repo::insert_whale_trade(&pool, &event).await.unwrap();
    detector.run_cycle().await.unwrap();

    let whale = whale_repo::get_whale(&pool, WHALE).await.unwrap().unwrap();
    assert!(whale.status() == WhaleStatus::Qualified || whale.status() == WhaleStatus::Ranked);

    let kinds: Vec<WhaleEventKind> = std::iter::from_fn(|| events_rx.try_recv().ok())
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&WhaleEventKind::Qualified));
}

#[tokio::test]
async fn qualified_whale_trade_emits_a_signal() {
    let pool = common::setup_test_db().await;
    let (mut detector, _events_rx, mut signal_rx) = build_detector(pool.clone()).await;

    // Seed a fully qualified whale through the pipeline.
    for i in 0..5 {
        let event = common::trade_event(
            WHALE,
            "mkt_1",
            Side::Buy,
            Decimal::from(200),
            Decimal::new(40, 2),
            i,
            &format!("q-{i}"),
        );
        detector.observe_trade(&event).await.unwrap();
    }
    for i in 5..15 {
        let event = common::trade_event(
            WHALE,
            "mkt_1",
            Side::Buy,
            Decimal::from(200),
            Decimal::new(40, 2),
            (i % 40) as i64,
            &format!("q-{i}"),
        );
        whale_trade_repo::insert_whale_trade(&pool, &event).await.unwrap();
    }
    detector.run_cycle().await.unwrap();
    assert!(
        whale_repo::get_whale(&pool, WHALE).await.unwrap().unwrap().status().is_copyable()
    );

    // Drain anything the cycle itself emitted.
    while signal_rx.try_recv().is_ok() {}

    let live = common::trade_event(
        WHALE,
        "mkt_live",
        Side::Buy,
        Decimal::from(500),
        Decimal::new(40, 2),
        0,
        "live-1",
    );
    detector.observe_trade(&live).await.unwrap();

    let signal = signal_rx.try_recv().expect("signal for qualified whale trade");
    assert_eq!(signal.trade.market_id, "mkt_live");
    assert_eq!(signal.trade.side, Side::Buy);
    assert!(signal.whale_stats.status.is_copyable());
    assert!(signal.whale_stats.rank_score_norm >= Decimal::ZERO);
}

#[tokio::test]
async fn cache_is_rebuilt_from_store_on_restart() {
    let pool = common::setup_test_db().await;

    // First detector discovers a whale, then is dropped (simulated crash).
    {
        let (mut detector, _e, _s) = build_detector(pool.clone()).await;
        for i in 0..5 {
            let event = common::trade_event(
                WHALE,
                "mkt_1",
                Side::Buy,
                Decimal::from(200),
                Decimal::new(40, 2),
                i,
                &format!("r-{i}"),
            );
            detector.observe_trade(&event).await.unwrap();
        }
        assert_eq!(detector.tracked_count(), 1);
    }

    // A fresh detector primes its cache from the store, never ahead of it.
    let (detector, _e, _s) = build_detector(pool.clone()).await;
    assert_eq!(detector.tracked_count(), 1);
    let known = whale_repo::load_known_whales(&pool).await.unwrap();
    assert_eq!(known.len(), detector.tracked_count());
}
