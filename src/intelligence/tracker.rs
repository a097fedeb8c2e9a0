use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashSet;
use std::fmt;

use crate::config::QualificationConfig;
use crate::db::{trade_repo, whale_repo, whale_trade_repo};
use crate::models::{Side, WhaleStats, WhaleTrade, WhaleTradeEvent};
use crate::polymarket::types::ApiTrade;
use crate::polymarket::{DataClient, TradeFilter};

/// Aggregation window for per-address statistics.
pub const STATS_WINDOW_DAYS: i64 = 90;

/// The 3-day activity counter uses a rolling 72 hours of wall clock, not
/// calendar days.
pub const RECENT_WINDOW_HOURS: i64 = 72;

/// A specific qualification gate an address is failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QualificationBlocker {
    TooFewTrades,
    VolumeTooLow,
    TooFewRecentTrades,
    TooFewActiveDays,
    InactiveTooLong,
}

impl QualificationBlocker {
    pub fn as_str(self) -> &'static str {
        match self {
            QualificationBlocker::TooFewTrades => "too_few_trades",
            QualificationBlocker::VolumeTooLow => "volume_too_low",
            QualificationBlocker::TooFewRecentTrades => "too_few_recent_trades",
            QualificationBlocker::TooFewActiveDays => "too_few_active_days",
            QualificationBlocker::InactiveTooLong => "inactive_too_long",
        }
    }
}

impl fmt::Display for QualificationBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Pure statistics derivation
// ---------------------------------------------------------------------------

/// Fold persisted trades into the address's statistics record.
pub fn compute_stats(address: &str, trades: &[WhaleTrade], now: DateTime<Utc>) -> WhaleStats {
    let total_trades = trades.len() as i64;
    let total_volume_usd: Decimal = trades.iter().map(|t| t.size_usd).sum();
    let avg_trade_size_usd = total_volume_usd / Decimal::from(total_trades.max(1));

    let recent_cutoff = now - Duration::hours(RECENT_WINDOW_HOURS);
    let trades_last_3_days = trades
        .iter()
        .filter(|t| t.traded_at >= recent_cutoff)
        .count() as i64;

    let days_active = trades
        .iter()
        .map(|t| t.traded_at.date_naive())
        .collect::<HashSet<_>>()
        .len() as i64;

    let last_active_at = trades.iter().map(|t| t.traded_at).max();

    WhaleStats {
        wallet_address: address.to_lowercase(),
        total_trades,
        total_volume_usd,
        avg_trade_size_usd,
        trades_last_3_days,
        days_active,
        last_active_at,
        risk_score: risk_score(total_volume_usd, total_trades, last_active_at, now),
        realized_pnl_usd: None,
        copied_trade_count: None,
    }
}

/// Deterministic activity-based risk score, 1..10 with lower = better. The
/// feed carries no settlement flag, so the score is a function of volume,
/// trade count and recency only.
pub fn risk_score(
    total_volume_usd: Decimal,
    total_trades: i64,
    last_active_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> i16 {
    let days_inactive = last_active_at
        .map(|t| (now - t).num_days().max(0))
        .unwrap_or(i64::MAX);

    let base: i16 = if total_volume_usd >= Decimal::from(100_000) && total_trades >= 500 {
        1
    } else if total_volume_usd >= Decimal::from(50_000) && total_trades >= 200 {
        2
    } else if total_volume_usd >= Decimal::from(10_000) && total_trades >= 100 {
        3
    } else if total_volume_usd >= Decimal::from(5_000) && total_trades >= 50 {
        4
    } else if total_volume_usd >= Decimal::from(1_000) && total_trades >= 20 {
        6
    } else if days_inactive <= 7 {
        8
    } else if days_inactive <= 30 {
        9
    } else {
        return 10;
    };

    // Staleness pushes a banded score down one notch.
    if base <= 6 && days_inactive > 30 {
        (base + 1).min(10)
    } else {
        base
    }
}

/// Evaluate the qualification predicate; empty means the address qualifies.
pub fn qualification_blockers(
    stats: &WhaleStats,
    config: &QualificationConfig,
    now: DateTime<Utc>,
) -> Vec<QualificationBlocker> {
    let mut blockers = Vec::new();

    if stats.total_trades < config.min_trades {
        blockers.push(QualificationBlocker::TooFewTrades);
    }
    if stats.total_volume_usd < config.min_volume_usd {
        blockers.push(QualificationBlocker::VolumeTooLow);
    }
    if stats.trades_last_3_days < config.min_trades_last_3_days {
        blockers.push(QualificationBlocker::TooFewRecentTrades);
    }
    if stats.days_active < config.min_days_active {
        blockers.push(QualificationBlocker::TooFewActiveDays);
    }

    let inactive_days = stats
        .last_active_at
        .map(|t| (now - t).num_days().max(0))
        .unwrap_or(i64::MAX);
    if inactive_days > config.max_inactive_days {
        blockers.push(QualificationBlocker::InactiveTooLong);
    }

    blockers
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Derives and persists per-address statistics. Sole owner of whale and
/// whale-trade mutation.
pub struct WhaleTracker {
    pool: PgPool,
    data_client: DataClient,
    qualification: QualificationConfig,
}

impl WhaleTracker {
    pub fn new(pool: PgPool, data_client: DataClient, qualification: QualificationConfig) -> Self {
        Self {
            pool,
            data_client,
            qualification,
        }
    }

    /// Pull fresh trades from the data API into the store, then recompute
    /// statistics over the persisted window. An API failure degrades to
    /// store-only recomputation so a flaky upstream never stalls the
    /// pipeline.
    pub async fn refresh(&self, address: &str) -> anyhow::Result<WhaleStats> {
        let address = address.to_lowercase();
        let now = Utc::now();
        let since = now - Duration::days(STATS_WINDOW_DAYS);

        match self.fetch_trades(&address, since).await {
            Ok(events) => {
                for event in &events {
                    whale_trade_repo::insert_whale_trade(&self.pool, event).await?;
                }
            }
            Err(e) => {
                tracing::warn!(
                    address = %short(&address),
                    error = %e,
                    "Trade fetch failed, recomputing from store only"
                );
            }
        }

        let rows = whale_trade_repo::trades_since(&self.pool, &address, since).await?;
        let mut stats = compute_stats(&address, &rows, now);

        // Realized PnL is ours alone: the sum over our own closed copies.
        let (pnl, copied) = trade_repo::realized_pnl_for_whale(&self.pool, &address).await?;
        if copied > 0 {
            stats.realized_pnl_usd = Some(pnl);
            stats.copied_trade_count = Some(copied);
        }

        Ok(stats)
    }

    pub async fn persist(&self, stats: &WhaleStats) -> anyhow::Result<()> {
        whale_repo::update_stats(&self.pool, stats).await
    }

    pub fn is_qualifying(&self, stats: &WhaleStats, now: DateTime<Utc>) -> (bool, Vec<QualificationBlocker>) {
        let blockers = qualification_blockers(stats, &self.qualification, now);
        (blockers.is_empty(), blockers)
    }

    /// Single-page fetch of trades strictly newer than the cursor, oldest
    /// first. Used by the detector's per-whale polling path.
    pub async fn fetch_recent(
        &self,
        address: &str,
        cursor: DateTime<Utc>,
    ) -> anyhow::Result<Vec<WhaleTradeEvent>> {
        let filter = TradeFilter {
            user: Some(address.to_lowercase()),
            since: Some(cursor),
            limit: Some(100),
            ..TradeFilter::default()
        };

        let page = self.data_client.get_trades_page(&filter, 0).await?;
        let mut events: Vec<WhaleTradeEvent> = page
            .iter()
            .filter_map(|t| api_trade_to_event(address, t))
            .filter(|e| e.traded_at > cursor)
            .collect();
        events.sort_by_key(|e| e.traded_at);
        Ok(events)
    }

    async fn fetch_trades(
        &self,
        address: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<WhaleTradeEvent>> {
        let filter = TradeFilter {
            user: Some(address.to_string()),
            since: Some(since),
            limit: Some(500),
            ..TradeFilter::default()
        };

        let mut page = self.data_client.get_trades(filter);
        let mut events = Vec::new();

        while let Some(trades) = page.next_page().await? {
            for trade in &trades {
                if let Some(event) = api_trade_to_event(address, trade) {
                    events.push(event);
                }
            }
            // One whale rarely needs more than a few pages per refresh.
            if events.len() >= 2_000 {
                break;
            }
        }

        Ok(events)
    }
}

/// Convert an API trade row to the canonical observed-trade event.
/// Notional is shares × price, in USD.
pub fn api_trade_to_event(address: &str, trade: &ApiTrade) -> Option<WhaleTradeEvent> {
    let side = Side::from_api_str(trade.side.as_deref()?)?;
    let size = trade.size?;
    let price = trade.price?;
    if size <= Decimal::ZERO || price <= Decimal::ZERO {
        return None;
    }

    Some(WhaleTradeEvent {
        wallet: address.to_lowercase(),
        market_id: trade.market.clone().unwrap_or_else(|| "unknown".into()),
        side,
        size_usd: size * price,
        price,
        traded_at: trade.traded_at().unwrap_or_else(Utc::now),
        trade_external_id: trade.external_id()?,
    })
}

fn short(address: &str) -> &str {
    &address[..10.min(address.len())]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn row(size_usd: Decimal, hours_ago: i64, now: DateTime<Utc>) -> WhaleTrade {
        WhaleTrade {
            id: 0,
            whale_address: "0xwhale".into(),
            market_id: "mkt".into(),
            side: "buy".into(),
            size_usd,
            price: dec!(0.5),
            traded_at: now - Duration::hours(hours_ago),
            trade_external_id: format!("t{hours_ago}"),
            created_at: None,
        }
    }

    #[test]
    fn stats_volume_and_average_are_consistent() {
        let now = Utc::now();
        let trades = vec![
            row(dec!(100), 1, now),
            row(dec!(200), 2, now),
            row(dec!(300), 100, now),
        ];
        let stats = compute_stats("0xWHALE", &trades, now);

        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.total_volume_usd, dec!(600));
        assert_eq!(stats.avg_trade_size_usd, dec!(200));
        assert_eq!(
            stats.avg_trade_size_usd * Decimal::from(stats.total_trades),
            stats.total_volume_usd
        );
        assert_eq!(stats.wallet_address, "0xwhale");
    }

    #[test]
    fn recent_counter_uses_rolling_72h() {
        let now = Utc::now();
        let trades = vec![
            row(dec!(10), 1, now),
            row(dec!(10), 71, now),
            row(dec!(10), 73, now), // outside the window
        ];
        let stats = compute_stats("0xwhale", &trades, now);
        assert_eq!(stats.trades_last_3_days, 2);
        assert!(stats.trades_last_3_days <= stats.total_trades);
    }

    #[test]
    fn days_active_counts_distinct_utc_days() {
        let now = Utc::now();
        let trades = vec![
            row(dec!(10), 0, now),
            row(dec!(10), 1, now),
            row(dec!(10), 25, now),
            row(dec!(10), 49, now),
        ];
        let stats = compute_stats("0xwhale", &trades, now);
        assert!(stats.days_active >= 2 && stats.days_active <= 3);
    }

    #[test]
    fn empty_history_yields_zero_stats() {
        let now = Utc::now();
        let stats = compute_stats("0xwhale", &[], now);
        assert_eq!(stats.total_trades, 0);
        assert_eq!(stats.avg_trade_size_usd, Decimal::ZERO);
        assert_eq!(stats.risk_score, 10);
        assert!(stats.last_active_at.is_none());
    }

    #[test]
    fn risk_score_bands_match_activity_table() {
        let now = Utc::now();
        let active = Some(now);
        let cases: [(Decimal, i64, i16); 6] = [
            (dec!(150000), 600, 1),
            (dec!(60000), 250, 2),
            (dec!(15000), 120, 3),
            (dec!(6000), 60, 4),
            (dec!(2000), 25, 6),
            (dec!(500), 5, 8),
        ];
        for (volume, trades, expected) in cases {
            assert_eq!(
                risk_score(volume, trades, active, now),
                expected,
                "volume={volume} trades={trades}"
            );
        }
    }

    #[test]
    fn risk_score_degrades_with_inactivity() {
        let now = Utc::now();
        assert_eq!(
            risk_score(dec!(500), 5, Some(now - Duration::days(10)), now),
            9
        );
        assert_eq!(
            risk_score(dec!(500), 5, Some(now - Duration::days(60)), now),
            10
        );
        assert_eq!(risk_score(dec!(500), 5, None, now), 10);
        // A high-volume whale gone quiet slips one notch.
        assert_eq!(
            risk_score(dec!(150000), 600, Some(now - Duration::days(45)), now),
            2
        );
    }

    #[test]
    fn qualification_passes_at_thresholds() {
        let now = Utc::now();
        let config = QualificationConfig::default();
        let stats = WhaleStats {
            wallet_address: "0xwhale".into(),
            total_trades: 10,
            total_volume_usd: dec!(500),
            avg_trade_size_usd: dec!(50),
            trades_last_3_days: 3,
            days_active: 1,
            last_active_at: Some(now),
            risk_score: 6,
            realized_pnl_usd: None,
            copied_trade_count: None,
        };
        assert!(qualification_blockers(&stats, &config, now).is_empty());
    }

    #[test]
    fn one_trade_below_threshold_blocks_qualification() {
        let now = Utc::now();
        let config = QualificationConfig::default();
        let stats = WhaleStats {
            wallet_address: "0xwhale".into(),
            total_trades: 9,
            total_volume_usd: dec!(2400),
            avg_trade_size_usd: dec!(266),
            trades_last_3_days: 4,
            days_active: 2,
            last_active_at: Some(now),
            risk_score: 6,
            realized_pnl_usd: None,
            copied_trade_count: None,
        };
        let blockers = qualification_blockers(&stats, &config, now);
        assert_eq!(blockers, vec![QualificationBlocker::TooFewTrades]);
    }

    #[test]
    fn inactivity_blocks_qualification() {
        let now = Utc::now();
        let config = QualificationConfig::default();
        let stats = WhaleStats {
            wallet_address: "0xwhale".into(),
            total_trades: 50,
            total_volume_usd: dec!(10000),
            avg_trade_size_usd: dec!(200),
            trades_last_3_days: 3,
            days_active: 5,
            last_active_at: Some(now - Duration::days(31)),
            risk_score: 4,
            realized_pnl_usd: None,
            copied_trade_count: None,
        };
        let blockers = qualification_blockers(&stats, &config, now);
        assert!(blockers.contains(&QualificationBlocker::InactiveTooLong));
    }

    #[test]
    fn api_trade_conversion_computes_notional() {
        let trade = ApiTrade {
            id: Some("t1".into()),
            market: Some("0xmkt".into()),
            asset_id: None,
            side: Some("BUY".into()),
            size: Some(dec!(100)),
            price: Some(dec!(0.40)),
            proxy_wallet: None,
            maker_address: None,
            taker_address: None,
            timestamp: Some(serde_json::json!(1_700_000_000i64)),
            transaction_hash: None,
        };
        let event = api_trade_to_event("0xWHALE", &trade).unwrap();
        assert_eq!(event.size_usd, dec!(40));
        assert_eq!(event.side, Side::Buy);
        assert_eq!(event.wallet, "0xwhale");
        assert_eq!(event.trade_external_id, "t1");
    }

    #[test]
    fn api_trade_without_id_or_hash_is_skipped() {
        let trade = ApiTrade {
            id: None,
            market: None,
            asset_id: None,
            side: Some("SELL".into()),
            size: Some(dec!(10)),
            price: Some(dec!(0.5)),
            proxy_wallet: None,
            maker_address: None,
            taker_address: None,
            timestamp: None,
            transaction_hash: None,
        };
        assert!(api_trade_to_event("0xwhale", &trade).is_none());
    }
}
