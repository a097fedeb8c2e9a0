use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

use crate::db::{bankroll_repo, trade_repo};
use crate::models::{BankrollSnapshot, Side, VirtualTradeRecord};

use super::price_cache::PriceCache;

/// Metrics recomputed from persisted records only, so reports survive a
/// restart. Win rate covers closed trades exclusively.
#[derive(Debug, Clone)]
pub struct TradingMetrics {
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub win_rate: Decimal,
    pub roi: Decimal,
    pub expectancy: Decimal,
    pub max_drawdown: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub open_positions: i64,
    pub current_capital: Decimal,
    pub initial_bankroll: Decimal,
    pub last_update: DateTime<Utc>,
}

/// Peak-to-trough drawdown of `total_capital` over the snapshot series.
pub fn max_drawdown(snapshots: &[BankrollSnapshot]) -> Decimal {
    let mut peak = Decimal::ZERO;
    let mut worst = Decimal::ZERO;

    for snap in snapshots {
        if snap.total_capital > peak {
            peak = snap.total_capital;
        }
        if peak > Decimal::ZERO {
            let drawdown = (peak - snap.total_capital) / peak;
            if drawdown > worst {
                worst = drawdown;
            }
        }
    }

    worst
}

/// Mark one open trade against the latest known price; `None` when no
/// price is known (the position is then omitted from unrealized PnL).
pub fn unrealized_pnl(trade: &VirtualTradeRecord, current_price: Decimal) -> Option<Decimal> {
    if trade.price <= Decimal::ZERO {
        return None;
    }
    let side = Side::from_api_str(&trade.side)?;
    let move_frac = (current_price - trade.price) / trade.price;
    let gross = match side {
        Side::Buy => trade.size * move_frac,
        Side::Sell => -(trade.size * move_frac),
    };
    Some(gross)
}

pub async fn compute_metrics(
    pool: &PgPool,
    initial_bankroll: Decimal,
    prices: &PriceCache,
) -> anyhow::Result<TradingMetrics> {
    let (closed, wins, losses, realized) = trade_repo::closed_trade_totals(pool).await?;
    let total_trades = trade_repo::total_trade_count(pool).await?;
    let open = trade_repo::open_trades(pool).await?;

    let win_rate = if closed > 0 {
        Decimal::from(wins) / Decimal::from(closed)
    } else {
        Decimal::ZERO
    };

    let expectancy = if closed > 0 {
        realized / Decimal::from(closed)
    } else {
        Decimal::ZERO
    };

    let mut unrealized = Decimal::ZERO;
    for trade in &open {
        if let Some(price) = prices.get(&trade.market_id) {
            if let Some(pnl) = unrealized_pnl(trade, price) {
                unrealized += pnl;
            }
        }
    }

    let snapshots = bankroll_repo::snapshots_asc(pool).await?;
    let drawdown = max_drawdown(&snapshots);

    let current_capital = snapshots
        .last()
        .map(|s| s.total_capital)
        .unwrap_or(initial_bankroll);

    let roi = if initial_bankroll > Decimal::ZERO {
        (current_capital - initial_bankroll) / initial_bankroll
    } else {
        Decimal::ZERO
    };

    Ok(TradingMetrics {
        total_trades,
        winning_trades: wins,
        losing_trades: losses,
        win_rate,
        roi,
        expectancy,
        max_drawdown: drawdown,
        realized_pnl: realized,
        unrealized_pnl: unrealized,
        open_positions: open.len() as i64,
        current_capital,
        initial_bankroll,
        last_update: Utc::now(),
    })
}

/// Write the equity-labelled snapshot that marks one aggregator run.
async fn write_equity_snapshot(
    pool: &PgPool,
    metrics: &TradingMetrics,
) -> anyhow::Result<()> {
    let open = trade_repo::open_trades(pool).await?;
    let allocated: Decimal = open.iter().map(|t| t.size).sum();

    let snapshot = BankrollSnapshot {
        id: 0,
        timestamp: Utc::now(),
        total_capital: metrics.current_capital,
        allocated,
        available: metrics.current_capital - allocated,
        daily_pnl: Decimal::ZERO,
        daily_drawdown: metrics.max_drawdown,
        total_trades: metrics.total_trades,
        win_count: metrics.winning_trades,
        loss_count: metrics.losing_trades,
        label: Some("equity".into()),
    };

    bankroll_repo::insert_snapshot(pool, &snapshot).await?;
    Ok(())
}

/// Periodic aggregation task.
pub async fn run_metrics_loop(
    pool: PgPool,
    initial_bankroll: Decimal,
    prices: PriceCache,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.tick().await;

    tracing::info!(period_secs = period.as_secs(), "Metrics aggregator started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match compute_metrics(&pool, initial_bankroll, &prices).await {
                    Ok(metrics) => {
                        metrics::gauge!("paper_total_capital")
                            .set(decimal_to_f64(metrics.current_capital));
                        metrics::gauge!("paper_realized_pnl")
                            .set(decimal_to_f64(metrics.realized_pnl));
                        metrics::gauge!("paper_open_positions").set(metrics.open_positions as f64);

                        tracing::info!(
                            total_trades = metrics.total_trades,
                            win_rate = %metrics.win_rate,
                            roi = %metrics.roi,
                            realized = %metrics.realized_pnl,
                            unrealized = %metrics.unrealized_pnl,
                            max_drawdown = %metrics.max_drawdown,
                            "Metrics aggregated"
                        );

                        if let Err(e) = write_equity_snapshot(&pool, &metrics).await {
                            tracing::error!(error = %e, "Equity snapshot write failed");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Metrics computation failed"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Metrics aggregator shutting down");
                    break;
                }
            }
        }
    }
}

fn decimal_to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snap(capital: Decimal) -> BankrollSnapshot {
        BankrollSnapshot {
            id: 0,
            timestamp: Utc::now(),
            total_capital: capital,
            allocated: Decimal::ZERO,
            available: capital,
            daily_pnl: Decimal::ZERO,
            daily_drawdown: Decimal::ZERO,
            total_trades: 0,
            win_count: 0,
            loss_count: 0,
            label: None,
        }
    }

    #[test]
    fn drawdown_is_peak_to_trough() {
        let series = vec![
            snap(dec!(100)),
            snap(dec!(120)),
            snap(dec!(90)),  // 25% below the 120 peak
            snap(dec!(110)),
            snap(dec!(105)),
        ];
        assert_eq!(max_drawdown(&series), dec!(0.25));
    }

    #[test]
    fn monotonic_series_has_zero_drawdown() {
        let series = vec![snap(dec!(100)), snap(dec!(105)), snap(dec!(130))];
        assert_eq!(max_drawdown(&series), Decimal::ZERO);
        assert_eq!(max_drawdown(&[]), Decimal::ZERO);
    }

    fn open_trade(side: &str, size: Decimal, entry: Decimal) -> VirtualTradeRecord {
        VirtualTradeRecord {
            id: 0,
            trade_id: uuid::Uuid::new_v4(),
            market_id: "mkt".into(),
            side: side.into(),
            size,
            price: entry,
            exit_price: None,
            exchange: "VIRTUAL".into(),
            commission: Decimal::ZERO,
            gas_cost_usd: Decimal::ZERO,
            gross_pnl: None,
            total_fees: None,
            net_pnl: None,
            status: "open".into(),
            whale_source: None,
            opportunity_id: None,
            executed_at: Utc::now(),
            settled_at: None,
        }
    }

    #[test]
    fn unrealized_marks_buy_and_sell_symmetrically() {
        let long = open_trade("buy", dec!(10), dec!(0.50));
        let short = open_trade("sell", dec!(10), dec!(0.50));

        assert_eq!(unrealized_pnl(&long, dec!(0.60)), Some(dec!(2.0)));
        assert_eq!(unrealized_pnl(&short, dec!(0.60)), Some(dec!(-2.0)));
        assert_eq!(unrealized_pnl(&long, dec!(0.50)), Some(dec!(0.0)));
    }
}
