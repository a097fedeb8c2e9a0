use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::bankroll_repo;
use crate::models::{BankrollSnapshot, Side, VirtualTradeRecord};

/// Fields for a freshly opened virtual trade.
#[derive(Debug, Clone)]
pub struct NewVirtualTrade {
    pub trade_id: Uuid,
    pub market_id: String,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub gas_cost_usd: Decimal,
    pub whale_source: Option<String>,
    pub opportunity_id: Option<Uuid>,
    pub executed_at: DateTime<Utc>,
}

/// Closing fields for an open virtual trade. Commission and gas carry the
/// summed amounts of both legs.
#[derive(Debug, Clone)]
pub struct TradeClose {
    pub trade_id: Uuid,
    pub exit_price: Decimal,
    pub commission: Decimal,
    pub gas_cost_usd: Decimal,
    pub gross_pnl: Decimal,
    pub total_fees: Decimal,
    pub net_pnl: Decimal,
    pub settled_at: DateTime<Utc>,
}

/// Persist an open trade together with its bankroll snapshot in one
/// transaction, so the ledger and the trade log can never disagree.
pub async fn open_trade_with_snapshot(
    pool: &PgPool,
    trade: &NewVirtualTrade,
    snapshot: &BankrollSnapshot,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO trades (trade_id, market_id, side, size, price, exchange,
                            commission, gas_cost_usd, status, whale_source,
                            opportunity_id, executed_at)
        VALUES ($1, $2, $3, $4, $5, 'VIRTUAL', $6, $7, 'open', $8, $9, $10)
        ON CONFLICT (trade_id) DO NOTHING
        "#,
    )
    .bind(trade.trade_id)
    .bind(&trade.market_id)
    .bind(trade.side.as_str())
    .bind(trade.size)
    .bind(trade.price)
    .bind(trade.commission)
    .bind(trade.gas_cost_usd)
    .bind(&trade.whale_source)
    .bind(trade.opportunity_id)
    .bind(trade.executed_at)
    .execute(&mut *tx)
    .await?;

    bankroll_repo::insert_snapshot_tx(&mut tx, snapshot).await?;

    tx.commit().await
}

/// Persist a close together with its bankroll snapshot in one transaction.
pub async fn close_trade_with_snapshot(
    pool: &PgPool,
    close: &TradeClose,
    snapshot: &BankrollSnapshot,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE trades
        SET exit_price = $2,
            commission = $3,
            gas_cost_usd = $4,
            gross_pnl = $5,
            total_fees = $6,
            net_pnl = $7,
            status = 'closed',
            settled_at = $8
        WHERE trade_id = $1 AND status = 'open'
        "#,
    )
    .bind(close.trade_id)
    .bind(close.exit_price)
    .bind(close.commission)
    .bind(close.gas_cost_usd)
    .bind(close.gross_pnl)
    .bind(close.total_fees)
    .bind(close.net_pnl)
    .bind(close.settled_at)
    .execute(&mut *tx)
    .await?;

    bankroll_repo::insert_snapshot_tx(&mut tx, snapshot).await?;

    tx.commit().await
}

pub async fn get_trade(pool: &PgPool, trade_id: Uuid) -> anyhow::Result<Option<VirtualTradeRecord>> {
    let trade =
        sqlx::query_as::<_, VirtualTradeRecord>("SELECT * FROM trades WHERE trade_id = $1")
            .bind(trade_id)
            .fetch_optional(pool)
            .await?;

    Ok(trade)
}

pub async fn open_trades(pool: &PgPool) -> anyhow::Result<Vec<VirtualTradeRecord>> {
    let trades = sqlx::query_as::<_, VirtualTradeRecord>(
        "SELECT * FROM trades WHERE exchange = 'VIRTUAL' AND status = 'open' ORDER BY executed_at ASC",
    )
    .fetch_all(pool)
    .await?;

    Ok(trades)
}

/// Aggregate over closed virtual trades: (count, wins, losses, realized pnl).
pub async fn closed_trade_totals(
    pool: &PgPool,
) -> anyhow::Result<(i64, i64, i64, Decimal)> {
    let row: (i64, i64, i64, Option<Decimal>) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COUNT(*) FILTER (WHERE net_pnl > 0),
               COUNT(*) FILTER (WHERE net_pnl <= 0),
               SUM(net_pnl)
        FROM trades
        WHERE exchange = 'VIRTUAL' AND status = 'closed'
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok((row.0, row.1, row.2, row.3.unwrap_or(Decimal::ZERO)))
}

pub async fn total_trade_count(pool: &PgPool) -> anyhow::Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM trades WHERE exchange = 'VIRTUAL'")
            .fetch_one(pool)
            .await?;

    Ok(row.0)
}

/// Realized PnL and closed-trade count of our own copies of one whale.
pub async fn realized_pnl_for_whale(
    pool: &PgPool,
    address: &str,
) -> anyhow::Result<(Decimal, i64)> {
    let row: (Option<Decimal>, i64) = sqlx::query_as(
        r#"
        SELECT SUM(net_pnl), COUNT(*)
        FROM trades
        WHERE whale_source = $1 AND status = 'closed'
        "#,
    )
    .bind(address)
    .fetch_one(pool)
    .await?;

    Ok((row.0.unwrap_or(Decimal::ZERO), row.1))
}
