use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{WhaleTrade, WhaleTradeEvent};

/// Insert an observed whale trade. Idempotent on `trade_external_id`:
/// replaying the same trade leaves exactly one row. Returns whether a new
/// row was written.
pub async fn insert_whale_trade(pool: &PgPool, event: &WhaleTradeEvent) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO whale_trades (whale_address, market_id, side, size_usd, price, traded_at, trade_external_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (trade_external_id) DO NOTHING
        "#,
    )
    .bind(event.wallet.to_lowercase())
    .bind(&event.market_id)
    .bind(event.side.as_str())
    .bind(event.size_usd)
    .bind(event.price)
    .bind(event.traded_at)
    .bind(&event.trade_external_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// All trades for an address since the cutoff, oldest first (the tracker
/// folds them chronologically).
pub async fn trades_since(
    pool: &PgPool,
    address: &str,
    since: DateTime<Utc>,
) -> anyhow::Result<Vec<WhaleTrade>> {
    let trades = sqlx::query_as::<_, WhaleTrade>(
        r#"
        SELECT * FROM whale_trades
        WHERE whale_address = $1 AND traded_at >= $2
        ORDER BY traded_at ASC
        "#,
    )
    .bind(address)
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(trades)
}

pub async fn latest_traded_at(
    pool: &PgPool,
    address: &str,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        "SELECT MAX(traded_at) FROM whale_trades WHERE whale_address = $1 HAVING MAX(traded_at) IS NOT NULL",
    )
    .bind(address)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.0))
}

pub async fn count_for_whale(pool: &PgPool, address: &str) -> anyhow::Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM whale_trades WHERE whale_address = $1")
        .bind(address)
        .fetch_one(pool)
        .await?;

    Ok(row.0)
}
