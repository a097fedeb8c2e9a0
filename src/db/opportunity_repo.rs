use sqlx::PgPool;
use uuid::Uuid;

use crate::models::WhaleSignal;

/// Audit record of a detected signal, written whether or not it executes.
pub async fn insert_opportunity(
    pool: &PgPool,
    id: Uuid,
    signal: &WhaleSignal,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO opportunities (id, whale_address, market_id, side, size_usd, price, detected_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(id)
    .bind(&signal.trade.wallet)
    .bind(&signal.trade.market_id)
    .bind(signal.trade.side.as_str())
    .bind(signal.trade.size_usd)
    .bind(signal.trade.price)
    .bind(signal.detected_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_outcome(
    pool: &PgPool,
    id: Uuid,
    executed: bool,
    skip_reason: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE opportunities SET executed = $2, skip_reason = $3 WHERE id = $1")
        .bind(id)
        .bind(executed)
        .bind(skip_reason)
        .execute(pool)
        .await?;

    Ok(())
}
