use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashMap;

use crate::models::{Whale, WhaleStats, WhaleStatus};

/// Register an observation of an address. Creates the row as `discovered` on
/// first sight; otherwise bumps `last_active_at`. `first_seen_at` is
/// write-once.
pub async fn observe_whale(
    pool: &PgPool,
    address: &str,
    observed_at: DateTime<Utc>,
) -> anyhow::Result<Whale> {
    let whale = sqlx::query_as::<_, Whale>(
        r#"
        INSERT INTO whales (wallet_address, first_seen_at, last_active_at)
        VALUES ($1, $2, $2)
        ON CONFLICT (wallet_address) DO UPDATE
        SET last_active_at = GREATEST(whales.last_active_at, EXCLUDED.last_active_at),
            is_active = TRUE,
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(address.to_lowercase())
    .bind(observed_at)
    .fetch_one(pool)
    .await?;

    Ok(whale)
}

/// Merge recomputed activity statistics into the row.
pub async fn update_stats(pool: &PgPool, stats: &WhaleStats) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE whales
        SET total_trades = $2,
            total_volume_usd = $3,
            avg_trade_size_usd = $4,
            trades_last_3_days = $5,
            days_active = $6,
            last_active_at = COALESCE($7, last_active_at),
            risk_score = $8,
            realized_pnl_usd = $9,
            copied_trade_count = $10,
            updated_at = NOW()
        WHERE wallet_address = $1
        "#,
    )
    .bind(&stats.wallet_address)
    .bind(stats.total_trades)
    .bind(stats.total_volume_usd)
    .bind(stats.avg_trade_size_usd)
    .bind(stats.trades_last_3_days)
    .bind(stats.days_active)
    .bind(stats.last_active_at)
    .bind(stats.risk_score)
    .bind(stats.realized_pnl_usd)
    .bind(stats.copied_trade_count)
    .execute(pool)
    .await?;

    Ok(())
}

/// Advance status, forward only. The CASE guard makes regressions a no-op so
/// a stale writer can never pull a whale backwards. Returns whether the row
/// changed.
pub async fn advance_status(
    pool: &PgPool,
    address: &str,
    status: WhaleStatus,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE whales
        SET status = $2, updated_at = NOW()
        WHERE wallet_address = $1
          AND (CASE status
                 WHEN 'discovered' THEN 0
                 WHEN 'qualified' THEN 1
                 WHEN 'ranked' THEN 2
                 ELSE 3
               END) < $3
        "#,
    )
    .bind(address)
    .bind(status.as_str())
    .bind(status.ordinal())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// The one sanctioned backward transition: a previously qualified (or
/// ranked) whale that no longer meets the thresholds drops back to
/// `discovered`.
pub async fn demote_to_discovered(pool: &PgPool, address: &str) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE whales
        SET status = 'discovered', rank_score = NULL, updated_at = NOW()
        WHERE wallet_address = $1 AND status IN ('qualified', 'ranked')
        "#,
    )
    .bind(address)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Mark an address rejected (terminal).
pub async fn reject_whale(pool: &PgPool, address: &str) -> anyhow::Result<bool> {
    advance_status(pool, address, WhaleStatus::Rejected).await
}

pub async fn update_rank_score(
    pool: &PgPool,
    address: &str,
    rank_score: Option<Decimal>,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE whales SET rank_score = $2, updated_at = NOW() WHERE wallet_address = $1")
        .bind(address)
        .bind(rank_score)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn get_whale(pool: &PgPool, address: &str) -> anyhow::Result<Option<Whale>> {
    let whale = sqlx::query_as::<_, Whale>("SELECT * FROM whales WHERE wallet_address = $1")
        .bind(address)
        .fetch_optional(pool)
        .await?;

    Ok(whale)
}

/// Prime the detector cache: every active whale keyed by address.
pub async fn load_known_whales(pool: &PgPool) -> anyhow::Result<HashMap<String, Whale>> {
    let whales = sqlx::query_as::<_, Whale>("SELECT * FROM whales WHERE is_active = TRUE")
        .fetch_all(pool)
        .await?;

    Ok(whales
        .into_iter()
        .map(|w| (w.wallet_address.clone(), w))
        .collect())
}

/// Current top-N view, ordered by composite rank with deterministic
/// tie-breaks (lower risk first, then earlier first_seen_at).
pub async fn load_top_whales(pool: &PgPool, n: i64) -> anyhow::Result<Vec<Whale>> {
    let whales = sqlx::query_as::<_, Whale>(
        r#"
        SELECT * FROM whales
        WHERE is_active = TRUE AND status IN ('qualified', 'ranked')
        ORDER BY rank_score DESC NULLS LAST, risk_score ASC, first_seen_at ASC
        LIMIT $1
        "#,
    )
    .bind(n)
    .fetch_all(pool)
    .await?;

    Ok(whales)
}

pub async fn load_qualified_whales(pool: &PgPool) -> anyhow::Result<Vec<Whale>> {
    let whales = sqlx::query_as::<_, Whale>(
        "SELECT * FROM whales WHERE is_active = TRUE AND status IN ('qualified', 'ranked')",
    )
    .fetch_all(pool)
    .await?;

    Ok(whales)
}

/// Flag addresses silent past the cutoff. Returns the rows that flipped so
/// the detector can emit `inactive` events.
pub async fn deactivate_stale(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> anyhow::Result<Vec<Whale>> {
    let whales = sqlx::query_as::<_, Whale>(
        r#"
        UPDATE whales
        SET is_active = FALSE, updated_at = NOW()
        WHERE is_active = TRUE AND last_active_at IS NOT NULL AND last_active_at < $1
        RETURNING *
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(whales)
}
