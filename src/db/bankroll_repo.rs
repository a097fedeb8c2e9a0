use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::BankrollSnapshot;

pub async fn insert_snapshot(pool: &PgPool, snap: &BankrollSnapshot) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO bankroll (timestamp, total_capital, allocated, available,
                              daily_pnl, daily_drawdown, total_trades, win_count, loss_count, label)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(snap.timestamp)
    .bind(snap.total_capital)
    .bind(snap.allocated)
    .bind(snap.available)
    .bind(snap.daily_pnl)
    .bind(snap.daily_drawdown)
    .bind(snap.total_trades)
    .bind(snap.win_count)
    .bind(snap.loss_count)
    .bind(&snap.label)
    .execute(pool)
    .await?;

    Ok(())
}

/// Same insert inside a caller-owned transaction, used for the paired
/// trade-write + snapshot contract.
pub async fn insert_snapshot_tx(
    tx: &mut Transaction<'_, Postgres>,
    snap: &BankrollSnapshot,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO bankroll (timestamp, total_capital, allocated, available,
                              daily_pnl, daily_drawdown, total_trades, win_count, loss_count, label)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(snap.timestamp)
    .bind(snap.total_capital)
    .bind(snap.allocated)
    .bind(snap.available)
    .bind(snap.daily_pnl)
    .bind(snap.daily_drawdown)
    .bind(snap.total_trades)
    .bind(snap.win_count)
    .bind(snap.loss_count)
    .bind(&snap.label)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Full snapshot series, oldest first (drawdown is peak-to-trough in order).
pub async fn snapshots_asc(pool: &PgPool) -> anyhow::Result<Vec<BankrollSnapshot>> {
    let snaps =
        sqlx::query_as::<_, BankrollSnapshot>("SELECT * FROM bankroll ORDER BY timestamp ASC")
            .fetch_all(pool)
            .await?;

    Ok(snaps)
}

pub async fn latest_snapshot(pool: &PgPool) -> anyhow::Result<Option<BankrollSnapshot>> {
    let snap = sqlx::query_as::<_, BankrollSnapshot>(
        "SELECT * FROM bankroll ORDER BY timestamp DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    Ok(snap)
}

pub async fn equity_history(
    pool: &PgPool,
    days: i64,
) -> anyhow::Result<Vec<BankrollSnapshot>> {
    let since: DateTime<Utc> = Utc::now() - Duration::days(days);
    let snaps = sqlx::query_as::<_, BankrollSnapshot>(
        "SELECT * FROM bankroll WHERE timestamp >= $1 ORDER BY timestamp DESC",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(snaps)
}
