use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{RiskEvent, RiskSeverity};

pub async fn insert_risk_event(
    pool: &PgPool,
    kind: &str,
    severity: RiskSeverity,
    detail: &str,
) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO risk_events (kind, severity, detail) VALUES ($1, $2, $3)")
        .bind(kind)
        .bind(severity.as_str())
        .bind(detail)
        .execute(pool)
        .await?;

    Ok(())
}

/// Number of critical events since the cutoff; the promotion gate requires
/// zero over the validation window.
pub async fn count_critical_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> anyhow::Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM risk_events WHERE severity = 'critical' AND created_at >= $1",
    )
    .bind(since)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

pub async fn recent_events(pool: &PgPool, limit: i64) -> anyhow::Result<Vec<RiskEvent>> {
    let events = sqlx::query_as::<_, RiskEvent>(
        "SELECT * FROM risk_events ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(events)
}
