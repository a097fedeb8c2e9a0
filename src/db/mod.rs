pub mod bankroll_repo;
pub mod opportunity_repo;
pub mod risk_repo;
pub mod trade_repo;
pub mod whale_repo;
pub mod whale_trade_repo;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Pooled store connection. Four connections minimum so the detector,
/// engine, aggregator and reporter never serialize on a single socket;
/// every acquire is bounded at 10 seconds.
pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(4)
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    // Verify connectivity before handing the pool out.
    sqlx::query("SELECT 1").execute(&pool).await?;
    tracing::debug!("Store connection pool ready");

    Ok(pool)
}
