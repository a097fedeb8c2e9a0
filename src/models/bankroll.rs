use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Point-in-time ledger state. `total_capital = allocated + available`
/// always holds, and `allocated` equals the summed size of open paper
/// positions at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BankrollSnapshot {
    #[sqlx(default)]
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub total_capital: Decimal,
    pub allocated: Decimal,
    pub available: Decimal,
    pub daily_pnl: Decimal,
    pub daily_drawdown: Decimal,
    pub total_trades: i64,
    pub win_count: i64,
    pub loss_count: i64,
    pub label: Option<String>,
}

/// Derived bankroll statistics over the ledger's own closed trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankrollStats {
    pub total_capital: Decimal,
    pub available: Decimal,
    pub allocated: Decimal,
    pub total_trades: i64,
    pub open_positions: usize,
    pub closed_trades: i64,
    pub win_count: i64,
    pub loss_count: i64,
    pub win_rate: Decimal,
    pub roi: Decimal,
    pub total_pnl: Decimal,
    pub consecutive_losses: i64,
    pub max_consecutive_losses: i64,
}
