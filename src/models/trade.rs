use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Database row for the whale_trades table: an observed trade attributed to
/// a tracked address. Idempotent on `trade_external_id`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WhaleTrade {
    pub id: i64,
    pub whale_address: String,
    pub market_id: String,
    pub side: String,
    pub size_usd: Decimal,
    pub price: Decimal,
    pub traded_at: DateTime<Utc>,
    pub trade_external_id: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database row for the trades table: a virtual (paper) trade.
///
/// A closed row always carries `exit_price`, `gross_pnl`, `net_pnl` and
/// `settled_at`, with `net_pnl = gross_pnl - commission - gas_cost_usd`
/// where commission and gas are summed over both legs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VirtualTradeRecord {
    pub id: i64,
    pub trade_id: Uuid,
    pub market_id: String,
    pub side: String,
    pub size: Decimal,
    pub price: Decimal,
    pub exit_price: Option<Decimal>,
    pub exchange: String,
    pub commission: Decimal,
    pub gas_cost_usd: Decimal,
    pub gross_pnl: Option<Decimal>,
    pub total_fees: Option<Decimal>,
    pub net_pnl: Option<Decimal>,
    pub status: String,
    pub whale_source: Option<String>,
    pub opportunity_id: Option<Uuid>,
    pub executed_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl VirtualTradeRecord {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open.as_str()
    }
}
