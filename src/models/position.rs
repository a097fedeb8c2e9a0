use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Side, TradeMode};

/// An open copied position owned by the copy engine.
///
/// At most one open position exists per (whale, market, side); an
/// opposite-direction signal from the same whale is an exit, not a reversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyPosition {
    pub position_id: Uuid,
    pub whale_address: String,
    pub market_id: String,
    pub side: Side,
    pub size_usd: Decimal,
    pub entry_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub whale_risk_score_at_open: i16,
    pub mode: TradeMode,
}
