pub mod bankroll;
pub mod position;
pub mod risk_event;
pub mod trade;
pub mod whale;

pub use bankroll::{BankrollSnapshot, BankrollStats};
pub use position::CopyPosition;
pub use risk_event::{RiskEvent, RiskSeverity};
pub use trade::{TradeStatus, VirtualTradeRecord, WhaleTrade};
pub use whale::{Whale, WhaleStats, WhaleStatus};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" | "0" => Some(Side::Buy),
            "SELL" | "1" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TradeMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    Paper,
    Live,
}

impl TradeMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "paper" => Some(TradeMode::Paper),
            "live" => Some(TradeMode::Live),
            _ => None,
        }
    }
}

impl fmt::Display for TradeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeMode::Paper => write!(f, "paper"),
            TradeMode::Live => write!(f, "live"),
        }
    }
}

// ---------------------------------------------------------------------------
// WhaleTradeEvent — a single observed trade attributed to an address
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleTradeEvent {
    pub wallet: String,
    pub market_id: String,
    pub side: Side,
    pub size_usd: Decimal,
    pub price: Decimal,
    pub traded_at: DateTime<Utc>,
    /// Dedup key; unique per trade at the source.
    pub trade_external_id: String,
}

impl fmt::Display for WhaleTradeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trade: wallet={} market={} side={} size={} price={}",
            &self.wallet[..10.min(self.wallet.len())],
            &self.market_id[..10.min(self.market_id.len())],
            self.side,
            self.size_usd,
            self.price,
        )
    }
}

// ---------------------------------------------------------------------------
// WhaleSignal — normalized trading intent handed to the copy engine
// ---------------------------------------------------------------------------

/// Snapshot of whale quality at signal time, carried so the engine never has
/// to re-query the store on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleStatsSnapshot {
    pub status: WhaleStatus,
    pub risk_score: i16,
    /// Min-max normalized composite rank score over the qualified cohort.
    pub rank_score_norm: Decimal,
    pub total_trades: i64,
    pub total_volume_usd: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleSignal {
    pub trade: WhaleTradeEvent,
    pub whale_stats: WhaleStatsSnapshot,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WhaleEvent — lifecycle notifications from the detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhaleEventKind {
    Discovered,
    Qualified,
    Ranked,
    Demoted,
    Inactive,
}

impl fmt::Display for WhaleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WhaleEventKind::Discovered => "discovered",
            WhaleEventKind::Qualified => "qualified",
            WhaleEventKind::Ranked => "ranked",
            WhaleEventKind::Demoted => "demoted",
            WhaleEventKind::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct WhaleEvent {
    pub kind: WhaleEventKind,
    pub whale: Whale,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parses_api_variants() {
        assert_eq!(Side::from_api_str("BUY"), Some(Side::Buy));
        assert_eq!(Side::from_api_str("sell"), Some(Side::Sell));
        assert_eq!(Side::from_api_str("0"), Some(Side::Buy));
        assert_eq!(Side::from_api_str("1"), Some(Side::Sell));
        assert_eq!(Side::from_api_str("hold"), None);
    }

    #[test]
    fn side_opposite_round_trips() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite().opposite(), Side::Sell);
    }

    #[test]
    fn trade_mode_parse() {
        assert_eq!(TradeMode::parse("paper"), Some(TradeMode::Paper));
        assert_eq!(TradeMode::parse("LIVE"), Some(TradeMode::Live));
        assert_eq!(TradeMode::parse("demo"), None);
    }
}
