use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Lifecycle of a tracked address. Transitions move forward only
/// (`discovered < qualified < ranked`); `rejected` is a terminal sibling of
/// `qualified`. The single allowed backward move is the explicit demotion
/// `qualified → discovered` when re-qualification fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhaleStatus {
    Discovered,
    Qualified,
    Ranked,
    Rejected,
}

impl WhaleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WhaleStatus::Discovered => "discovered",
            WhaleStatus::Qualified => "qualified",
            WhaleStatus::Ranked => "ranked",
            WhaleStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(WhaleStatus::Discovered),
            "qualified" => Some(WhaleStatus::Qualified),
            "ranked" => Some(WhaleStatus::Ranked),
            "rejected" => Some(WhaleStatus::Rejected),
            _ => None,
        }
    }

    /// Ordinal used by the forward-only guard in the store.
    pub fn ordinal(self) -> i16 {
        match self {
            WhaleStatus::Discovered => 0,
            WhaleStatus::Qualified => 1,
            WhaleStatus::Ranked => 2,
            WhaleStatus::Rejected => 3,
        }
    }

    /// Whether the copy engine may act on signals from a whale in this state.
    pub fn is_copyable(self) -> bool {
        matches!(self, WhaleStatus::Qualified | WhaleStatus::Ranked)
    }
}

impl fmt::Display for WhaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database row for the whales table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Whale {
    pub wallet_address: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub total_trades: i64,
    pub total_volume_usd: Decimal,
    pub avg_trade_size_usd: Decimal,
    pub trades_last_3_days: i64,
    pub days_active: i64,
    pub risk_score: i16,
    pub status: String,
    pub is_active: bool,
    pub rank_score: Option<Decimal>,
    pub realized_pnl_usd: Option<Decimal>,
    pub copied_trade_count: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl Whale {
    pub fn status(&self) -> WhaleStatus {
        WhaleStatus::parse(&self.status).unwrap_or(WhaleStatus::Discovered)
    }
}

/// Recomputed activity statistics for one address, produced by the tracker
/// and merged into the whales row.
///
/// `avg_trade_size_usd * total_trades == total_volume_usd` and
/// `trades_last_3_days <= total_trades` hold by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhaleStats {
    pub wallet_address: String,
    pub total_trades: i64,
    pub total_volume_usd: Decimal,
    pub avg_trade_size_usd: Decimal,
    pub trades_last_3_days: i64,
    pub days_active: i64,
    pub last_active_at: Option<DateTime<Utc>>,
    pub risk_score: i16,
    pub realized_pnl_usd: Option<Decimal>,
    pub copied_trade_count: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordering_is_forward() {
        assert!(WhaleStatus::Discovered < WhaleStatus::Qualified);
        assert!(WhaleStatus::Qualified < WhaleStatus::Ranked);
        assert!(WhaleStatus::Discovered.ordinal() < WhaleStatus::Qualified.ordinal());
        assert!(WhaleStatus::Ranked.ordinal() < WhaleStatus::Rejected.ordinal());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            WhaleStatus::Discovered,
            WhaleStatus::Qualified,
            WhaleStatus::Ranked,
            WhaleStatus::Rejected,
        ] {
            assert_eq!(WhaleStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(WhaleStatus::parse("unknown"), None);
    }

    #[test]
    fn only_qualified_and_ranked_are_copyable() {
        assert!(!WhaleStatus::Discovered.is_copyable());
        assert!(WhaleStatus::Qualified.is_copyable());
        assert!(WhaleStatus::Ranked.is_copyable());
        assert!(!WhaleStatus::Rejected.is_copyable());
    }
}
