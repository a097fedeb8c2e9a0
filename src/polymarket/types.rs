use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Trade (Data API — REST)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiTrade {
    pub id: Option<String>,
    #[serde(default, alias = "conditionId")]
    pub market: Option<String>,
    #[serde(default, alias = "asset")]
    pub asset_id: Option<String>,
    pub side: Option<String>,
    #[serde(default)]
    pub size: Option<Decimal>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default, alias = "proxyWallet")]
    pub proxy_wallet: Option<String>,
    pub maker_address: Option<String>,
    pub taker_address: Option<String>,
    /// Epoch seconds, epoch milliseconds, or RFC 3339 depending on endpoint.
    pub timestamp: Option<serde_json::Value>,
    #[serde(default, alias = "transactionHash")]
    pub transaction_hash: Option<String>,
}

impl ApiTrade {
    /// Best-effort wallet attribution.
    pub fn wallet(&self) -> Option<&str> {
        self.proxy_wallet
            .as_deref()
            .or(self.taker_address.as_deref())
            .or(self.maker_address.as_deref())
    }

    pub fn traded_at(&self) -> Option<DateTime<Utc>> {
        parse_flexible_timestamp(self.timestamp.as_ref())
    }

    /// Stable dedup key: the API id when present, else the transaction hash.
    pub fn external_id(&self) -> Option<String> {
        self.id
            .clone()
            .or_else(|| self.transaction_hash.clone())
    }
}

/// Timestamps arrive as epoch seconds, epoch millis or RFC 3339 strings.
pub fn parse_flexible_timestamp(ts: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    ts.and_then(|t| match t {
        serde_json::Value::Number(n) => from_epoch(n.as_i64()?),
        serde_json::Value::String(s) => {
            if let Ok(secs) = s.parse::<i64>() {
                return from_epoch(secs);
            }
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        _ => None,
    })
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    // Values above 1e12 are milliseconds.
    if raw > 1_000_000_000_000 {
        chrono::DateTime::from_timestamp(raw / 1000, ((raw % 1000) * 1_000_000) as u32)
    } else {
        chrono::DateTime::from_timestamp(raw, 0)
    }
}

// ---------------------------------------------------------------------------
// Position (Data API)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiPosition {
    #[serde(default, alias = "conditionId")]
    pub market: Option<String>,
    #[serde(default, alias = "asset")]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub size: Option<Decimal>,
    #[serde(default, alias = "avgPrice")]
    pub avg_price: Option<Decimal>,
    #[serde(default, alias = "currentValue")]
    pub current_value: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Market (Data API)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiMarket {
    pub condition_id: String,
    pub question: Option<String>,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub volume: Option<Decimal>,
    #[serde(default)]
    pub liquidity: Option<Decimal>,
    /// Open interest proxy used for the top-K subscription cut.
    #[serde(default, alias = "openInterest")]
    pub open_interest: Option<Decimal>,
    #[serde(default, alias = "clobTokenIds")]
    pub clob_token_ids: Option<String>,
    #[serde(default)]
    pub tokens: Vec<ApiToken>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiToken {
    pub token_id: String,
    #[serde(default)]
    pub outcome: Option<String>,
}

impl ApiMarket {
    /// Token IDs from either the structured list or the JSON-encoded column.
    pub fn token_ids(&self) -> Vec<String> {
        if !self.tokens.is_empty() {
            return self.tokens.iter().map(|t| t.token_id.clone()).collect();
        }
        self.clob_token_ids
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// WebSocket frames
// ---------------------------------------------------------------------------

/// Initial subscription after connect:
/// `{"assets_ids": [...], "type": "market"}`
#[derive(Debug, Clone, Serialize)]
pub struct WsSubscribe {
    pub assets_ids: Vec<String>,
    #[serde(rename = "type")]
    pub channel: String,
}

impl WsSubscribe {
    pub fn market(asset_ids: &[String]) -> Self {
        Self {
            assets_ids: asset_ids.to_vec(),
            channel: "market".into(),
        }
    }
}

/// Incremental change on a live connection:
/// `{"assets_ids": [...], "operation": "subscribe" | "unsubscribe"}`
#[derive(Debug, Clone, Serialize)]
pub struct WsOperation {
    pub assets_ids: Vec<String>,
    pub operation: String,
}

impl WsOperation {
    pub fn subscribe(asset_ids: &[String]) -> Self {
        Self {
            assets_ids: asset_ids.to_vec(),
            operation: "subscribe".into(),
        }
    }

    pub fn unsubscribe(asset_ids: &[String]) -> Self {
        Self {
            assets_ids: asset_ids.to_vec(),
            operation: "unsubscribe".into(),
        }
    }
}

/// Raw inbound market-channel event; `event_type` selects the payload shape.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WsEvent {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub best_bid: Option<String>,
    #[serde(default)]
    pub best_ask: Option<String>,
    #[serde(default)]
    pub bids: Option<Vec<WsBookLevel>>,
    #[serde(default)]
    pub asks: Option<Vec<WsBookLevel>>,
    #[serde(default, alias = "taker_address")]
    pub taker: Option<String>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WsBookLevel {
    pub price: String,
    pub size: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flexible_timestamp_parses_seconds_millis_and_rfc3339() {
        let secs = json!(1_700_000_000i64);
        let millis = json!(1_700_000_000_123i64);
        let iso = json!("2023-11-14T22:13:20Z");

        let from_secs = parse_flexible_timestamp(Some(&secs)).unwrap();
        let from_millis = parse_flexible_timestamp(Some(&millis)).unwrap();
        let from_iso = parse_flexible_timestamp(Some(&iso)).unwrap();

        assert_eq!(from_secs.timestamp(), 1_700_000_000);
        assert_eq!(from_millis.timestamp(), 1_700_000_000);
        assert_eq!(from_iso.timestamp(), 1_700_000_000);
        assert_eq!(parse_flexible_timestamp(Some(&json!(null))), None);
    }

    #[test]
    fn subscribe_frames_serialize_to_wire_format() {
        let ids = vec!["111".to_string(), "222".to_string()];
        let initial = serde_json::to_value(WsSubscribe::market(&ids)).unwrap();
        assert_eq!(initial["type"], "market");
        assert_eq!(initial["assets_ids"][1], "222");

        let unsub = serde_json::to_value(WsOperation::unsubscribe(&ids[..1])).unwrap();
        assert_eq!(unsub["operation"], "unsubscribe");
    }

    #[test]
    fn market_token_ids_fall_back_to_encoded_column() {
        let market = ApiMarket {
            condition_id: "0xabc".into(),
            question: None,
            closed: Some(false),
            active: Some(true),
            volume: None,
            liquidity: None,
            open_interest: None,
            clob_token_ids: Some(r#"["101","102"]"#.into()),
            tokens: vec![],
        };
        assert_eq!(market.token_ids(), vec!["101", "102"]);
    }
}
