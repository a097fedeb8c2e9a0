use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{CopyPosition, Side, TradeMode};

use super::bankroll::{BankrollError, VirtualBankroll};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("transient executor failure: {0}")]
    Transient(String),

    #[error("live executor not configured: {0}")]
    NotConfigured(String),

    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl From<BankrollError> for ExecutorError {
    fn from(e: BankrollError) -> Self {
        match e {
            BankrollError::InsufficientFunds {
                required,
                available,
            } => ExecutorError::InsufficientFunds {
                required,
                available,
            },
            BankrollError::Persistence(inner) => ExecutorError::Persistence(inner.to_string()),
            other => ExecutorError::Rejected(other.to_string()),
        }
    }
}

/// The authoritative post-trade amounts reported by an executor.
#[derive(Debug, Clone)]
pub struct Fill {
    pub price: Decimal,
    pub commission: Decimal,
    pub gas_cost: Decimal,
    /// Paper: the ledger trade id. Live: the venue's order id.
    pub external_id: Option<String>,
    /// Realized net PnL, known at close time for the paper backend.
    pub net_pnl: Option<Decimal>,
}

/// Execution backend behind the engine: paper delegates to the virtual
/// bankroll, live to a gasless Builder-style order path. Exactly two
/// operations, open and close.
pub enum Executor {
    Paper(PaperExecutor),
    Live(LiveExecutor),
}

impl Executor {
    pub fn mode(&self) -> TradeMode {
        match self {
            Executor::Paper(_) => TradeMode::Paper,
            Executor::Live(_) => TradeMode::Live,
        }
    }

    pub async fn open(
        &self,
        market_id: &str,
        side: Side,
        size_usd: Decimal,
        limit_price: Decimal,
        whale_source: Option<String>,
        opportunity_id: Option<Uuid>,
    ) -> Result<Fill, ExecutorError> {
        match self {
            Executor::Paper(paper) => {
                paper
                    .open(market_id, side, size_usd, limit_price, whale_source, opportunity_id)
                    .await
            }
            Executor::Live(live) => live.open(market_id, side, size_usd, limit_price).await,
        }
    }

    pub async fn close(
        &self,
        position: &CopyPosition,
        exit_price: Decimal,
    ) -> Result<Fill, ExecutorError> {
        match self {
            Executor::Paper(paper) => paper.close(position, exit_price).await,
            Executor::Live(live) => live.close(position, exit_price).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Paper backend
// ---------------------------------------------------------------------------

pub struct PaperExecutor {
    bankroll: Arc<VirtualBankroll>,
    commission_rate: Decimal,
    gas_cost_usd: Decimal,
}

impl PaperExecutor {
    pub fn new(bankroll: Arc<VirtualBankroll>, commission_rate: Decimal, gas_cost_usd: Decimal) -> Self {
        Self {
            bankroll,
            commission_rate,
            gas_cost_usd,
        }
    }

    async fn open(
        &self,
        market_id: &str,
        side: Side,
        size_usd: Decimal,
        limit_price: Decimal,
        whale_source: Option<String>,
        opportunity_id: Option<Uuid>,
    ) -> Result<Fill, ExecutorError> {
        let commission = size_usd * self.commission_rate;
        let trade_id = self
            .bankroll
            .open_position(
                market_id,
                side,
                size_usd,
                limit_price,
                commission,
                self.gas_cost_usd,
                whale_source,
                opportunity_id,
            )
            .await?;

        Ok(Fill {
            price: limit_price,
            commission,
            gas_cost: self.gas_cost_usd,
            external_id: Some(trade_id.to_string()),
            net_pnl: None,
        })
    }

    async fn close(
        &self,
        position: &CopyPosition,
        exit_price: Decimal,
    ) -> Result<Fill, ExecutorError> {
        let commission = position.size_usd * self.commission_rate;
        let closed = self
            .bankroll
            .close_position(position.position_id, exit_price, commission, self.gas_cost_usd)
            .await?;

        Ok(Fill {
            price: exit_price,
            commission: closed.commission,
            gas_cost: closed.gas_cost,
            external_id: Some(closed.trade_id.to_string()),
            net_pnl: Some(closed.net_pnl),
        })
    }
}

// ---------------------------------------------------------------------------
// Live backend (Builder-style gasless order path)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BuilderOrderResponse {
    success: bool,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    fill_price: Option<Decimal>,
    #[serde(default)]
    commission: Option<Decimal>,
    #[serde(default)]
    error: Option<String>,
}

/// Live execution through a Builder-API-shaped endpoint. The wire format is
/// deliberately thin; the returned fill is what gets persisted.
pub struct LiveExecutor {
    http: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl LiveExecutor {
    pub fn new(http: reqwest::Client, endpoint: Option<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            endpoint,
            api_key,
        }
    }

    fn credentials(&self) -> Result<(&str, &str), ExecutorError> {
        match (&self.endpoint, &self.api_key) {
            (Some(endpoint), Some(key)) => Ok((endpoint, key)),
            _ => Err(ExecutorError::NotConfigured(
                "builder endpoint/credentials missing".into(),
            )),
        }
    }

    async fn open(
        &self,
        market_id: &str,
        side: Side,
        size_usd: Decimal,
        limit_price: Decimal,
    ) -> Result<Fill, ExecutorError> {
        let (endpoint, key) = self.credentials()?;

        let body = serde_json::json!({
            "token_id": market_id,
            "side": side.as_str().to_uppercase(),
            "size": size_usd.to_string(),
            "price": limit_price.to_string(),
        });

        let response = self
            .http
            .post(format!("{endpoint}/order"))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExecutorError::Transient(e.to_string()))?;

        let parsed: BuilderOrderResponse = response
            .json()
            .await
            .map_err(|e| ExecutorError::Transient(e.to_string()))?;

        if !parsed.success {
            return Err(ExecutorError::Rejected(
                parsed.error.unwrap_or_else(|| "builder rejected order".into()),
            ));
        }

        Ok(Fill {
            price: parsed.fill_price.unwrap_or(limit_price),
            commission: parsed.commission.unwrap_or(Decimal::ZERO),
            gas_cost: Decimal::ZERO, // gasless path
            external_id: parsed.order_id,
            net_pnl: None,
        })
    }

    async fn close(
        &self,
        position: &CopyPosition,
        exit_price: Decimal,
    ) -> Result<Fill, ExecutorError> {
        // Closing is the opposite-side order for the same notional.
        self.open(
            &position.market_id,
            position.side.opposite(),
            position.size_usd,
            exit_price,
        )
        .await
    }
}
