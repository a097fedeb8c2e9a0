use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashMap;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::config::RiskConfig;
use crate::db::risk_repo;
use crate::models::{RiskSeverity, TradeMode};

/// Pre-trade gate refusal.
#[derive(Debug, Error)]
pub enum RiskViolation {
    #[error("kill switch active: {0}")]
    KillSwitchActive(String),

    #[error("daily loss limit reached: pnl {pnl}, limit -{limit}")]
    DailyLossExceeded { pnl: Decimal, limit: Decimal },

    #[error("total exposure {exposure} + {size} exceeds limit {limit}")]
    ExposureExceeded {
        exposure: Decimal,
        size: Decimal,
        limit: Decimal,
    },

    #[error("market exposure {exposure} + {size} exceeds per-market limit {limit}")]
    MarketExposureExceeded {
        exposure: Decimal,
        size: Decimal,
        limit: Decimal,
    },

    #[error("gas price {gas} gwei above ceiling {limit}")]
    GasTooHigh { gas: Decimal, limit: Decimal },
}

#[derive(Debug, Default)]
struct RiskState {
    daily_pnl: Decimal,
    consecutive_losses: i64,
    exposure_by_market: HashMap<String, Decimal>,
    kill_reason: Option<String>,
    failed_executions: VecDeque<Instant>,
    current_day: Option<NaiveDate>,
}

impl RiskState {
    fn total_exposure(&self) -> Decimal {
        self.exposure_by_market.values().copied().sum()
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if self.current_day != Some(today) {
            self.current_day = Some(today);
            self.daily_pnl = Decimal::ZERO;
            self.consecutive_losses = 0;
            // A kill caused by daily limits lifts with the new day.
            if let Some(reason) = &self.kill_reason {
                if reason.contains("daily") || reason.contains("consecutive") {
                    self.kill_reason = None;
                }
            }
        }
    }
}

/// Pre-trade gate, kill switch, and post-trade bookkeeping. State is small;
/// one mutex serializes it.
pub struct RiskManager {
    pool: PgPool,
    config: RiskConfig,
    bankroll: Decimal,
    state: Mutex<RiskState>,
    kill_tx: watch::Sender<bool>,
}

impl RiskManager {
    pub fn new(pool: PgPool, config: RiskConfig, bankroll: Decimal) -> Self {
        let (kill_tx, _) = watch::channel(false);
        Self {
            pool,
            config,
            bankroll,
            state: Mutex::new(RiskState::default()),
            kill_tx,
        }
    }

    /// Observable kill-switch activation; the copy engine watches this to
    /// run the emergency unwind immediately, not on the next signal.
    pub fn kill_signal(&self) -> watch::Receiver<bool> {
        self.kill_tx.subscribe()
    }

    /// All gates must pass for a new position of `size` in `market_id`.
    /// The gas ceiling applies in live mode only.
    pub async fn can_trade(
        &self,
        market_id: &str,
        size: Decimal,
        mode: TradeMode,
        current_gas_gwei: Option<Decimal>,
    ) -> Result<(), RiskViolation> {
        let mut state = self.state.lock().await;
        state.roll_day(Utc::now().date_naive());

        if let Some(reason) = &state.kill_reason {
            return Err(RiskViolation::KillSwitchActive(reason.clone()));
        }

        if state.daily_pnl <= -self.config.max_daily_loss {
            return Err(RiskViolation::DailyLossExceeded {
                pnl: state.daily_pnl,
                limit: self.config.max_daily_loss,
            });
        }

        if state.consecutive_losses >= self.config.max_consecutive_losses {
            return Err(RiskViolation::KillSwitchActive(format!(
                "{} consecutive losses",
                state.consecutive_losses
            )));
        }

        let max_exposure = self.bankroll * self.config.max_exposure_frac;
        let exposure = state.total_exposure();
        if exposure + size > max_exposure {
            return Err(RiskViolation::ExposureExceeded {
                exposure,
                size,
                limit: max_exposure,
            });
        }

        let market_exposure = state
            .exposure_by_market
            .get(market_id)
            .copied()
            .unwrap_or(Decimal::ZERO);
        if market_exposure + size > self.config.max_position_per_market {
            return Err(RiskViolation::MarketExposureExceeded {
                exposure: market_exposure,
                size,
                limit: self.config.max_position_per_market,
            });
        }

        if mode == TradeMode::Live {
            if let Some(gas) = current_gas_gwei {
                if gas > self.config.max_gas_gwei {
                    return Err(RiskViolation::GasTooHigh {
                        gas,
                        limit: self.config.max_gas_gwei,
                    });
                }
            }
        }

        Ok(())
    }

    pub async fn record_open(&self, market_id: &str, size: Decimal) {
        let mut state = self.state.lock().await;
        *state
            .exposure_by_market
            .entry(market_id.to_string())
            .or_default() += size;
    }

    /// Post-trade bookkeeping after a close. Checks every kill trigger.
    pub async fn record_outcome(&self, market_id: &str, size: Decimal, pnl: Decimal) {
        let mut kill: Option<String> = None;
        {
            let mut state = self.state.lock().await;
            state.roll_day(Utc::now().date_naive());

            if let Some(exposure) = state.exposure_by_market.get_mut(market_id) {
                *exposure -= size;
                if *exposure <= Decimal::ZERO {
                    state.exposure_by_market.remove(market_id);
                }
            }

            state.daily_pnl += pnl;
            if pnl < Decimal::ZERO {
                state.consecutive_losses += 1;
            } else {
                state.consecutive_losses = 0;
            }

            let single_trade_limit = self.bankroll * self.config.single_trade_drawdown_frac;
            if -pnl > single_trade_limit {
                kill = Some(format!(
                    "single-trade drawdown {} exceeds {}",
                    -pnl, single_trade_limit
                ));
            } else if state.daily_pnl <= -self.config.max_daily_loss {
                kill = Some(format!(
                    "daily loss {} at limit {}",
                    state.daily_pnl, self.config.max_daily_loss
                ));
            } else if state.consecutive_losses >= self.config.max_consecutive_losses {
                kill = Some(format!("{} consecutive losses", state.consecutive_losses));
            }
        }

        if let Some(reason) = kill {
            self.trigger_kill_switch(&reason).await;
        }
    }

    /// Failed executions inside the rolling window trip the kill switch.
    pub async fn record_execution_failure(&self) {
        let now = Instant::now();
        let mut kill = false;
        {
            let mut state = self.state.lock().await;
            state.failed_executions.push_back(now);
            while let Some(&front) = state.failed_executions.front() {
                if now.duration_since(front) > self.config.failed_execution_window {
                    state.failed_executions.pop_front();
                } else {
                    break;
                }
            }
            if state.failed_executions.len() >= self.config.failed_execution_threshold {
                kill = true;
            }
        }

        if kill {
            self.trigger_kill_switch("repeated execution failures").await;
        }
    }

    /// Manual or automatic activation. Live execution halts; open paper
    /// positions are left alone unless emergency unwind is configured.
    pub async fn trigger_kill_switch(&self, reason: &str) {
        {
            let mut state = self.state.lock().await;
            if state.kill_reason.is_some() {
                return;
            }
            state.kill_reason = Some(reason.to_string());
        }

        tracing::error!(reason, "KILL SWITCH TRIPPED");
        metrics::counter!("kill_switch_activations").increment(1);
        let _ = self.kill_tx.send(true);

        if let Err(e) =
            risk_repo::insert_risk_event(&self.pool, "kill_switch", RiskSeverity::Critical, reason)
                .await
        {
            tracing::error!(error = %e, "Failed to persist kill-switch event");
        }
    }

    pub async fn is_killed(&self) -> bool {
        self.state.lock().await.kill_reason.is_some()
    }

    pub async fn kill_reason(&self) -> Option<String> {
        self.state.lock().await.kill_reason.clone()
    }

    pub async fn daily_pnl(&self) -> Decimal {
        self.state.lock().await.daily_pnl
    }

    pub fn emergency_unwind_enabled(&self) -> bool {
        self.config.emergency_unwind
    }

    /// Persist a non-fatal gate refusal for the audit trail.
    pub async fn record_block(&self, violation: &RiskViolation) {
        metrics::counter!("risk_blocks").increment(1);
        if let Err(e) = risk_repo::insert_risk_event(
            &self.pool,
            "risk_block",
            RiskSeverity::Warning,
            &violation.to_string(),
        )
        .await
        {
            tracing::error!(error = %e, "Failed to persist risk event");
        }
    }
}
