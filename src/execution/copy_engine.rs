use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::SizingConfig;
use crate::db::opportunity_repo;
use crate::models::{CopyPosition, Side, TradeMode, WhaleSignal};
use crate::services::price_cache::PriceCache;

use super::bankroll::VirtualBankroll;
use super::executor::{Executor, ExecutorError, Fill};
use super::position_sizer;
use super::risk_manager::RiskManager;

/// Identical signals inside this window collapse to one.
const DEDUP_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CopyEngineConfig {
    pub mode: TradeMode,
    /// Signals from whales scoring above this are rejected outright.
    pub risk_score_max: i16,
    pub sizing: SizingConfig,
}

// ---------------------------------------------------------------------------
// Signal classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Open,
    ScaleIn,
    Ignore,
    Close,
}

/// Classify a signal against the open position for (whale, market).
/// Same-direction repeats scale in only when configured; an
/// opposite-direction signal is an exit, never a reversal.
pub fn classify_signal(
    existing_side: Option<Side>,
    signal_side: Side,
    scale_in_enabled: bool,
) -> SignalAction {
    match existing_side {
        None => SignalAction::Open,
        Some(side) if side == signal_side => {
            if scale_in_enabled {
                SignalAction::ScaleIn
            } else {
                SignalAction::Ignore
            }
        }
        Some(_) => SignalAction::Close,
    }
}

// ---------------------------------------------------------------------------
// Dedup buffer
// ---------------------------------------------------------------------------

/// Suppresses identical (whale, market, side, price, traded_at) signals
/// delivered within the dedup window.
pub struct DedupBuffer {
    seen: HashMap<String, Instant>,
    window: Duration,
}

impl DedupBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            window,
        }
    }

    fn key(signal: &WhaleSignal) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            signal.trade.wallet,
            signal.trade.market_id,
            signal.trade.side,
            signal.trade.price,
            signal.trade.traded_at.timestamp_millis(),
        )
    }

    /// True when the signal is fresh; records it either way.
    pub fn check(&mut self, signal: &WhaleSignal, now: Instant) -> bool {
        self.seen
            .retain(|_, at| now.duration_since(*at) <= self.window);

        let key = Self::key(signal);
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, now);
        true
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// One open position per (whale, market); scale-ins append legs, and a
/// close unwinds every leg.
struct TrackedPosition {
    side: Side,
    legs: Vec<CopyPosition>,
}

impl TrackedPosition {
    fn total_size(&self) -> Decimal {
        self.legs.iter().map(|l| l.size_usd).sum()
    }
}

/// Converts qualified-whale trade signals into execution decisions: sizing
/// via fractional Kelly, risk gating, dispatch to the executor, and exit
/// when the source whale exits.
pub struct CopyEngine {
    pool: PgPool,
    executor: Executor,
    risk: Arc<RiskManager>,
    bankroll: Arc<VirtualBankroll>,
    /// Latest known market prices, used to mark emergency-unwind exits.
    prices: PriceCache,
    config: CopyEngineConfig,
    positions: HashMap<(String, String), TrackedPosition>,
    dedup: DedupBuffer,
}

impl CopyEngine {
    pub fn new(
        pool: PgPool,
        executor: Executor,
        risk: Arc<RiskManager>,
        bankroll: Arc<VirtualBankroll>,
        prices: PriceCache,
        config: CopyEngineConfig,
    ) -> Self {
        Self {
            pool,
            executor,
            risk,
            bankroll,
            prices,
            config,
            positions: HashMap::new(),
            dedup: DedupBuffer::new(DEDUP_WINDOW),
        }
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    /// Rebuild the copied-position map from open virtual trade rows so a
    /// restart resumes tracking where the previous run stopped.
    pub async fn load_open_positions(&mut self) -> anyhow::Result<usize> {
        let mut recovered = 0usize;

        for trade in crate::db::trade_repo::open_trades(&self.pool).await? {
            let Some(whale) = trade.whale_source.clone() else {
                continue;
            };
            let Some(side) = Side::from_api_str(&trade.side) else {
                continue;
            };

            let risk_score = crate::db::whale_repo::get_whale(&self.pool, &whale)
                .await?
                .map(|w| w.risk_score)
                .unwrap_or(10);

            let key = (whale.clone(), trade.market_id.clone());
            let position = CopyPosition {
                position_id: trade.trade_id,
                whale_address: whale,
                market_id: trade.market_id.clone(),
                side,
                size_usd: trade.size,
                entry_price: trade.price,
                opened_at: trade.executed_at,
                whale_risk_score_at_open: risk_score,
                mode: self.config.mode,
            };

            self.risk.record_open(&position.market_id, position.size_usd).await;
            self.positions
                .entry(key)
                .or_insert_with(|| TrackedPosition {
                    side,
                    legs: Vec::new(),
                })
                .legs
                .push(position);
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!(positions = recovered, "Recovered open copy positions");
        }
        Ok(recovered)
    }

    /// Entry point for one whale signal.
    pub async fn on_whale_trade(&mut self, signal: &WhaleSignal) -> anyhow::Result<()> {
        // 1. Source quality gate.
        if !signal.whale_stats.status.is_copyable() {
            tracing::debug!(wallet = %short(&signal.trade.wallet), "Signal from non-copyable whale");
            return Ok(());
        }
        if signal.whale_stats.risk_score > self.config.risk_score_max {
            tracing::debug!(
                wallet = %short(&signal.trade.wallet),
                risk_score = signal.whale_stats.risk_score,
                "Whale risk score above ceiling"
            );
            return Ok(());
        }

        // 2. Dedup.
        if !self.dedup.check(signal, Instant::now()) {
            counter!("signals_deduplicated").increment(1);
            return Ok(());
        }

        // 3. Classify open vs close.
        let key = (
            signal.trade.wallet.to_lowercase(),
            signal.trade.market_id.clone(),
        );

        // The kill-switch sweep in `handle_kill_switch` closes positions at
        // the cached price; one it could not price closes here as soon as a
        // fresh market price arrives.
        if self.risk.is_killed().await {
            if self.risk.emergency_unwind_enabled() && self.positions.contains_key(&key) {
                tracing::warn!(market = %key.1, "Emergency unwind of copied position");
                return self
                    .close_position_at(key, signal.trade.price, "emergency unwind")
                    .await;
            }
        }

        let existing_side = self.positions.get(&key).map(|p| p.side);
        let action = classify_signal(
            existing_side,
            signal.trade.side,
            self.config.sizing.scale_in,
        );

        match action {
            SignalAction::Open => self.open_from_signal(signal, key, None).await,
            SignalAction::ScaleIn => {
                let headroom = {
                    let bankroll = self.bankroll.total_capital().await;
                    let max_total = bankroll * self.config.sizing.max_position_frac;
                    let current = self.positions.get(&key).map(|p| p.total_size()).unwrap_or_default();
                    max_total - current
                };
                if headroom <= Decimal::ZERO {
                    tracing::debug!(market = %signal.trade.market_id, "Scale-in at position cap");
                    return Ok(());
                }
                self.open_from_signal(signal, key, Some(headroom)).await
            }
            SignalAction::Ignore => {
                tracing::debug!(market = %signal.trade.market_id, "Same-direction repeat ignored");
                Ok(())
            }
            SignalAction::Close => self.close_from_signal(signal, key).await,
        }
    }

    async fn open_from_signal(
        &mut self,
        signal: &WhaleSignal,
        key: (String, String),
        size_cap: Option<Decimal>,
    ) -> anyhow::Result<()> {
        // 4. Size via fractional Kelly.
        let bankroll = self.bankroll.total_capital().await;
        let size = match position_sizer::kelly_copy_size(
            bankroll,
            signal.trade.price,
            signal.whale_stats.rank_score_norm,
            &self.config.sizing,
        ) {
            Some(size) => size,
            None => {
                tracing::warn!(price = %signal.trade.price, "Malformed signal price, skipping");
                return Ok(());
            }
        };
        let size = match size_cap {
            Some(cap) => size.min(cap),
            None => size,
        };
        if size <= Decimal::ZERO {
            tracing::debug!(wallet = %short(&signal.trade.wallet), "Sized to zero, skipping");
            return Ok(());
        }

        // 5. Risk gate.
        if let Err(violation) = self
            .risk
            .can_trade(&signal.trade.market_id, size, self.config.mode, None)
            .await
        {
            tracing::warn!(violation = %violation, market = %signal.trade.market_id, "Risk gate refused trade");
            self.risk.record_block(&violation).await;
            return Ok(());
        }

        // 6. Dispatch.
        let opportunity_id = Uuid::new_v4();
        opportunity_repo::insert_opportunity(&self.pool, opportunity_id, signal).await?;

        let fill = match self
            .execute_open_with_retry(signal, size, opportunity_id)
            .await
        {
            Ok(fill) => fill,
            Err(e) => {
                self.handle_executor_error(&e, opportunity_id).await;
                return Ok(());
            }
        };

        opportunity_repo::mark_outcome(&self.pool, opportunity_id, true, None).await?;
        counter!("copy_trades_opened").increment(1);

        let position_id = fill
            .external_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok())
            .unwrap_or_else(Uuid::new_v4);

        let position = CopyPosition {
            position_id,
            whale_address: key.0.clone(),
            market_id: key.1.clone(),
            side: signal.trade.side,
            size_usd: size,
            entry_price: fill.price,
            opened_at: Utc::now(),
            whale_risk_score_at_open: signal.whale_stats.risk_score,
            mode: self.config.mode,
        };

        self.risk.record_open(&position.market_id, size).await;

        tracing::info!(
            wallet = %short(&key.0),
            market = %key.1,
            side = %signal.trade.side,
            size = %size,
            fill_price = %fill.price,
            "Copy position opened"
        );

        self.positions
            .entry(key)
            .or_insert_with(|| TrackedPosition {
                side: signal.trade.side,
                legs: Vec::new(),
            })
            .legs
            .push(position);

        Ok(())
    }

    async fn close_from_signal(
        &mut self,
        signal: &WhaleSignal,
        key: (String, String),
    ) -> anyhow::Result<()> {
        self.close_position_at(key, signal.trade.price, "whale exit")
            .await
    }

    /// Close every leg of the position at `exit_price`. Legs whose close
    /// fails stay tracked for reconciliation.
    async fn close_position_at(
        &mut self,
        key: (String, String),
        exit_price: Decimal,
        reason: &str,
    ) -> anyhow::Result<()> {
        let tracked = match self.positions.remove(&key) {
            Some(p) => p,
            None => return Ok(()),
        };

        let mut total_net = Decimal::ZERO;
        let mut remaining: Vec<CopyPosition> = Vec::new();

        for leg in &tracked.legs {
            match self.executor.close(leg, exit_price).await {
                Ok(fill) => {
                    let net = fill
                        .net_pnl
                        .unwrap_or_else(|| net_from_fill(leg, &fill));
                    total_net += net;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        position_id = %leg.position_id,
                        "Close failed; leg stays open for reconciliation"
                    );
                    self.risk.record_execution_failure().await;
                    remaining.push(leg.clone());
                }
            }
        }

        let closed_size = tracked.total_size()
            - remaining.iter().map(|l| l.size_usd).sum::<Decimal>();

        if !remaining.is_empty() {
            self.positions.insert(
                key.clone(),
                TrackedPosition {
                    side: tracked.side,
                    legs: remaining,
                },
            );
        }

        if closed_size > Decimal::ZERO {
            counter!("copy_trades_closed").increment(1);
            self.risk
                .record_outcome(&key.1, closed_size, total_net)
                .await;

            tracing::info!(
                wallet = %short(&key.0),
                market = %key.1,
                exit_price = %exit_price,
                net_pnl = %total_net,
                reason,
                "Copy position closed"
            );
        }

        Ok(())
    }

    /// Force-close every open copied position at the latest known market
    /// price. Positions with no usable price stay open; they close on the
    /// next priced signal or reconcile on restart.
    pub async fn unwind_all(&mut self) -> anyhow::Result<usize> {
        let keys: Vec<(String, String)> = self.positions.keys().cloned().collect();
        let mut closed = 0usize;

        for key in keys {
            let price = match self.prices.get(&key.1) {
                Some(p) if p > Decimal::ZERO && p < Decimal::ONE => p,
                _ => {
                    tracing::warn!(
                        market = %key.1,
                        "No usable price for unwind; position left open"
                    );
                    continue;
                }
            };

            self.close_position_at(key.clone(), price, "emergency unwind")
                .await?;
            if !self.positions.contains_key(&key) {
                closed += 1;
            }
        }

        Ok(closed)
    }

    /// React to a kill-switch activation: with emergency unwind enabled
    /// every open position is closed immediately; otherwise positions are
    /// left in place and only new opens are blocked.
    pub async fn handle_kill_switch(&mut self) -> anyhow::Result<()> {
        if !self.risk.emergency_unwind_enabled() {
            tracing::info!(
                open_positions = self.positions.len(),
                "Kill switch active; open paper positions left in place"
            );
            return Ok(());
        }

        let closed = self.unwind_all().await?;
        tracing::warn!(closed, remaining = self.positions.len(), "Emergency unwind complete");
        Ok(())
    }

    /// Transient executor failures are retried once; everything else aborts
    /// the trade.
    async fn execute_open_with_retry(
        &self,
        signal: &WhaleSignal,
        size: Decimal,
        opportunity_id: Uuid,
    ) -> Result<Fill, ExecutorError> {
        let attempt = self
            .executor
            .open(
                &signal.trade.market_id,
                signal.trade.side,
                size,
                signal.trade.price,
                Some(signal.trade.wallet.to_lowercase()),
                Some(opportunity_id),
            )
            .await;

        match attempt {
            Err(ExecutorError::Transient(reason)) => {
                tracing::warn!(reason, "Transient execution failure, retrying once");
                self.executor
                    .open(
                        &signal.trade.market_id,
                        signal.trade.side,
                        size,
                        signal.trade.price,
                        Some(signal.trade.wallet.to_lowercase()),
                        Some(opportunity_id),
                    )
                    .await
            }
            other => other,
        }
    }

    async fn handle_executor_error(&self, error: &ExecutorError, opportunity_id: Uuid) {
        counter!("copy_trades_failed").increment(1);
        tracing::error!(error = %error, "Copy trade execution failed");

        let reason = error.to_string();
        if let Err(e) =
            opportunity_repo::mark_outcome(&self.pool, opportunity_id, false, Some(&reason)).await
        {
            tracing::error!(error = %e, "Failed to mark opportunity outcome");
        }

        match error {
            ExecutorError::InsufficientFunds { .. } => {
                // Not an executor fault; audit and move on.
                if let Err(e) = crate::db::risk_repo::insert_risk_event(
                    &self.pool,
                    "insufficient_funds",
                    crate::models::RiskSeverity::Warning,
                    &reason,
                )
                .await
                {
                    tracing::error!(error = %e, "Failed to persist risk event");
                }
            }
            _ => self.risk.record_execution_failure().await,
        }
    }
}

/// Engine-side PnL when the executor's fill does not carry it (live mode):
/// probability-unit gross minus the reported fees.
fn net_from_fill(position: &CopyPosition, fill: &Fill) -> Decimal {
    let move_frac = (fill.price - position.entry_price) / position.entry_price;
    let gross = match position.side {
        Side::Buy => position.size_usd * move_frac,
        Side::Sell => -(position.size_usd * move_frac),
    };
    gross - fill.commission - fill.gas_cost
}

/// Engine task: consumes whale signals until shutdown, reacting to
/// kill-switch activations as they happen.
pub async fn run_copy_engine(
    mut engine: CopyEngine,
    mut rx: mpsc::Receiver<WhaleSignal>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut kill_rx = engine.risk.kill_signal();
    tracing::info!(mode = %engine.config.mode, "Copy engine started");

    loop {
        tokio::select! {
            _ = kill_rx.changed() => {
                if *kill_rx.borrow() {
                    if let Err(e) = engine.handle_kill_switch().await {
                        tracing::error!(error = %e, "Kill-switch handling failed");
                    }
                }
            }
            signal = rx.recv() => {
                match signal {
                    Some(signal) => {
                        if let Err(e) = engine.on_whale_trade(&signal).await {
                            tracing::error!(
                                error = %e,
                                wallet = %short(&signal.trade.wallet),
                                "Signal processing failed"
                            );
                        }
                    }
                    None => {
                        tracing::warn!("Signal channel closed, copy engine stopping");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Copy engine shutting down");
                    break;
                }
            }
        }
    }
}

fn short(address: &str) -> &str {
    &address[..10.min(address.len())]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
