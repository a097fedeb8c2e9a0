use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{bankroll_repo, trade_repo};
use crate::db::trade_repo::{NewVirtualTrade, TradeClose};
use crate::models::{BankrollSnapshot, BankrollStats, Side};

#[derive(Debug, Error)]
pub enum BankrollError {
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },

    #[error("invalid size: {0}")]
    InvalidSize(Decimal),

    #[error("invalid price: {0}")]
    InvalidPrice(Decimal),

    #[error("no open position {0}")]
    UnknownPosition(Uuid),

    #[error("persistence failed: {0}")]
    Persistence(#[from] sqlx::Error),
}

/// An open virtual position held by the ledger.
#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub trade_id: Uuid,
    pub market_id: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub commission: Decimal,
    pub gas_cost: Decimal,
    pub opened_at: DateTime<Utc>,
    pub whale_source: Option<String>,
}

/// Outcome of closing a position; fees carry both legs summed.
#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub trade_id: Uuid,
    pub market_id: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub commission: Decimal,
    pub gas_cost: Decimal,
    pub gross_pnl: Decimal,
    pub total_fees: Decimal,
    pub net_pnl: Decimal,
    pub whale_source: Option<String>,
    pub settled_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ledger — pure arithmetic
// ---------------------------------------------------------------------------

/// In-memory paper ledger. All PnL is realized at close; there is no
/// mark-to-market here. `total_capital = available + allocated` holds after
/// every operation, and with every position eventually closed the ending
/// balance is the starting balance plus the sum of net PnL.
#[derive(Debug, Clone)]
pub struct Ledger {
    initial: Decimal,
    available: Decimal,
    allocated: Decimal,
    daily_pnl: Decimal,
    daily_drawdown: Decimal,
    peak_capital: Decimal,
    total_trades: i64,
    win_count: i64,
    loss_count: i64,
    consecutive_losses: i64,
    max_consecutive_losses: i64,
    current_day: NaiveDate,
    open_positions: HashMap<Uuid, OpenPosition>,
}

impl Ledger {
    pub fn new(initial: Decimal, today: NaiveDate) -> Self {
        Self {
            initial,
            available: initial,
            allocated: Decimal::ZERO,
            daily_pnl: Decimal::ZERO,
            daily_drawdown: Decimal::ZERO,
            peak_capital: initial,
            total_trades: 0,
            win_count: 0,
            loss_count: 0,
            consecutive_losses: 0,
            max_consecutive_losses: 0,
            current_day: today,
            open_positions: HashMap::new(),
        }
    }

    pub fn available(&self) -> Decimal {
        self.available
    }

    pub fn allocated(&self) -> Decimal {
        self.allocated
    }

    pub fn total_capital(&self) -> Decimal {
        self.available + self.allocated
    }

    pub fn open_position(&self, trade_id: &Uuid) -> Option<&OpenPosition> {
        self.open_positions.get(trade_id)
    }

    pub fn open_position_count(&self) -> usize {
        self.open_positions.len()
    }

    /// Daily counters reset at UTC midnight.
    pub fn roll_day(&mut self, today: NaiveDate) {
        if today != self.current_day {
            self.current_day = today;
            self.daily_pnl = Decimal::ZERO;
            self.daily_drawdown = Decimal::ZERO;
        }
    }

    pub fn open(
        &mut self,
        trade_id: Uuid,
        market_id: &str,
        side: Side,
        size: Decimal,
        price: Decimal,
        commission: Decimal,
        gas_cost: Decimal,
        whale_source: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), BankrollError> {
        if size <= Decimal::ZERO {
            return Err(BankrollError::InvalidSize(size));
        }
        if price <= Decimal::ZERO || price >= Decimal::ONE {
            return Err(BankrollError::InvalidPrice(price));
        }

        let required = size + commission + gas_cost;
        if self.available < required {
            return Err(BankrollError::InsufficientFunds {
                required,
                available: self.available,
            });
        }

        self.available -= required;
        self.allocated += size;
        self.total_trades += 1;
        self.open_positions.insert(
            trade_id,
            OpenPosition {
                trade_id,
                market_id: market_id.to_string(),
                side,
                size,
                entry_price: price,
                commission,
                gas_cost,
                opened_at: now,
                whale_source,
            },
        );
        self.track_peak();

        Ok(())
    }

    /// Close a position at `exit_price`. Gross PnL is in probability units:
    /// a buy of `size` notional at entry `pe` gains `size · (px − pe) / pe`;
    /// a sell is the negation. Reported fees sum both legs, while the cash
    /// movement only charges the close leg (the open leg already left at
    /// open), which is what keeps the conservation law exact.
    pub fn close(
        &mut self,
        trade_id: Uuid,
        exit_price: Decimal,
        commission: Decimal,
        gas_cost: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ClosedTrade, BankrollError> {
        if exit_price <= Decimal::ZERO || exit_price >= Decimal::ONE {
            return Err(BankrollError::InvalidPrice(exit_price));
        }

        let position = self
            .open_positions
            .remove(&trade_id)
            .ok_or(BankrollError::UnknownPosition(trade_id))?;

        let move_frac = (exit_price - position.entry_price) / position.entry_price;
        let gross_pnl = match position.side {
            Side::Buy => position.size * move_frac,
            Side::Sell => -(position.size * move_frac),
        };

        let total_commission = position.commission + commission;
        let total_gas = position.gas_cost + gas_cost;
        let total_fees = total_commission + total_gas;
        let net_pnl = gross_pnl - total_fees;

        self.allocated -= position.size;
        self.available += position.size + gross_pnl - commission - gas_cost;

        if net_pnl > Decimal::ZERO {
            self.win_count += 1;
            self.consecutive_losses = 0;
        } else {
            self.loss_count += 1;
            self.consecutive_losses += 1;
            self.max_consecutive_losses =
                self.max_consecutive_losses.max(self.consecutive_losses);
        }

        self.daily_pnl += net_pnl;
        self.track_peak();
        if self.daily_pnl < Decimal::ZERO && self.peak_capital > Decimal::ZERO {
            let drawdown = -self.daily_pnl / self.peak_capital;
            self.daily_drawdown = self.daily_drawdown.max(drawdown);
        }

        Ok(ClosedTrade {
            trade_id,
            market_id: position.market_id,
            side: position.side,
            size: position.size,
            entry_price: position.entry_price,
            exit_price,
            commission: total_commission,
            gas_cost: total_gas,
            gross_pnl,
            total_fees,
            net_pnl,
            whale_source: position.whale_source,
            settled_at: now,
        })
    }

    fn track_peak(&mut self) {
        self.peak_capital = self.peak_capital.max(self.total_capital());
    }

    pub fn snapshot(&self, timestamp: DateTime<Utc>, label: Option<String>) -> BankrollSnapshot {
        BankrollSnapshot {
            id: 0,
            timestamp,
            total_capital: self.total_capital(),
            allocated: self.allocated,
            available: self.available,
            daily_pnl: self.daily_pnl,
            daily_drawdown: self.daily_drawdown,
            total_trades: self.total_trades,
            win_count: self.win_count,
            loss_count: self.loss_count,
            label,
        }
    }

    pub fn stats(&self) -> BankrollStats {
        let closed = self.win_count + self.loss_count;
        let win_rate = Decimal::from(self.win_count) / Decimal::from(closed.max(1));
        let roi = if self.initial > Decimal::ZERO {
            (self.total_capital() - self.initial) / self.initial
        } else {
            Decimal::ZERO
        };

        BankrollStats {
            total_capital: self.total_capital(),
            available: self.available,
            allocated: self.allocated,
            total_trades: self.total_trades,
            open_positions: self.open_positions.len(),
            closed_trades: closed,
            win_count: self.win_count,
            loss_count: self.loss_count,
            win_rate,
            roi,
            total_pnl: self.total_capital() - self.initial
                + self.open_fees_paid(),
            consecutive_losses: self.consecutive_losses,
            max_consecutive_losses: self.max_consecutive_losses,
        }
    }

    /// Fees locked in by still-open positions; realized capital excludes
    /// them, so total realized PnL adds them back.
    fn open_fees_paid(&self) -> Decimal {
        self.open_positions
            .values()
            .map(|p| p.commission + p.gas_cost)
            .sum()
    }

    /// Test-harness use only: zero everything back to the seed balance.
    pub fn reset(&mut self, today: NaiveDate) {
        *self = Ledger::new(self.initial, today);
    }

    /// Rebuild a ledger from the last persisted snapshot plus the open
    /// positions on record. Consecutive-loss streaks do not survive a
    /// restart; daily counters do, within the same UTC day.
    pub fn restore(
        initial: Decimal,
        snapshot: &BankrollSnapshot,
        open_positions: Vec<OpenPosition>,
        today: NaiveDate,
    ) -> Self {
        let mut ledger = Ledger::new(initial, today);
        ledger.available = snapshot.available;
        ledger.allocated = snapshot.allocated;
        ledger.total_trades = snapshot.total_trades;
        ledger.win_count = snapshot.win_count;
        ledger.loss_count = snapshot.loss_count;
        ledger.peak_capital = initial.max(snapshot.total_capital);
        if snapshot.timestamp.date_naive() == today {
            ledger.daily_pnl = snapshot.daily_pnl;
            ledger.daily_drawdown = snapshot.daily_drawdown;
        }
        ledger.open_positions = open_positions
            .into_iter()
            .map(|p| (p.trade_id, p))
            .collect();
        ledger
    }
}

// ---------------------------------------------------------------------------
// VirtualBankroll — persistence around the ledger
// ---------------------------------------------------------------------------

/// The paper-mode ledger with its persistence contract: every state change
/// commits exactly one trade write and one snapshot in a single transaction
/// *before* the in-memory ledger advances. On a persistence failure the
/// in-memory state is untouched and the caller sees the error.
pub struct VirtualBankroll {
    pool: PgPool,
    ledger: Mutex<Ledger>,
}

impl VirtualBankroll {
    pub fn new(pool: PgPool, initial_bankroll: Decimal) -> Self {
        Self {
            pool,
            ledger: Mutex::new(Ledger::new(initial_bankroll, Utc::now().date_naive())),
        }
    }

    /// Resume from persisted state: the latest snapshot seeds the balances
    /// and every `open` trade row becomes an open position again. With no
    /// history this is the same as `new`.
    pub async fn recover(pool: PgPool, initial_bankroll: Decimal) -> anyhow::Result<Self> {
        let today = Utc::now().date_naive();
        let snapshot = bankroll_repo::latest_snapshot(&pool).await?;
        let open_rows = trade_repo::open_trades(&pool).await?;

        let ledger = match snapshot {
            Some(snapshot) => {
                let positions: Vec<OpenPosition> = open_rows
                    .iter()
                    .filter_map(|t| {
                        Some(OpenPosition {
                            trade_id: t.trade_id,
                            market_id: t.market_id.clone(),
                            side: Side::from_api_str(&t.side)?,
                            size: t.size,
                            entry_price: t.price,
                            commission: t.commission,
                            gas_cost: t.gas_cost_usd,
                            opened_at: t.executed_at,
                            whale_source: t.whale_source.clone(),
                        })
                    })
                    .collect();

                tracing::info!(
                    open_positions = positions.len(),
                    total_capital = %snapshot.total_capital,
                    "Recovered bankroll from store"
                );
                Ledger::restore(initial_bankroll, &snapshot, positions, today)
            }
            None => Ledger::new(initial_bankroll, today),
        };

        Ok(Self {
            pool,
            ledger: Mutex::new(ledger),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn open_position(
        &self,
        market_id: &str,
        side: Side,
        size: Decimal,
        price: Decimal,
        commission: Decimal,
        gas_cost: Decimal,
        whale_source: Option<String>,
        opportunity_id: Option<Uuid>,
    ) -> Result<Uuid, BankrollError> {
        let mut guard = self.ledger.lock().await;
        let now = Utc::now();
        guard.roll_day(now.date_naive());

        let trade_id = Uuid::new_v4();
        let mut next = guard.clone();
        next.open(
            trade_id,
            market_id,
            side,
            size,
            price,
            commission,
            gas_cost,
            whale_source.clone(),
            now,
        )?;

        let record = NewVirtualTrade {
            trade_id,
            market_id: market_id.to_string(),
            side,
            size,
            price,
            commission,
            gas_cost_usd: gas_cost,
            whale_source,
            opportunity_id,
            executed_at: now,
        };
        let snapshot = next.snapshot(now, None);

        trade_repo::open_trade_with_snapshot(&self.pool, &record, &snapshot).await?;
        *guard = next;

        tracing::info!(
            trade_id = %trade_id,
            market = %market_id,
            side = %side,
            size = %size,
            price = %price,
            available = %guard.available(),
            "Virtual position opened"
        );

        Ok(trade_id)
    }

    pub async fn close_position(
        &self,
        trade_id: Uuid,
        exit_price: Decimal,
        commission: Decimal,
        gas_cost: Decimal,
    ) -> Result<ClosedTrade, BankrollError> {
        let mut guard = self.ledger.lock().await;
        let now = Utc::now();
        guard.roll_day(now.date_naive());

        let mut next = guard.clone();
        let closed = next.close(trade_id, exit_price, commission, gas_cost, now)?;

        let close = TradeClose {
            trade_id,
            exit_price,
            commission: closed.commission,
            gas_cost_usd: closed.gas_cost,
            gross_pnl: closed.gross_pnl,
            total_fees: closed.total_fees,
            net_pnl: closed.net_pnl,
            settled_at: now,
        };
        let snapshot = next.snapshot(now, None);

        trade_repo::close_trade_with_snapshot(&self.pool, &close, &snapshot).await?;
        *guard = next;

        tracing::info!(
            trade_id = %trade_id,
            exit_price = %exit_price,
            net_pnl = %closed.net_pnl,
            available = %guard.available(),
            "Virtual position closed"
        );

        Ok(closed)
    }

    pub async fn stats(&self) -> BankrollStats {
        self.ledger.lock().await.stats()
    }

    pub async fn total_capital(&self) -> Decimal {
        self.ledger.lock().await.total_capital()
    }

    pub async fn open_position_count(&self) -> usize {
        self.ledger.lock().await.open_position_count()
    }

    pub async fn entry_price(&self, trade_id: Uuid) -> Option<Decimal> {
        self.ledger
            .lock()
            .await
            .open_position(&trade_id)
            .map(|p| p.entry_price)
    }

    /// Labelled snapshot outside the trade flow (seed, equity, final).
    pub async fn write_snapshot(&self, label: &str) -> Result<(), BankrollError> {
        let guard = self.ledger.lock().await;
        let snapshot = guard.snapshot(Utc::now(), Some(label.to_string()));
        bankroll_repo::insert_snapshot(&self.pool, &snapshot).await?;
        Ok(())
    }

    /// Test-harness use only.
    pub async fn reset(&self) -> Result<(), BankrollError> {
        let mut guard = self.ledger.lock().await;
        let mut next = guard.clone();
        next.reset(Utc::now().date_naive());
        let snapshot = next.snapshot(Utc::now(), Some("reset".into()));
        bankroll_repo::insert_snapshot(&self.pool, &snapshot).await?;
        *guard = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
