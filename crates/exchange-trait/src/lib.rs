use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Leverage assumed when the venue does not report one for a position.
pub const DEFAULT_LEVERAGE: u32 = 10;

// ---------------------------------------------------------------------------
// Unified venue types (venue-agnostic)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a directional holding: at most one long and one short per symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub symbol: String,
    pub side: PositionSide,
}

impl PositionKey {
    pub fn new(symbol: impl Into<String>, side: PositionSide) -> Self {
        Self {
            symbol: symbol.into(),
            side,
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.symbol, self.side)
    }
}

/// Live position as reported by the venue. Read-only input, refreshed every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
    /// Leveraged PnL as a percentage of margin.
    pub unrealized_pnl_pct: f64,
    pub liquidation_price: f64,
    pub update_time: Option<DateTime<Utc>>,
}

impl PositionSnapshot {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.symbol.clone(), self.side)
    }

    pub fn effective_leverage(&self) -> u32 {
        if self.leverage == 0 {
            DEFAULT_LEVERAGE
        } else {
            self.leverage
        }
    }

    pub fn notional(&self) -> f64 {
        self.quantity.abs() * self.mark_price
    }

    pub fn margin_used(&self) -> f64 {
        self.notional() / self.effective_leverage() as f64
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountBalance {
    pub wallet_balance: f64,
    pub unrealized_pnl: f64,
    pub available_balance: f64,
}

impl AccountBalance {
    /// Equity = wallet balance + unrealized PnL.
    pub fn total_equity(&self) -> f64 {
        self.wallet_balance + self.unrealized_pnl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    StopMarket,
    TakeProfitMarket,
    Other,
}

/// Resting order on the venue, used to re-hydrate stop/target levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    /// Position side the order protects, when the venue reports it.
    pub position_side: Option<PositionSide>,
    pub kind: OrderKind,
    pub trigger_price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: String,
    pub symbol: String,
    pub filled_quantity: f64,
    pub average_price: Option<f64>,
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeSeries {
    pub label: String,
    /// Oldest first.
    pub closes: Vec<f64>,
}

impl TimeframeSeries {
    pub fn change_pct(&self) -> Option<f64> {
        let first = *self.closes.first()?;
        let last = *self.closes.last()?;
        if first <= 0.0 {
            return None;
        }
        Some((last - first) / first * 100.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub current_price: f64,
    pub open_interest: Option<f64>,
    pub funding_rate: Option<f64>,
    pub timeframes: Vec<TimeframeSeries>,
    pub fetched_at: DateTime<Utc>,
}

impl fmt::Display for MarketSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} price={:.4}", self.symbol, self.current_price)?;
        match self.open_interest {
            Some(oi) => writeln!(f, "  open interest: {:.2}", oi)?,
            None => writeln!(f, "  open interest: n/a")?,
        }
        match self.funding_rate {
            Some(rate) => writeln!(f, "  funding rate: {:.6}", rate)?,
            None => writeln!(f, "  funding rate: n/a")?,
        }
        for tf in &self.timeframes {
            let recent: Vec<String> = tf
                .closes
                .iter()
                .rev()
                .take(10)
                .rev()
                .map(|c| format!("{:.4}", c))
                .collect();
            match tf.change_pct() {
                Some(change) => writeln!(
                    f,
                    "  {} change {:+.2}% closes [{}]",
                    tf.label,
                    change,
                    recent.join(", ")
                )?,
                None => writeln!(f, "  {} closes [{}]", tf.label, recent.join(", "))?,
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// PnL% of margin for a leveraged position.
pub fn leveraged_pnl_pct(side: PositionSide, entry: f64, mark: f64, leverage: u32) -> f64 {
    if entry <= 0.0 {
        return 0.0;
    }
    let leverage = f64::from(if leverage == 0 { DEFAULT_LEVERAGE } else { leverage });
    let move_pct = match side {
        PositionSide::Long => (mark - entry) / entry,
        PositionSide::Short => (entry - mark) / entry,
    };
    move_pct * leverage * 100.0
}

/// Truncate toward zero to the venue's quantity precision.
pub fn truncate_quantity(quantity: f64, decimals: u32) -> f64 {
    Decimal::from_f64(quantity)
        .map(|d| d.round_dp_with_strategy(decimals, RoundingStrategy::ToZero))
        .and_then(|d| d.to_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Venue traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExchangeTrader: Send + Sync {
    /// Get all open positions
    async fn get_positions(&self) -> Result<Vec<PositionSnapshot>>;

    /// Get wallet balance, unrealized PnL and available margin
    async fn get_balance(&self) -> Result<AccountBalance>;

    async fn get_market_price(&self, symbol: &str) -> Result<f64>;

    async fn open_long(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderRef>;

    async fn open_short(&self, symbol: &str, quantity: f64, leverage: u32) -> Result<OrderRef>;

    /// Close a long position. A quantity of 0 closes everything.
    async fn close_long(&self, symbol: &str, quantity: f64) -> Result<OrderRef>;

    /// Close a short position. A quantity of 0 closes everything.
    async fn close_short(&self, symbol: &str, quantity: f64) -> Result<OrderRef>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<()>;

    async fn set_take_profit(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        price: f64,
    ) -> Result<()>;

    /// Cancel every resting order for a symbol
    async fn cancel_all_orders(&self, symbol: &str) -> Result<()>;

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>>;

    /// Decimal places accepted for order quantities on this symbol
    fn quantity_precision(&self, _symbol: &str) -> u32 {
        3
    }

    /// Whether this is a paper/simulated venue
    fn is_paper(&self) -> bool;

    /// Venue name for logging
    fn venue_name(&self) -> &str;

    async fn open_position(
        &self,
        side: PositionSide,
        symbol: &str,
        quantity: f64,
        leverage: u32,
    ) -> Result<OrderRef> {
        match side {
            PositionSide::Long => self.open_long(symbol, quantity, leverage).await,
            PositionSide::Short => self.open_short(symbol, quantity, leverage).await,
        }
    }

    async fn close_position(
        &self,
        side: PositionSide,
        symbol: &str,
        quantity: f64,
    ) -> Result<OrderRef> {
        match side {
            PositionSide::Long => self.close_long(symbol, quantity).await,
            PositionSide::Short => self.close_short(symbol, quantity).await,
        }
    }
}

#[async_trait]
pub trait MarketReader: Send + Sync {
    async fn get(&self, symbol: &str, interval_minutes: u32) -> Result<MarketSnapshot>;

    /// Human-readable block consumed by the proposal source.
    fn format(&self, snapshot: &MarketSnapshot) -> String {
        snapshot.to_string()
    }
}
