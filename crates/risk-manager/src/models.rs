use chrono::{DateTime, Utc};
use exchange_trait::{PositionKey, PositionSnapshot};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// No partial exit taken yet
    Initial,
    /// First partial exit taken
    PartialTaken,
}

impl Stage {
    pub fn number(&self) -> u8 {
        match self {
            Stage::Initial => 1,
            Stage::PartialTaken => 2,
        }
    }
}

/// Stop/target levels known for a position, either from a decision or
/// recovered from resting venue orders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectionLevels {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// Per-position metrics that survive across cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPositionState {
    /// Best PnL% seen while open (never retreats)
    pub max_profit_pct: f64,
    /// Worst PnL% seen while open (never retreats)
    pub max_loss_pct: f64,
    pub entry_price: f64,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub invalidation_condition: String,
    pub opening_reasoning: String,
    stage: Stage,
    /// Remaining quantity relative to the opening quantity, in (0, 1]
    pub remaining_quantity_fraction: f64,
    partial_tp50_executed: bool,
    partial_tp100_executed: bool,
    trailing_stop_activated: bool,
    pub first_seen_at: DateTime<Utc>,
    pub partial_taken_at: Option<DateTime<Utc>>,
    /// Last observed mark price and PnL%, kept for loss classification after
    /// the position disappears
    pub last_mark_price: f64,
    pub last_pnl_pct: f64,
}

impl TrackedPositionState {
    /// State for a position first seen on the venue (opened elsewhere or
    /// before a restart).
    pub fn observed(snapshot: &PositionSnapshot, levels: ProtectionLevels, now: DateTime<Utc>) -> Self {
        Self {
            max_profit_pct: snapshot.unrealized_pnl_pct,
            max_loss_pct: snapshot.unrealized_pnl_pct,
            entry_price: snapshot.entry_price,
            stop_loss_price: levels.stop_loss,
            take_profit_price: levels.take_profit,
            invalidation_condition: String::new(),
            opening_reasoning: String::new(),
            stage: Stage::Initial,
            remaining_quantity_fraction: 1.0,
            partial_tp50_executed: false,
            partial_tp100_executed: false,
            trailing_stop_activated: false,
            first_seen_at: snapshot.update_time.unwrap_or(now),
            partial_taken_at: None,
            last_mark_price: snapshot.mark_price,
            last_pnl_pct: snapshot.unrealized_pnl_pct,
        }
    }

    /// State for a position this engine just opened.
    pub fn opened(
        entry_price: f64,
        levels: ProtectionLevels,
        invalidation_condition: impl Into<String>,
        opening_reasoning: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            max_profit_pct: 0.0,
            max_loss_pct: 0.0,
            entry_price,
            stop_loss_price: levels.stop_loss,
            take_profit_price: levels.take_profit,
            invalidation_condition: invalidation_condition.into(),
            opening_reasoning: opening_reasoning.into(),
            stage: Stage::Initial,
            remaining_quantity_fraction: 1.0,
            partial_tp50_executed: false,
            partial_tp100_executed: false,
            trailing_stop_activated: false,
            first_seen_at: now,
            partial_taken_at: None,
            last_mark_price: entry_price,
            last_pnl_pct: 0.0,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn partial_tp50_executed(&self) -> bool {
        self.partial_tp50_executed
    }

    pub fn partial_tp100_executed(&self) -> bool {
        self.partial_tp100_executed
    }

    pub fn trailing_stop_activated(&self) -> bool {
        self.trailing_stop_activated
    }

    /// Extend the PnL extremes with a new observation.
    pub fn observe(&mut self, pnl_pct: f64, mark_price: f64) {
        if pnl_pct > self.max_profit_pct {
            self.max_profit_pct = pnl_pct;
        }
        if pnl_pct < self.max_loss_pct {
            self.max_loss_pct = pnl_pct;
        }
        self.last_pnl_pct = pnl_pct;
        self.last_mark_price = mark_price;
    }

    pub fn drawdown_from_peak(&self, pnl_pct: f64) -> f64 {
        self.max_profit_pct.max(pnl_pct) - pnl_pct
    }

    /// Arm the trailing stop. Returns true only on the first activation.
    pub fn activate_trailing_stop(&mut self) -> bool {
        if self.trailing_stop_activated {
            return false;
        }
        self.trailing_stop_activated = true;
        true
    }

    pub fn mark_partial_tp50(&mut self) {
        self.partial_tp50_executed = true;
    }

    pub fn mark_partial_tp100(&mut self) {
        self.partial_tp100_executed = true;
    }

    /// Account for a partial close of `closed_quantity` out of `prior_quantity`.
    /// Advances to stage 2 when roughly half the position has been taken off.
    pub fn record_reduction(&mut self, closed_quantity: f64, prior_quantity: f64, now: DateTime<Utc>) {
        if prior_quantity <= 0.0 {
            return;
        }
        let kept = ((prior_quantity - closed_quantity) / prior_quantity).clamp(0.0, 1.0);
        self.remaining_quantity_fraction *= kept;
        self.partial_taken_at = Some(now);

        if self.stage == Stage::Initial
            && (0.4..=0.6).contains(&self.remaining_quantity_fraction)
        {
            self.stage = Stage::PartialTaken;
        }
    }

    /// Replace stop/target/invalidation with a newer decision's values.
    pub fn replace_protection(&mut self, levels: ProtectionLevels, invalidation_condition: &str) {
        self.stop_loss_price = levels.stop_loss;
        self.take_profit_price = levels.take_profit;
        if !invalidation_condition.trim().is_empty() {
            self.invalidation_condition = invalidation_condition.to_string();
        }
    }
}

/// What fired a protective close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtectiveTrigger {
    TrailingStop {
        peak_pct: f64,
        current_pct: f64,
        drawdown_pct: f64,
    },
    PartialTakeProfit50 {
        target: f64,
    },
    PartialTakeProfit100 {
        target: f64,
    },
}

impl ProtectiveTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            ProtectiveTrigger::TrailingStop { .. } => "trailing_stop",
            ProtectiveTrigger::PartialTakeProfit50 { .. } => "partial_tp_50",
            ProtectiveTrigger::PartialTakeProfit100 { .. } => "partial_tp_100",
        }
    }

    /// Whether the close takes the whole remaining position.
    pub fn is_full_close(&self) -> bool {
        !matches!(self, ProtectiveTrigger::PartialTakeProfit50 { .. })
    }
}

/// A close the profit/loss controller wants executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveAction {
    pub key: PositionKey,
    pub trigger: ProtectiveTrigger,
    /// Quantity to close; 0 closes the whole position
    pub close_quantity: f64,
    pub mark_price: f64,
}

/// A tracked position that vanished from the live snapshot.
#[derive(Debug, Clone)]
pub struct ClosedPosition {
    pub key: PositionKey,
    pub state: TrackedPositionState,
    /// Best available price after the close
    pub last_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossEvent {
    pub key: PositionKey,
    pub last_price: f64,
    pub stop_loss_price: Option<f64>,
    pub stop_loss_count: u32,
    pub backoff_minutes: f64,
    pub backoff_until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BreakerStatus {
    Clear,
    Active {
        until: DateTime<Utc>,
        remaining_minutes: f64,
        stop_loss_count: u32,
    },
}

impl BreakerStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, BreakerStatus::Active { .. })
    }
}
