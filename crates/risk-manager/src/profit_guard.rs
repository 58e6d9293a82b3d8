use exchange_trait::{PositionSide, PositionSnapshot};
use serde::{Deserialize, Serialize};

use crate::models::{ProtectiveAction, ProtectiveTrigger};
use crate::position_book::PositionBook;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    pub enabled: bool,
    /// PnL% at which the trailing stop arms
    pub activation_pct: f64,
    /// Retracement from peak PnL%, in percentage points, that closes the position
    pub distance_pct: f64,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_pct: 5.0,
            distance_pct: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialTakeProfitConfig {
    pub enabled: bool,
}

impl Default for PartialTakeProfitConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Price milestones derived from a position's original take-profit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartialTargets {
    pub target50: f64,
    pub target100: f64,
}

impl PartialTargets {
    /// None when the take-profit does not lie on the profitable side of entry.
    pub fn for_position(side: PositionSide, entry: f64, take_profit: f64) -> Option<Self> {
        let price_move = match side {
            PositionSide::Long => take_profit - entry,
            PositionSide::Short => entry - take_profit,
        };
        if entry <= 0.0 || take_profit <= 0.0 || price_move <= 0.0 {
            return None;
        }
        let target50 = match side {
            PositionSide::Long => entry + 0.5 * price_move,
            PositionSide::Short => entry - 0.5 * price_move,
        };
        Some(Self {
            target50,
            target100: take_profit,
        })
    }

    fn reached(side: PositionSide, mark: f64, target: f64) -> bool {
        match side {
            PositionSide::Long => mark >= target,
            PositionSide::Short => mark <= target,
        }
    }
}

/// Automatic profit/loss controller: trailing stop plus two-stage partial
/// take-profit, evaluated every cycle against live positions.
///
/// `evaluate` arms trailing stops and plans closes. One-shot take-profit flags
/// are only set through [`PositionBook::apply_protective_fill`] once the venue
/// accepts the close, so a failed close is retried next cycle.
#[derive(Debug, Clone, Default)]
pub struct ProfitGuard {
    trailing: TrailingStopConfig,
    partial: PartialTakeProfitConfig,
}

impl ProfitGuard {
    pub fn new(trailing: TrailingStopConfig, partial: PartialTakeProfitConfig) -> Self {
        Self { trailing, partial }
    }

    pub fn partial_take_profit_enabled(&self) -> bool {
        self.partial.enabled
    }

    pub fn evaluate(
        &self,
        book: &mut PositionBook,
        positions: &[PositionSnapshot],
    ) -> Vec<ProtectiveAction> {
        let mut actions = Vec::new();

        for pos in positions {
            let key = pos.key();
            let Some(state) = book.get_mut(&key) else {
                continue;
            };
            let pnl = pos.unrealized_pnl_pct;

            if self.trailing.enabled {
                if !state.trailing_stop_activated() && pnl >= self.trailing.activation_pct {
                    state.activate_trailing_stop();
                    tracing::info!(
                        "Trailing stop armed for {}: PnL {:.2}% >= {:.2}%",
                        key,
                        pnl,
                        self.trailing.activation_pct
                    );
                }

                if state.trailing_stop_activated() {
                    let peak = state.max_profit_pct.max(pnl);
                    let drawdown = peak - pnl;
                    if drawdown >= self.trailing.distance_pct {
                        tracing::info!(
                            "Trailing stop hit for {}: PnL {:.2}% (peak {:.2}%), drawdown {:.2}% >= {:.2}%",
                            key,
                            pnl,
                            peak,
                            drawdown,
                            self.trailing.distance_pct
                        );
                        actions.push(ProtectiveAction {
                            key,
                            trigger: ProtectiveTrigger::TrailingStop {
                                peak_pct: peak,
                                current_pct: pnl,
                                drawdown_pct: drawdown,
                            },
                            close_quantity: 0.0,
                            mark_price: pos.mark_price,
                        });
                        // Full close supersedes any partial exit
                        continue;
                    }
                }
            }

            if !self.partial.enabled {
                continue;
            }
            let Some(take_profit) = state.take_profit_price else {
                continue;
            };
            let Some(targets) = PartialTargets::for_position(pos.side, state.entry_price, take_profit)
            else {
                continue;
            };

            if !state.partial_tp50_executed()
                && PartialTargets::reached(pos.side, pos.mark_price, targets.target50)
            {
                tracing::info!(
                    "Partial take-profit 50% for {}: mark {:.4} reached {:.4}",
                    key,
                    pos.mark_price,
                    targets.target50
                );
                actions.push(ProtectiveAction {
                    key: key.clone(),
                    trigger: ProtectiveTrigger::PartialTakeProfit50 {
                        target: targets.target50,
                    },
                    close_quantity: pos.quantity.abs() * 0.5,
                    mark_price: pos.mark_price,
                });
            }

            if !state.partial_tp100_executed()
                && PartialTargets::reached(pos.side, pos.mark_price, targets.target100)
            {
                tracing::info!(
                    "Partial take-profit 100% for {}: mark {:.4} reached {:.4}",
                    key,
                    pos.mark_price,
                    targets.target100
                );
                actions.push(ProtectiveAction {
                    key,
                    trigger: ProtectiveTrigger::PartialTakeProfit100 {
                        target: targets.target100,
                    },
                    close_quantity: 0.0,
                    mark_price: pos.mark_price,
                });
            }
        }

        actions
    }
}
