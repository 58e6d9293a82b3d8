//! Heuristic classification policies.
//!
//! Both decisions are approximations: a resting order's role is inferred from
//! its trigger price, and a vanished position is judged a stop-out from how
//! close its last price sat to the stop. They are traits so callers can swap
//! in venue-specific rules.

use exchange_trait::{OpenOrder, OrderKind, PositionSide, PositionSnapshot};

use crate::models::{ProtectionLevels, TrackedPositionState};

pub trait OrderClassifier: Send + Sync {
    /// Recover stop/target levels for a position from its symbol's open orders.
    fn classify(&self, position: &PositionSnapshot, orders: &[OpenOrder]) -> ProtectionLevels;
}

/// Uses the venue's order kind when reported, otherwise the trigger price
/// relative to mark: below mark protects a long (stop), above mark is its
/// target, mirrored for shorts.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerPriceClassifier;

impl OrderClassifier for TriggerPriceClassifier {
    fn classify(&self, position: &PositionSnapshot, orders: &[OpenOrder]) -> ProtectionLevels {
        let mut levels = ProtectionLevels::default();

        for order in orders {
            if order.symbol != position.symbol || order.trigger_price <= 0.0 {
                continue;
            }
            if order.position_side.is_some_and(|side| side != position.side) {
                continue;
            }

            let is_stop = match order.kind {
                OrderKind::StopMarket => true,
                OrderKind::TakeProfitMarket => false,
                OrderKind::Other => match position.side {
                    PositionSide::Long => order.trigger_price < position.mark_price,
                    PositionSide::Short => order.trigger_price > position.mark_price,
                },
            };

            if is_stop {
                levels.stop_loss.get_or_insert(order.trigger_price);
            } else {
                levels.take_profit.get_or_insert(order.trigger_price);
            }
        }

        levels
    }
}

pub trait LossClassifier: Send + Sync {
    /// Whether a vanished position's last price puts it on the losing side.
    /// The equity condition is checked separately by the circuit breaker.
    fn is_loss(&self, side: PositionSide, state: &TrackedPositionState, last_price: f64) -> bool;
}

/// Loss if the last price is at or beyond the stop (within `tolerance_pct`),
/// or, with no recorded stop, on the losing side of entry.
#[derive(Debug, Clone, Copy)]
pub struct StopProximityClassifier {
    pub tolerance_pct: f64,
}

impl Default for StopProximityClassifier {
    fn default() -> Self {
        Self { tolerance_pct: 5.0 }
    }
}

impl LossClassifier for StopProximityClassifier {
    fn is_loss(&self, side: PositionSide, state: &TrackedPositionState, last_price: f64) -> bool {
        let tolerance = self.tolerance_pct / 100.0;

        if let Some(stop) = state.stop_loss_price.filter(|s| *s > 0.0) {
            return match side {
                PositionSide::Long => last_price <= stop * (1.0 + tolerance),
                PositionSide::Short => last_price >= stop * (1.0 - tolerance),
            };
        }

        if state.entry_price > 0.0 {
            return match side {
                PositionSide::Long => last_price < state.entry_price,
                PositionSide::Short => last_price > state.entry_price,
            };
        }

        // Nothing to compare against
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn position(side: PositionSide, mark: f64) -> PositionSnapshot {
        PositionSnapshot {
            symbol: "BTCUSDT".to_string(),
            side,
            quantity: 0.1,
            entry_price: 50_000.0,
            mark_price: mark,
            leverage: 10,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            liquidation_price: 0.0,
            update_time: None,
        }
    }

    fn order(kind: OrderKind, trigger: f64, side: Option<PositionSide>) -> OpenOrder {
        OpenOrder {
            order_id: format!("{trigger}"),
            symbol: "BTCUSDT".to_string(),
            position_side: side,
            kind,
            trigger_price: trigger,
            quantity: 0.1,
        }
    }

    fn tracked(entry: f64, stop: Option<f64>) -> TrackedPositionState {
        TrackedPositionState::opened(
            entry,
            ProtectionLevels {
                stop_loss: stop,
                take_profit: None,
            },
            "",
            "",
            Utc::now(),
        )
    }

    #[test]
    fn test_trigger_price_relative_to_mark() {
        let long = position(PositionSide::Long, 50_500.0);
        let levels = TriggerPriceClassifier.classify(
            &long,
            &[
                order(OrderKind::Other, 48_000.0, None),
                order(OrderKind::Other, 55_000.0, None),
            ],
        );
        assert_eq!(levels.stop_loss, Some(48_000.0));
        assert_eq!(levels.take_profit, Some(55_000.0));

        let short = position(PositionSide::Short, 50_500.0);
        let levels = TriggerPriceClassifier.classify(
            &short,
            &[
                order(OrderKind::Other, 48_000.0, None),
                order(OrderKind::Other, 55_000.0, None),
            ],
        );
        assert_eq!(levels.stop_loss, Some(55_000.0));
        assert_eq!(levels.take_profit, Some(48_000.0));
    }

    #[test]
    fn test_order_kind_wins_and_other_side_ignored() {
        let long = position(PositionSide::Long, 50_500.0);
        let levels = TriggerPriceClassifier.classify(
            &long,
            &[
                order(OrderKind::StopMarket, 52_000.0, Some(PositionSide::Long)),
                order(OrderKind::StopMarket, 45_000.0, Some(PositionSide::Short)),
            ],
        );
        assert_eq!(levels.stop_loss, Some(52_000.0));
        assert_eq!(levels.take_profit, None);
    }

    #[test]
    fn test_stop_proximity_with_tolerance() {
        let classifier = StopProximityClassifier::default();
        let state = tracked(100.0, Some(95.0));
        // 95 * 1.05 = 99.75
        assert!(classifier.is_loss(PositionSide::Long, &state, 99.5));
        assert!(!classifier.is_loss(PositionSide::Long, &state, 104.0));

        let state = tracked(100.0, Some(105.0));
        // 105 * 0.95 = 99.75
        assert!(classifier.is_loss(PositionSide::Short, &state, 100.0));
        assert!(!classifier.is_loss(PositionSide::Short, &state, 96.0));
    }

    #[test]
    fn test_entry_fallback_without_stop() {
        let classifier = StopProximityClassifier { tolerance_pct: 0.0 };
        let state = tracked(100.0, None);
        assert!(classifier.is_loss(PositionSide::Long, &state, 99.0));
        assert!(!classifier.is_loss(PositionSide::Long, &state, 101.0));
        assert!(classifier.is_loss(PositionSide::Short, &state, 101.0));

        let unknown = tracked(0.0, None);
        assert!(classifier.is_loss(PositionSide::Short, &unknown, 1.0));
    }
}
