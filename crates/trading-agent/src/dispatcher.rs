use std::sync::Arc;

use chrono::{DateTime, Utc};
use decision_engine::{Action, DecisionIntent};
use exchange_trait::{truncate_quantity, ExchangeTrader, PositionKey, PositionSide, PositionSnapshot};
use risk_manager::{PositionBook, ProtectionLevels, TrackedPositionState};
use thiserror::Error;

use crate::config::InstanceMode;
use crate::types::Execution;

/// Why a validated decision could not be carried out. The position book is
/// left untouched whenever one of these is returned.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{key} is already open, refusing to stack a second position")]
    AntiStacking { key: PositionKey },

    #[error("no open position for {target}")]
    NoPosition { target: String },

    #[error(
        "price drift on {symbol}: proposal assumed {expected:.4}, market is {actual:.4} \
         ({drift_pct:.2}% > {tolerance_pct:.2}% tolerance)"
    )]
    PriceDrift {
        symbol: String,
        expected: f64,
        actual: f64,
        drift_pct: f64,
        tolerance_pct: f64,
    },

    #[error(
        "decrease of {requested} on {key} is not smaller than the position ({held}), use a close instead"
    )]
    DecreaseTooLarge {
        key: PositionKey,
        requested: f64,
        held: f64,
    },

    #[error("invalid protection for {key}: {detail}")]
    InvalidProtection { key: PositionKey, detail: String },

    #[error("${size_usd:.2} of {symbol} at {price:.4} rounds to a zero quantity")]
    QuantityTooSmall {
        symbol: String,
        size_usd: f64,
        price: f64,
    },

    #[error("{action} {symbol} not permitted: instance only manages existing positions")]
    OpenNotPermitted { symbol: String, action: Action },

    #[error("venue call failed: {0:#}")]
    Venue(#[from] anyhow::Error),
}

/// Side an `update_loss_profit` targets when both sides of a symbol are open:
/// a stop below the target protects a long.
pub fn implied_side(stop_loss: f64, take_profit: f64) -> PositionSide {
    if stop_loss < take_profit {
        PositionSide::Long
    } else {
        PositionSide::Short
    }
}

/// Turns validated intents into venue calls and keeps the position book in
/// step with what the venue accepted.
pub struct ExecutionDispatcher {
    trader: Arc<dyn ExchangeTrader>,
    mode: InstanceMode,
    drift_tolerance_pct: f64,
    /// Place a venue take-profit order alongside the stop. Off when the
    /// partial take-profit controller owns the exit.
    venue_take_profit: bool,
}

impl ExecutionDispatcher {
    pub fn new(
        trader: Arc<dyn ExchangeTrader>,
        mode: InstanceMode,
        drift_tolerance_pct: f64,
        partial_take_profit_enabled: bool,
    ) -> Self {
        Self {
            trader,
            mode,
            drift_tolerance_pct,
            venue_take_profit: !partial_take_profit_enabled,
        }
    }

    pub async fn dispatch(
        &self,
        intent: &DecisionIntent,
        book: &mut PositionBook,
        now: DateTime<Utc>,
    ) -> Result<Execution, ExecutionError> {
        let Some(side) = intent.side() else {
            return match intent.action {
                Action::UpdateLossProfit => self.update_protection(intent, book, now).await,
                _ => Ok(Execution::none()),
            };
        };
        let key = PositionKey::new(intent.symbol.clone(), side);

        match intent.action {
            Action::OpenLong | Action::OpenShort => self.open(intent, key, book, now).await,
            Action::IncreaseLong | Action::IncreaseShort => {
                self.increase(intent, key, book, now).await
            }
            Action::DecreaseLong | Action::DecreaseShort => {
                self.decrease(intent, key, book, now).await
            }
            Action::CloseLong | Action::CloseShort => self.close(key).await,
            Action::UpdateLossProfit | Action::Hold | Action::Wait => Ok(Execution::none()),
        }
    }

    async fn open(
        &self,
        intent: &DecisionIntent,
        key: PositionKey,
        book: &mut PositionBook,
        now: DateTime<Utc>,
    ) -> Result<Execution, ExecutionError> {
        if !self.mode.allows_new_positions() {
            return Err(ExecutionError::OpenNotPermitted {
                symbol: intent.symbol.clone(),
                action: intent.action,
            });
        }

        // The proposal may predate a fill from earlier in this batch or a
        // position opened elsewhere
        if self.find_position(&key).await?.is_some() {
            return Err(ExecutionError::AntiStacking { key });
        }

        let price = self.trader.get_market_price(&key.symbol).await?;
        self.check_drift(intent, price)?;
        let quantity = self.quantity_for(&key.symbol, intent.position_size_usd, price)?;

        let order = self
            .trader
            .open_position(key.side, &key.symbol, quantity, intent.leverage)
            .await?;
        let fill_price = order.average_price.filter(|p| *p > 0.0).unwrap_or(price);
        let filled = if order.filled_quantity > 0.0 {
            order.filled_quantity
        } else {
            quantity
        };

        tracing::info!(
            "Opened {} qty {} @ {:.4} ({}x, ${:.2}), stop {:.4}, target {:.4}",
            key,
            filled,
            fill_price,
            intent.leverage,
            intent.position_size_usd,
            intent.stop_loss,
            intent.take_profit
        );

        let levels = levels_of(intent);
        book.insert(
            key.clone(),
            TrackedPositionState::opened(
                fill_price,
                levels,
                intent.invalidation_condition.clone(),
                intent.reasoning.clone(),
                now,
            ),
        );

        let warnings = self.place_protection(&key, filled, levels).await;

        Ok(Execution {
            quantity: filled,
            price: Some(fill_price),
            order_id: Some(order.order_id),
            warnings,
        })
    }

    async fn increase(
        &self,
        intent: &DecisionIntent,
        key: PositionKey,
        book: &mut PositionBook,
        now: DateTime<Utc>,
    ) -> Result<Execution, ExecutionError> {
        let existing = self
            .find_position(&key)
            .await?
            .ok_or_else(|| ExecutionError::NoPosition {
                target: key.to_string(),
            })?;

        let price = self.trader.get_market_price(&key.symbol).await?;
        self.check_drift(intent, price)?;
        let quantity = self.quantity_for(&key.symbol, intent.position_size_usd, price)?;

        let order = self
            .trader
            .open_position(key.side, &key.symbol, quantity, intent.leverage)
            .await?;
        let fill_price = order.average_price.filter(|p| *p > 0.0).unwrap_or(price);
        let filled = if order.filled_quantity > 0.0 {
            order.filled_quantity
        } else {
            quantity
        };

        // Protection is re-placed on the venue's post-increase quantity
        let positions = match self.trader.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                tracing::warn!("Position re-read after increasing {} failed: {:#}", key, e);
                vec![existing.clone()]
            }
        };
        let total = positions
            .iter()
            .find(|p| p.key() == key)
            .map_or(existing.quantity + filled, |p| p.quantity);

        tracing::info!(
            "Increased {} by {} @ {:.4}, position now {}",
            key,
            filled,
            fill_price,
            total
        );

        let levels = levels_of(intent);
        match book.get_mut(&key) {
            Some(state) => state.replace_protection(levels, &intent.invalidation_condition),
            None => {
                let mut state = TrackedPositionState::observed(&existing, levels, now);
                state.invalidation_condition = intent.invalidation_condition.clone();
                book.insert(key.clone(), state);
            }
        }

        let warnings = self.replace_protection(&key, total, levels, &positions, book).await;

        Ok(Execution {
            quantity: filled,
            price: Some(fill_price),
            order_id: Some(order.order_id),
            warnings,
        })
    }

    async fn decrease(
        &self,
        intent: &DecisionIntent,
        key: PositionKey,
        book: &mut PositionBook,
        now: DateTime<Utc>,
    ) -> Result<Execution, ExecutionError> {
        let existing = self
            .find_position(&key)
            .await?
            .ok_or_else(|| ExecutionError::NoPosition {
                target: key.to_string(),
            })?;

        let price = self.trader.get_market_price(&key.symbol).await?;
        let quantity = self.quantity_for(&key.symbol, intent.position_size_usd, price)?;
        if quantity >= existing.quantity {
            return Err(ExecutionError::DecreaseTooLarge {
                key,
                requested: quantity,
                held: existing.quantity,
            });
        }

        let order = self
            .trader
            .close_position(key.side, &key.symbol, quantity)
            .await?;
        let filled = if order.filled_quantity > 0.0 {
            order.filled_quantity
        } else {
            quantity
        };

        if let Some(state) = book.get_mut(&key) {
            let before = state.stage();
            state.record_reduction(filled, existing.quantity, now);
            if state.stage() != before {
                tracing::info!(
                    "{} advanced to stage {} ({:.0}% remaining)",
                    key,
                    state.stage().number(),
                    state.remaining_quantity_fraction * 100.0
                );
            }
        }

        tracing::info!(
            "Decreased {} by {} of {} @ {:.4}",
            key,
            filled,
            existing.quantity,
            order.average_price.unwrap_or(price)
        );

        Ok(Execution {
            quantity: filled,
            price: Some(order.average_price.unwrap_or(price)),
            order_id: Some(order.order_id),
            warnings: Vec::new(),
        })
    }

    async fn close(&self, key: PositionKey) -> Result<Execution, ExecutionError> {
        let existing = self
            .find_position(&key)
            .await?
            .ok_or_else(|| ExecutionError::NoPosition {
                target: key.to_string(),
            })?;

        // Tracked state goes away on the next refresh, once the venue reports the key flat
        let order = self.trader.close_position(key.side, &key.symbol, 0.0).await?;
        let filled = if order.filled_quantity > 0.0 {
            order.filled_quantity
        } else {
            existing.quantity
        };

        tracing::info!("Closed {} qty {}", key, filled);

        Ok(Execution {
            quantity: filled,
            price: order.average_price.or(Some(existing.mark_price)),
            order_id: Some(order.order_id),
            warnings: Vec::new(),
        })
    }

    async fn update_protection(
        &self,
        intent: &DecisionIntent,
        book: &mut PositionBook,
        now: DateTime<Utc>,
    ) -> Result<Execution, ExecutionError> {
        let positions = self.trader.get_positions().await?;
        let on_symbol: Vec<&PositionSnapshot> = positions
            .iter()
            .filter(|p| p.symbol == intent.symbol)
            .collect();

        let position = match on_symbol.as_slice() {
            [] => None,
            [only] => Some(*only),
            both => {
                let side = implied_side(intent.stop_loss, intent.take_profit);
                both.iter().copied().find(|p| p.side == side)
            }
        }
        .cloned()
        .ok_or_else(|| ExecutionError::NoPosition {
            target: intent.symbol.clone(),
        })?;

        let key = position.key();
        let mark = if position.mark_price > 0.0 {
            position.mark_price
        } else {
            self.trader.get_market_price(&key.symbol).await?
        };

        let brackets = match key.side {
            PositionSide::Long => intent.stop_loss < mark && mark < intent.take_profit,
            PositionSide::Short => intent.take_profit < mark && mark < intent.stop_loss,
        };
        if !brackets {
            return Err(ExecutionError::InvalidProtection {
                detail: format!(
                    "stop {:.4} and target {:.4} do not bracket mark {:.4} for a {} position",
                    intent.stop_loss, intent.take_profit, mark, key.side
                ),
                key,
            });
        }

        let levels = levels_of(intent);
        match book.get_mut(&key) {
            Some(state) => state.replace_protection(levels, &intent.invalidation_condition),
            None => {
                let mut state = TrackedPositionState::observed(&position, levels, now);
                state.invalidation_condition = intent.invalidation_condition.clone();
                book.insert(key.clone(), state);
            }
        }

        let warnings = self
            .replace_protection(&key, position.quantity, levels, &positions, book)
            .await;

        tracing::info!(
            "Updated protection for {}: stop {:.4}, target {:.4} (mark {:.4})",
            key,
            intent.stop_loss,
            intent.take_profit,
            mark
        );

        Ok(Execution {
            quantity: position.quantity,
            price: Some(mark),
            order_id: None,
            warnings,
        })
    }

    async fn find_position(&self, key: &PositionKey) -> anyhow::Result<Option<PositionSnapshot>> {
        Ok(self
            .trader
            .get_positions()
            .await?
            .into_iter()
            .find(|p| p.key() == *key))
    }

    fn check_drift(&self, intent: &DecisionIntent, price: f64) -> Result<(), ExecutionError> {
        let drift_pct = (price - intent.entry_price).abs() / intent.entry_price * 100.0;
        if drift_pct > self.drift_tolerance_pct {
            return Err(ExecutionError::PriceDrift {
                symbol: intent.symbol.clone(),
                expected: intent.entry_price,
                actual: price,
                drift_pct,
                tolerance_pct: self.drift_tolerance_pct,
            });
        }
        Ok(())
    }

    fn quantity_for(&self, symbol: &str, size_usd: f64, price: f64) -> Result<f64, ExecutionError> {
        let quantity = if price > 0.0 {
            truncate_quantity(size_usd / price, self.trader.quantity_precision(symbol))
        } else {
            0.0
        };
        if quantity <= 0.0 {
            return Err(ExecutionError::QuantityTooSmall {
                symbol: symbol.to_string(),
                size_usd,
                price,
            });
        }
        Ok(quantity)
    }

    /// Place stop (and, when the venue owns the exit, target) orders.
    /// Failures are logged and returned as warnings; the position stays open.
    async fn place_protection(
        &self,
        key: &PositionKey,
        quantity: f64,
        levels: ProtectionLevels,
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(stop) = levels.stop_loss {
            if let Err(e) = self
                .trader
                .set_stop_loss(&key.symbol, key.side, quantity, stop)
                .await
            {
                tracing::error!("Stop-loss for {} at {:.4} not placed: {:#}", key, stop, e);
                warnings.push(format!("stop-loss at {:.4} not placed: {:#}", stop, e));
            }
        }

        if self.venue_take_profit {
            if let Some(target) = levels.take_profit {
                if let Err(e) = self
                    .trader
                    .set_take_profit(&key.symbol, key.side, quantity, target)
                    .await
                {
                    tracing::error!("Take-profit for {} at {:.4} not placed: {:#}", key, target, e);
                    warnings.push(format!("take-profit at {:.4} not placed: {:#}", target, e));
                }
            }
        }

        warnings
    }

    /// Cancel the symbol's resting orders and re-place protection for `key`.
    /// Cancelling is per symbol, so the opposite side's levels are restored
    /// from the book as well.
    async fn replace_protection(
        &self,
        key: &PositionKey,
        quantity: f64,
        levels: ProtectionLevels,
        positions: &[PositionSnapshot],
        book: &PositionBook,
    ) -> Vec<String> {
        if let Err(e) = self.trader.cancel_all_orders(&key.symbol).await {
            tracing::error!("Cancelling orders for {} failed: {:#}", key.symbol, e);
            return vec![format!(
                "old orders not cancelled, protection not re-placed: {:#}",
                e
            )];
        }

        let mut warnings = self.place_protection(key, quantity, levels).await;

        let opposite = PositionKey::new(key.symbol.clone(), key.side.opposite());
        let live = positions.iter().find(|p| p.key() == opposite);
        if let (Some(position), Some(state)) = (live, book.get(&opposite)) {
            let kept = ProtectionLevels {
                stop_loss: state.stop_loss_price,
                take_profit: state.take_profit_price,
            };
            warnings.extend(self.place_protection(&opposite, position.quantity, kept).await);
        }

        warnings
    }
}

fn levels_of(intent: &DecisionIntent) -> ProtectionLevels {
    ProtectionLevels {
        stop_loss: Some(intent.stop_loss),
        take_profit: Some(intent.take_profit),
    }
}
