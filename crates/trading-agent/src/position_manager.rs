use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use exchange_trait::{truncate_quantity, ExchangeTrader, PositionKey, PositionSnapshot};
use risk_manager::{PositionBook, ProfitGuard, ProtectiveAction, ProtectiveTrigger};

use crate::types::ProtectiveRecord;

/// Runs the trailing-stop and partial take-profit controllers over the book
/// and sends the resulting closes to the venue.
pub struct PositionManager {
    trader: Arc<dyn ExchangeTrader>,
    guard: ProfitGuard,
}

impl PositionManager {
    pub fn new(trader: Arc<dyn ExchangeTrader>, guard: ProfitGuard) -> Self {
        Self { trader, guard }
    }

    /// Evaluate every tracked position and execute what fired. One-shot flags
    /// are only set for closes the venue accepted, so a failed close is tried
    /// again next cycle.
    pub async fn check_positions(
        &self,
        book: &mut PositionBook,
        positions: &[PositionSnapshot],
        now: DateTime<Utc>,
    ) -> Vec<ProtectiveRecord> {
        let actions = self.guard.evaluate(book, positions);
        let mut records = Vec::with_capacity(actions.len());
        // Both partial targets can fire in one tick; the second sees what the first left
        let mut remaining: HashMap<PositionKey, f64> =
            positions.iter().map(|p| (p.key(), p.quantity)).collect();

        for action in actions {
            let prior_quantity = remaining.get(&action.key).copied().unwrap_or(0.0);
            let record = self.execute(book, &action, prior_quantity, now).await;
            if let Some(filled) = record.filled_quantity {
                remaining.insert(action.key.clone(), (prior_quantity - filled).max(0.0));
            }
            records.push(record);
        }

        records
    }

    async fn execute(
        &self,
        book: &mut PositionBook,
        action: &ProtectiveAction,
        prior_quantity: f64,
        now: DateTime<Utc>,
    ) -> ProtectiveRecord {
        let mut record = ProtectiveRecord {
            key: action.key.clone(),
            trigger: action.trigger.clone(),
            requested_quantity: action.close_quantity,
            mark_price: action.mark_price,
            success: false,
            filled_quantity: None,
            order_id: None,
            error: None,
        };

        // 0 means close everything, so a partial that truncates to nothing must not be sent
        let quantity = if action.close_quantity > 0.0 {
            let q = truncate_quantity(
                action.close_quantity,
                self.trader.quantity_precision(&action.key.symbol),
            );
            if q <= 0.0 {
                let message = format!(
                    "{} close of {} rounds to zero at venue precision",
                    action.trigger.label(),
                    action.close_quantity
                );
                tracing::warn!("Skipping protective close for {}: {}", action.key, message);
                record.error = Some(message);
                return record;
            }
            q
        } else {
            0.0
        };

        match self
            .trader
            .close_position(action.key.side, &action.key.symbol, quantity)
            .await
        {
            Ok(order) => {
                let filled = if order.filled_quantity > 0.0 {
                    order.filled_quantity
                } else if quantity > 0.0 {
                    quantity
                } else {
                    prior_quantity
                };

                book.apply_protective_fill(action);
                if matches!(action.trigger, ProtectiveTrigger::PartialTakeProfit50 { .. }) {
                    if let Some(state) = book.get_mut(&action.key) {
                        state.record_reduction(filled, prior_quantity, now);
                    }
                }

                tracing::info!(
                    "{} executed for {}: closed {} @ ~{:.4}",
                    action.trigger.label(),
                    action.key,
                    filled,
                    action.mark_price
                );
                record.success = true;
                record.filled_quantity = Some(filled);
                record.order_id = Some(order.order_id);
            }
            Err(e) => {
                tracing::error!(
                    "{} close for {} failed, will retry next cycle: {:#}",
                    action.trigger.label(),
                    action.key,
                    e
                );
                record.error = Some(format!("{:#}", e));
            }
        }

        record
    }
}
