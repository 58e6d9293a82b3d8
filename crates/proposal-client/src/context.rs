use chrono::{DateTime, Utc};
use decision_engine::ValidatorConfig;
use exchange_trait::{AccountBalance, PositionSnapshot};
use serde::{Deserialize, Serialize};

/// Account figures handed to the proposal source and stored with each cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSummary {
    pub total_equity: f64,
    pub available_balance: f64,
    pub unrealized_pnl: f64,
    /// Equity change since the instance started
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub margin_used: f64,
    pub margin_used_pct: f64,
    pub position_count: usize,
}

impl AccountSummary {
    pub fn from_venue(
        balance: &AccountBalance,
        positions: &[PositionSnapshot],
        initial_balance: f64,
    ) -> Self {
        let total_equity = balance.total_equity();
        let margin_used: f64 = positions.iter().map(PositionSnapshot::margin_used).sum();

        let total_pnl = total_equity - initial_balance;
        let total_pnl_pct = if initial_balance > 0.0 {
            total_pnl / initial_balance * 100.0
        } else {
            0.0
        };
        let margin_used_pct = if total_equity > 0.0 {
            margin_used / total_equity * 100.0
        } else {
            0.0
        };

        Self {
            total_equity,
            available_balance: balance.available_balance,
            unrealized_pnl: balance.unrealized_pnl,
            total_pnl,
            total_pnl_pct,
            margin_used,
            margin_used_pct,
            position_count: positions.len(),
        }
    }
}

/// A live position plus what the engine remembers about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionContext {
    pub position: PositionSnapshot,
    pub margin_used: f64,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub holding_minutes: Option<i64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub max_profit_pct: f64,
    pub max_loss_pct: f64,
    pub drawdown_from_peak_pct: f64,
    pub invalidation_condition: String,
    pub opening_reasoning: String,
}

impl PositionContext {
    /// Context for a position the engine has no memory of.
    pub fn bare(position: PositionSnapshot) -> Self {
        let pnl = position.unrealized_pnl_pct;
        Self {
            margin_used: position.margin_used(),
            position,
            first_seen_at: None,
            holding_minutes: None,
            stop_loss: None,
            take_profit: None,
            max_profit_pct: pnl,
            max_loss_pct: pnl,
            drawdown_from_peak_pct: 0.0,
            invalidation_condition: String::new(),
            opening_reasoning: String::new(),
        }
    }
}

/// Everything one proposal request needs.
#[derive(Debug, Clone)]
pub struct ProposalRequest {
    pub now: DateTime<Utc>,
    pub cycle_number: u64,
    pub account: AccountSummary,
    pub positions: Vec<PositionContext>,
    pub candidates: Vec<String>,
    /// Pre-formatted market data, one block per symbol
    pub market_context: String,
    pub limits: ValidatorConfig,
    pub scan_interval_minutes: u32,
    /// False for instances that only manage existing positions
    pub allow_new_positions: bool,
}

/// A successfully parsed reply.
#[derive(Debug, Clone, Default)]
pub struct ProposalBatch {
    pub system_prompt: String,
    pub user_prompt: String,
    pub rationale: String,
    pub intents: Vec<decision_engine::ProposedIntent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use exchange_trait::PositionSide;

    #[test]
    fn test_account_summary_math() {
        let balance = AccountBalance {
            wallet_balance: 10_000.0,
            unrealized_pnl: 500.0,
            available_balance: 8_000.0,
        };
        let positions = vec![PositionSnapshot {
            symbol: "BTCUSDT".into(),
            side: PositionSide::Long,
            quantity: 0.1,
            entry_price: 50_000.0,
            mark_price: 50_000.0,
            leverage: 0,
            unrealized_pnl: 500.0,
            unrealized_pnl_pct: 10.0,
            liquidation_price: 0.0,
            update_time: None,
        }];

        let summary = AccountSummary::from_venue(&balance, &positions, 10_000.0);
        assert_relative_eq!(summary.total_equity, 10_500.0);
        assert_relative_eq!(summary.total_pnl, 500.0);
        assert_relative_eq!(summary.total_pnl_pct, 5.0);
        // 0.1 * 50_000 / default leverage 10
        assert_relative_eq!(summary.margin_used, 500.0);
        assert_relative_eq!(summary.margin_used_pct, 500.0 / 10_500.0 * 100.0);
        assert_eq!(summary.position_count, 1);
    }
}
