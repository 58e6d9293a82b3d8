use exchange_trait::PositionSide;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::{Action, DecisionIntent, ProposedIntent};

/// Slack on the risk:reward comparison so an exact 2.0 is not lost to rounding.
const RATIO_EPSILON: f64 = 1e-9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unknown action '{action}'")]
    UnknownAction { action: String },

    #[error("{action} requires a symbol")]
    MissingSymbol { action: Action },

    #[error("{symbol}: leverage {leverage}x outside allowed range 1-{max}x for {class}")]
    LeverageOutOfRange {
        symbol: String,
        leverage: u32,
        max: u32,
        class: AssetClass,
    },

    #[error("{symbol}: position size must be > 0 (got {size:.2})")]
    NonPositiveSize { symbol: String, size: f64 },

    #[error(
        "{symbol}: position size {size:.2} USD exceeds {max:.2} USD ({multiple}x equity of {equity:.2} for {class})"
    )]
    NotionalTooLarge {
        symbol: String,
        size: f64,
        max: f64,
        multiple: f64,
        equity: f64,
        class: AssetClass,
    },

    #[error("{symbol}: {field} must be > 0 (got {value})")]
    NonPositivePrice {
        symbol: String,
        field: &'static str,
        value: f64,
    },

    #[error("{symbol}: invalidation condition must not be empty")]
    MissingInvalidationCondition { symbol: String },

    #[error("{symbol}: {side} requires {comparison}")]
    DirectionMismatch {
        symbol: String,
        side: PositionSide,
        comparison: String,
    },

    #[error(
        "{symbol}: risk:reward {ratio:.2}:1 below minimum {min:.1}:1 [risk {risk_pct:.2}% reward {reward_pct:.2}%] entry {entry:.4} stop {stop:.4} target {target:.4}"
    )]
    RiskRewardTooLow {
        symbol: String,
        ratio: f64,
        min: f64,
        risk_pct: f64,
        reward_pct: f64,
        entry: f64,
        stop: f64,
        target: f64,
    },

    #[error("{symbol}: {action} requires a reasoning")]
    MissingReasoning { symbol: String, action: Action },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    /// BTC and ETH perpetuals
    Major,
    Altcoin,
}

impl AssetClass {
    pub fn of(symbol: &str) -> Self {
        let upper = symbol.trim().to_ascii_uppercase();
        let base = ["USDT", "USDC", "USD", "-PERP"]
            .iter()
            .find_map(|quote| upper.strip_suffix(quote))
            .unwrap_or(&upper);
        match base {
            "BTC" | "ETH" => AssetClass::Major,
            _ => AssetClass::Altcoin,
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetClass::Major => f.write_str("BTC/ETH"),
            AssetClass::Altcoin => f.write_str("altcoins"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub btc_eth_max_leverage: u32,
    pub altcoin_max_leverage: u32,
    pub btc_eth_max_notional_multiple: f64,
    pub altcoin_max_notional_multiple: f64,
    pub min_risk_reward: f64,
    /// Allowed overshoot of the notional ceiling, in percent.
    pub notional_tolerance_pct: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            btc_eth_max_leverage: 5,
            altcoin_max_leverage: 5,
            btc_eth_max_notional_multiple: 10.0,
            altcoin_max_notional_multiple: 5.0,
            min_risk_reward: 2.0,
            notional_tolerance_pct: 1.0,
        }
    }
}

impl ValidatorConfig {
    pub fn max_leverage(&self, class: AssetClass) -> u32 {
        match class {
            AssetClass::Major => self.btc_eth_max_leverage,
            AssetClass::Altcoin => self.altcoin_max_leverage,
        }
    }

    pub fn max_notional_multiple(&self, class: AssetClass) -> f64 {
        match class {
            AssetClass::Major => self.btc_eth_max_notional_multiple,
            AssetClass::Altcoin => self.altcoin_max_notional_multiple,
        }
    }
}

/// Stateless rule checker for proposed decisions.
///
/// The verdict depends only on the intent, the equity passed in and the
/// configuration, so re-validating the same input always gives the same answer.
#[derive(Debug, Clone, Default)]
pub struct DecisionValidator {
    config: ValidatorConfig,
}

impl DecisionValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn validate(
        &self,
        proposed: &ProposedIntent,
        equity: f64,
    ) -> Result<DecisionIntent, ValidationError> {
        let action: Action = proposed.action.parse()?;
        let intent = DecisionIntent::from_proposed(proposed, action);

        if !action.is_passive() && intent.symbol.is_empty() {
            return Err(ValidationError::MissingSymbol { action });
        }

        match action {
            Action::OpenLong | Action::OpenShort | Action::IncreaseLong | Action::IncreaseShort => {
                self.check_exposure(&intent, equity)?;
                self.check_direction(&intent)?;
                self.check_risk_reward(&intent)?;
            }
            Action::DecreaseLong | Action::DecreaseShort => {
                if intent.position_size_usd <= 0.0 {
                    return Err(ValidationError::NonPositiveSize {
                        symbol: intent.symbol.clone(),
                        size: intent.position_size_usd,
                    });
                }
                require_reasoning(&intent)?;
            }
            Action::UpdateLossProfit => {
                require_positive(&intent, "stop_loss", intent.stop_loss)?;
                require_positive(&intent, "take_profit", intent.take_profit)?;
                require_reasoning(&intent)?;
            }
            Action::CloseLong | Action::CloseShort | Action::Hold | Action::Wait => {}
        }

        Ok(intent)
    }

    /// Validate a batch, splitting accepted intents from rejections.
    #[allow(clippy::type_complexity)]
    pub fn validate_batch(
        &self,
        proposals: &[ProposedIntent],
        equity: f64,
    ) -> (Vec<DecisionIntent>, Vec<(ProposedIntent, ValidationError)>) {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for proposed in proposals {
            match self.validate(proposed, equity) {
                Ok(intent) => accepted.push(intent),
                Err(e) => rejected.push((proposed.clone(), e)),
            }
        }
        (accepted, rejected)
    }

    fn check_exposure(&self, intent: &DecisionIntent, equity: f64) -> Result<(), ValidationError> {
        let class = AssetClass::of(&intent.symbol);
        let max_leverage = self.config.max_leverage(class);
        if intent.leverage < 1 || intent.leverage > max_leverage {
            return Err(ValidationError::LeverageOutOfRange {
                symbol: intent.symbol.clone(),
                leverage: intent.leverage,
                max: max_leverage,
                class,
            });
        }

        if intent.position_size_usd <= 0.0 {
            return Err(ValidationError::NonPositiveSize {
                symbol: intent.symbol.clone(),
                size: intent.position_size_usd,
            });
        }

        let multiple = self.config.max_notional_multiple(class);
        let max_notional = equity * multiple;
        let tolerance = max_notional * self.config.notional_tolerance_pct / 100.0;
        if intent.position_size_usd > max_notional + tolerance {
            return Err(ValidationError::NotionalTooLarge {
                symbol: intent.symbol.clone(),
                size: intent.position_size_usd,
                max: max_notional,
                multiple,
                equity,
                class,
            });
        }

        require_positive(intent, "entry_price", intent.entry_price)?;
        require_positive(intent, "stop_loss", intent.stop_loss)?;
        require_positive(intent, "take_profit", intent.take_profit)?;

        if intent.invalidation_condition.trim().is_empty() {
            return Err(ValidationError::MissingInvalidationCondition {
                symbol: intent.symbol.clone(),
            });
        }
        Ok(())
    }

    fn check_direction(&self, intent: &DecisionIntent) -> Result<(), ValidationError> {
        let Some(side) = intent.side() else {
            return Ok(());
        };
        let (entry, stop, target) = (intent.entry_price, intent.stop_loss, intent.take_profit);

        let violation = match side {
            PositionSide::Long if stop >= entry => Some(format!(
                "stop_loss {:.4} < entry_price {:.4}",
                stop, entry
            )),
            PositionSide::Long if target <= entry => Some(format!(
                "take_profit {:.4} > entry_price {:.4}",
                target, entry
            )),
            PositionSide::Short if stop <= entry => Some(format!(
                "stop_loss {:.4} > entry_price {:.4}",
                stop, entry
            )),
            PositionSide::Short if target >= entry => Some(format!(
                "take_profit {:.4} < entry_price {:.4}",
                target, entry
            )),
            _ => None,
        };

        match violation {
            Some(comparison) => Err(ValidationError::DirectionMismatch {
                symbol: intent.symbol.clone(),
                side,
                comparison,
            }),
            None => Ok(()),
        }
    }

    fn check_risk_reward(&self, intent: &DecisionIntent) -> Result<(), ValidationError> {
        let (entry, stop, target) = (intent.entry_price, intent.stop_loss, intent.take_profit);
        let risk_pct = (entry - stop).abs() / entry * 100.0;
        let reward_pct = (target - entry).abs() / entry * 100.0;
        let ratio = if risk_pct > 0.0 {
            reward_pct / risk_pct
        } else {
            0.0
        };

        if ratio + RATIO_EPSILON < self.config.min_risk_reward {
            return Err(ValidationError::RiskRewardTooLow {
                symbol: intent.symbol.clone(),
                ratio,
                min: self.config.min_risk_reward,
                risk_pct,
                reward_pct,
                entry,
                stop,
                target,
            });
        }
        Ok(())
    }
}

fn require_positive(
    intent: &DecisionIntent,
    field: &'static str,
    value: f64,
) -> Result<(), ValidationError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::NonPositivePrice {
            symbol: intent.symbol.clone(),
            field,
            value,
        })
    }
}

fn require_reasoning(intent: &DecisionIntent) -> Result<(), ValidationError> {
    if intent.reasoning.trim().is_empty() {
        Err(ValidationError::MissingReasoning {
            symbol: intent.symbol.clone(),
            action: intent.action,
        })
    } else {
        Ok(())
    }
}
