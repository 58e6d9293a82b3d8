use exchange_trait::{PositionKey, PositionSide};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::validator::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
    IncreaseLong,
    IncreaseShort,
    DecreaseLong,
    DecreaseShort,
    UpdateLossProfit,
    Hold,
    Wait,
}

impl Action {
    pub const ALL: [Action; 11] = [
        Action::OpenLong,
        Action::OpenShort,
        Action::CloseLong,
        Action::CloseShort,
        Action::IncreaseLong,
        Action::IncreaseShort,
        Action::DecreaseLong,
        Action::DecreaseShort,
        Action::UpdateLossProfit,
        Action::Hold,
        Action::Wait,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::OpenLong => "open_long",
            Action::OpenShort => "open_short",
            Action::CloseLong => "close_long",
            Action::CloseShort => "close_short",
            Action::IncreaseLong => "increase_long",
            Action::IncreaseShort => "increase_short",
            Action::DecreaseLong => "decrease_long",
            Action::DecreaseShort => "decrease_short",
            Action::UpdateLossProfit => "update_loss_profit",
            Action::Hold => "hold",
            Action::Wait => "wait",
        }
    }

    /// Position side the action targets. `update_loss_profit` names only a
    /// symbol, so it has none.
    pub fn side(&self) -> Option<PositionSide> {
        match self {
            Action::OpenLong | Action::CloseLong | Action::IncreaseLong | Action::DecreaseLong => {
                Some(PositionSide::Long)
            }
            Action::OpenShort
            | Action::CloseShort
            | Action::IncreaseShort
            | Action::DecreaseShort => Some(PositionSide::Short),
            Action::UpdateLossProfit | Action::Hold | Action::Wait => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Action::OpenLong | Action::OpenShort)
    }

    pub fn is_increase(&self) -> bool {
        matches!(self, Action::IncreaseLong | Action::IncreaseShort)
    }

    pub fn is_decrease(&self) -> bool {
        matches!(self, Action::DecreaseLong | Action::DecreaseShort)
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Action::CloseLong | Action::CloseShort)
    }

    /// Actions that add exposure and therefore carry entry/stop/target levels.
    pub fn grows_exposure(&self) -> bool {
        self.is_open() || self.is_increase()
    }

    pub fn is_passive(&self) -> bool {
        matches!(self, Action::Hold | Action::Wait)
    }

    /// Execution priority, lowest first: shrink exposure before growing it.
    pub fn priority(&self) -> u8 {
        match self {
            Action::DecreaseLong | Action::DecreaseShort => 1,
            Action::CloseLong | Action::CloseShort => 2,
            Action::UpdateLossProfit => 3,
            Action::IncreaseLong | Action::IncreaseShort => 4,
            Action::OpenLong | Action::OpenShort => 5,
            Action::Hold | Action::Wait => 6,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == tag)
            .ok_or_else(|| ValidationError::UnknownAction {
                action: tag.to_string(),
            })
    }
}

/// A decision as it arrives from the proposal source. The action is still an
/// untrusted tag; [`crate::DecisionValidator`] turns it into a [`DecisionIntent`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposedIntent {
    pub symbol: String,
    pub action: String,
    pub leverage: u32,
    pub position_size_usd: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// 0-100
    pub confidence: f64,
    pub risk_usd: f64,
    pub reasoning: String,
    pub invalidation_condition: String,
}

/// A validated decision with a closed action type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionIntent {
    pub symbol: String,
    pub action: Action,
    pub leverage: u32,
    pub position_size_usd: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub confidence: f64,
    pub risk_usd: f64,
    pub reasoning: String,
    pub invalidation_condition: String,
}

impl DecisionIntent {
    pub fn from_proposed(proposed: &ProposedIntent, action: Action) -> Self {
        Self {
            symbol: proposed.symbol.trim().to_string(),
            action,
            leverage: proposed.leverage,
            position_size_usd: proposed.position_size_usd,
            entry_price: proposed.entry_price,
            stop_loss: proposed.stop_loss,
            take_profit: proposed.take_profit,
            confidence: proposed.confidence,
            risk_usd: proposed.risk_usd,
            reasoning: proposed.reasoning.clone(),
            invalidation_condition: proposed.invalidation_condition.clone(),
        }
    }

    pub fn side(&self) -> Option<PositionSide> {
        self.action.side()
    }

    pub fn key(&self) -> Option<PositionKey> {
        self.side()
            .map(|side| PositionKey::new(self.symbol.clone(), side))
    }
}

impl From<&DecisionIntent> for ProposedIntent {
    fn from(intent: &DecisionIntent) -> Self {
        Self {
            symbol: intent.symbol.clone(),
            action: intent.action.as_str().to_string(),
            leverage: intent.leverage,
            position_size_usd: intent.position_size_usd,
            entry_price: intent.entry_price,
            stop_loss: intent.stop_loss,
            take_profit: intent.take_profit,
            confidence: intent.confidence,
            risk_usd: intent.risk_usd,
            reasoning: intent.reasoning.clone(),
            invalidation_condition: intent.invalidation_condition.clone(),
        }
    }
}

impl fmt::Display for DecisionIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.symbol.is_empty() {
            write!(f, "{}", self.action)
        } else {
            write!(f, "{} {}", self.action, self.symbol)
        }
    }
}
