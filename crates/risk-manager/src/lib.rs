pub mod circuit_breaker;
pub mod models;
pub mod policy;
pub mod position_book;
pub mod profit_guard;
#[cfg(test)]
mod tests;

pub use circuit_breaker::{BreakerState, CircuitBreakerConfig, DailyLossGuard, LossCircuitBreaker};
pub use models::*;
pub use policy::{LossClassifier, OrderClassifier, StopProximityClassifier, TriggerPriceClassifier};
pub use position_book::{PositionBook, RefreshOutcome};
pub use profit_guard::{PartialTakeProfitConfig, PartialTargets, ProfitGuard, TrailingStopConfig};
