//! Loss circuit breaker with exponential backoff.
//!
//! A tracked position that disappears while account equity fell, and whose
//! last price sat on the losing side of its stop, counts as a stop-out. Each
//! consecutive stop-out lengthens the pause on new trading decisions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{BreakerStatus, ClosedPosition, LossEvent};
use crate::policy::{LossClassifier, StopProximityClassifier};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub base_minutes: f64,
    pub multiplier: f64,
    pub max_minutes: f64,
    /// Hours without a stop-out after which the counter resets
    pub reset_hours: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_minutes: 45.0,
            multiplier: 2.67,
            max_minutes: 720.0,
            reset_hours: 24.0,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_base_minutes(mut self, minutes: f64) -> Self {
        self.base_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_max_minutes(mut self, minutes: f64) -> Self {
        self.max_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_reset_hours(mut self, hours: f64) -> Self {
        self.reset_hours = hours;
        self
    }

    /// Backoff for the n-th consecutive stop-out (1-based), capped at `max_minutes`.
    pub fn backoff_minutes(&self, stop_loss_count: u32) -> f64 {
        if stop_loss_count == 0 {
            return 0.0;
        }
        let exponent = i32::try_from(stop_loss_count - 1).unwrap_or(i32::MAX);
        (self.base_minutes * self.multiplier.powi(exponent)).min(self.max_minutes)
    }
}

/// Snapshot of breaker counters, persisted with each cycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerState {
    pub stop_loss_count: u32,
    pub last_stop_loss_time: Option<DateTime<Utc>>,
    pub backoff_until: Option<DateTime<Utc>>,
    pub last_observed_equity: Option<f64>,
}

pub struct LossCircuitBreaker {
    config: CircuitBreakerConfig,
    classifier: Box<dyn LossClassifier>,
    stop_loss_count: u32,
    last_stop_loss_time: Option<DateTime<Utc>>,
    backoff_until: Option<DateTime<Utc>>,
    last_observed_equity: Option<f64>,
}

impl LossCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_classifier(config, Box::new(StopProximityClassifier::default()))
    }

    pub fn with_classifier(config: CircuitBreakerConfig, classifier: Box<dyn LossClassifier>) -> Self {
        Self {
            config,
            classifier,
            stop_loss_count: 0,
            last_stop_loss_time: None,
            backoff_until: None,
            last_observed_equity: None,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn stop_loss_count(&self) -> u32 {
        self.stop_loss_count
    }

    pub fn state(&self) -> BreakerState {
        BreakerState {
            stop_loss_count: self.stop_loss_count,
            last_stop_loss_time: self.last_stop_loss_time,
            backoff_until: self.backoff_until,
            last_observed_equity: self.last_observed_equity,
        }
    }

    /// Start-of-cycle check. Applies the reset window, then reports whether
    /// new decisions are blocked.
    pub fn check(&mut self, now: DateTime<Utc>) -> BreakerStatus {
        if !self.config.enabled {
            return BreakerStatus::Clear;
        }

        if self.stop_loss_count > 0 {
            if let Some(last) = self.last_stop_loss_time {
                let hours_since = (now - last).num_seconds() as f64 / 3600.0;
                if hours_since >= self.config.reset_hours {
                    tracing::info!(
                        "Circuit breaker: {:.1}h since last stop-out, resetting count {} -> 0",
                        hours_since,
                        self.stop_loss_count
                    );
                    self.stop_loss_count = 0;
                }
            }
        }

        match self.backoff_until {
            Some(until) if now < until => BreakerStatus::Active {
                until,
                remaining_minutes: (until - now).num_seconds() as f64 / 60.0,
                stop_loss_count: self.stop_loss_count,
            },
            _ => BreakerStatus::Clear,
        }
    }

    /// Classify vanished positions and extend the backoff for each stop-out.
    /// `equity` becomes the baseline for the next cycle once classification is done.
    pub fn detect_losses(
        &mut self,
        closed: &[ClosedPosition],
        equity: f64,
        now: DateTime<Utc>,
    ) -> Vec<LossEvent> {
        let mut events = Vec::new();

        let equity_decreased = self
            .last_observed_equity
            .is_some_and(|last| last > 0.0 && equity < last);

        if self.config.enabled && equity_decreased {
            for position in closed {
                if !self
                    .classifier
                    .is_loss(position.key.side, &position.state, position.last_price)
                {
                    tracing::debug!(
                        "{} closed at {:.4}, not classified as a stop-out",
                        position.key,
                        position.last_price
                    );
                    continue;
                }

                self.stop_loss_count += 1;
                self.last_stop_loss_time = Some(now);
                let backoff_minutes = self.config.backoff_minutes(self.stop_loss_count);
                let backoff_until = now + Duration::milliseconds((backoff_minutes * 60_000.0) as i64);
                self.backoff_until = Some(backoff_until);

                tracing::warn!(
                    "Stop-out detected on {} (last {:.4}, stop {:?}); count {} -> pausing {:.1} min until {}",
                    position.key,
                    position.last_price,
                    position.state.stop_loss_price,
                    self.stop_loss_count,
                    backoff_minutes,
                    backoff_until.format("%Y-%m-%d %H:%M:%S")
                );

                events.push(LossEvent {
                    key: position.key.clone(),
                    last_price: position.last_price,
                    stop_loss_price: position.state.stop_loss_price,
                    stop_loss_count: self.stop_loss_count,
                    backoff_minutes,
                    backoff_until,
                });
            }
        }

        self.last_observed_equity = Some(equity);
        events
    }
}

/// Pauses new decisions when the rolling 24h loss exceeds a limit.
#[derive(Debug, Clone)]
pub struct DailyLossGuard {
    limit_pct: f64,
    pause: Duration,
    window_start_equity: Option<f64>,
    window_started_at: Option<DateTime<Utc>>,
    paused_until: Option<DateTime<Utc>>,
}

impl DailyLossGuard {
    /// A `limit_pct` of 0 disables the pause; daily PnL is still tracked.
    pub fn new(limit_pct: f64, pause_minutes: i64) -> Self {
        Self {
            limit_pct,
            pause: Duration::minutes(pause_minutes),
            window_start_equity: None,
            window_started_at: None,
            paused_until: None,
        }
    }

    /// Feed the current equity. Returns the daily PnL.
    pub fn observe(&mut self, equity: f64, now: DateTime<Utc>) -> f64 {
        let expired = self
            .window_started_at
            .is_none_or(|started| now - started > Duration::hours(24));
        if expired {
            if self.window_started_at.is_some() {
                tracing::info!("Daily PnL window reset");
            }
            self.window_start_equity = Some(equity);
            self.window_started_at = Some(now);
        }

        let start = self.window_start_equity.unwrap_or(equity);
        let daily_pnl = equity - start;

        if self.limit_pct > 0.0 && start > 0.0 {
            let daily_pct = daily_pnl / start * 100.0;
            if daily_pct <= -self.limit_pct && self.paused_until(now).is_none() {
                let until = now + self.pause;
                tracing::warn!(
                    "Daily loss {:.2}% breached limit {:.2}%, pausing new decisions until {}",
                    daily_pct,
                    self.limit_pct,
                    until.format("%H:%M:%S")
                );
                self.paused_until = Some(until);
            }
        }

        daily_pnl
    }

    pub fn paused_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.paused_until.filter(|until| now < *until)
    }
}
