#[cfg(test)]
mod risk_manager_tests {
    use std::collections::HashMap;

    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};
    use exchange_trait::{PositionKey, PositionSide, PositionSnapshot};

    use crate::circuit_breaker::{CircuitBreakerConfig, DailyLossGuard, LossCircuitBreaker};
    use crate::models::{
        ClosedPosition, ProtectionLevels, ProtectiveTrigger, TrackedPositionState,
    };
    use crate::position_book::PositionBook;
    use crate::profit_guard::{
        PartialTakeProfitConfig, PartialTargets, ProfitGuard, TrailingStopConfig,
    };

    fn position(
        symbol: &str,
        side: PositionSide,
        entry: f64,
        mark: f64,
        quantity: f64,
        pnl_pct: f64,
    ) -> PositionSnapshot {
        PositionSnapshot {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price: entry,
            mark_price: mark,
            leverage: 5,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: pnl_pct,
            liquidation_price: 0.0,
            update_time: None,
        }
    }

    fn trailing_only() -> ProfitGuard {
        ProfitGuard::new(
            TrailingStopConfig {
                enabled: true,
                activation_pct: 5.0,
                distance_pct: 3.0,
            },
            PartialTakeProfitConfig { enabled: false },
        )
    }

    fn partial_only() -> ProfitGuard {
        ProfitGuard::new(
            TrailingStopConfig {
                enabled: false,
                ..TrailingStopConfig::default()
            },
            PartialTakeProfitConfig { enabled: true },
        )
    }

    fn track_opened(book: &mut PositionBook, key: PositionKey, entry: f64, take_profit: f64) {
        book.insert(
            key,
            TrackedPositionState::opened(
                entry,
                ProtectionLevels {
                    stop_loss: None,
                    take_profit: Some(take_profit),
                },
                "invalidated",
                "opened",
                Utc::now(),
            ),
        );
    }

    /// One cycle: refresh the book then run the controller.
    fn tick(
        guard: &ProfitGuard,
        book: &mut PositionBook,
        positions: &[PositionSnapshot],
    ) -> Vec<crate::models::ProtectiveAction> {
        book.refresh(positions, &HashMap::new(), Utc::now());
        guard.evaluate(book, positions)
    }

    // -----------------------------------------------------------------------
    // Trailing stop
    // -----------------------------------------------------------------------

    #[test]
    fn trailing_stop_arms_once_and_triggers_below_activation() {
        let guard = trailing_only();
        let mut book = PositionBook::new();
        let key = PositionKey::new("BTCUSDT", PositionSide::Long);

        let path = [4.0, 6.0, 15.0, 3.0];
        let mut fired_at = None;
        for (i, pnl) in path.iter().enumerate() {
            let pos = position("BTCUSDT", PositionSide::Long, 100.0, 100.0, 1.0, *pnl);
            let actions = tick(&guard, &mut book, &[pos]);
            let armed = book.get(&key).unwrap().trailing_stop_activated();
            match i {
                0 => assert!(!armed, "4% is below activation"),
                _ => assert!(armed, "armed from the 6% tick onwards"),
            }
            if !actions.is_empty() {
                fired_at = Some(i);
                match &actions[0].trigger {
                    ProtectiveTrigger::TrailingStop {
                        peak_pct,
                        current_pct,
                        drawdown_pct,
                    } => {
                        assert_relative_eq!(*peak_pct, 15.0);
                        assert_relative_eq!(*current_pct, 3.0);
                        assert_relative_eq!(*drawdown_pct, 12.0);
                    }
                    other => panic!("unexpected trigger {other:?}"),
                }
                assert_eq!(actions[0].close_quantity, 0.0);
            }
        }
        assert_eq!(fired_at, Some(3));
    }

    #[test]
    fn trailing_stop_stays_armed_through_dips() {
        let guard = trailing_only();
        let mut book = PositionBook::new();
        let key = PositionKey::new("ETHUSDT", PositionSide::Short);

        // Arm at 5.5, dip to 4 (drawdown 1.5 < 3), recover to 5
        for pnl in [5.5, 4.0, 5.0] {
            let pos = position("ETHUSDT", PositionSide::Short, 3_000.0, 2_990.0, 1.0, pnl);
            assert!(tick(&guard, &mut book, &[pos]).is_empty());
        }
        assert!(book.get(&key).unwrap().trailing_stop_activated());

        let pos = position("ETHUSDT", PositionSide::Short, 3_000.0, 2_995.0, 1.0, 2.5);
        let actions = tick(&guard, &mut book, &[pos]);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn trailing_disabled_never_arms() {
        let guard = partial_only();
        let mut book = PositionBook::new();
        let pos = position("BTCUSDT", PositionSide::Long, 100.0, 100.0, 1.0, 50.0);
        tick(&guard, &mut book, &[pos]);
        assert!(!book
            .get(&PositionKey::new("BTCUSDT", PositionSide::Long))
            .unwrap()
            .trailing_stop_activated());
    }

    // -----------------------------------------------------------------------
    // Partial take-profit
    // -----------------------------------------------------------------------

    #[test]
    fn partial_targets_long() {
        let targets = PartialTargets::for_position(PositionSide::Long, 50_000.0, 55_000.0).unwrap();
        assert_relative_eq!(targets.target50, 52_500.0);
        assert_relative_eq!(targets.target100, 55_000.0);
    }

    #[test]
    fn partial_targets_short() {
        let targets = PartialTargets::for_position(PositionSide::Short, 3_000.0, 2_700.0).unwrap();
        assert_relative_eq!(targets.target50, 2_850.0);
        assert_relative_eq!(targets.target100, 2_700.0);
    }

    #[test]
    fn partial_targets_reject_wrong_side_take_profit() {
        assert!(PartialTargets::for_position(PositionSide::Long, 100.0, 95.0).is_none());
        assert!(PartialTargets::for_position(PositionSide::Short, 100.0, 105.0).is_none());
    }

    #[test]
    fn overshooting_both_targets_fires_each_once() {
        let guard = partial_only();
        let mut book = PositionBook::new();
        let key = PositionKey::new("BTCUSDT", PositionSide::Long);
        track_opened(&mut book, key.clone(), 50_000.0, 55_000.0);

        let pos = position("BTCUSDT", PositionSide::Long, 50_000.0, 56_000.0, 0.4, 60.0);
        let actions = tick(&guard, &mut book, &[pos]);
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            actions[0].trigger,
            ProtectiveTrigger::PartialTakeProfit50 { target } if target == 52_500.0
        ));
        assert_relative_eq!(actions[0].close_quantity, 0.2);
        assert!(matches!(
            actions[1].trigger,
            ProtectiveTrigger::PartialTakeProfit100 { target } if target == 55_000.0
        ));
        assert_eq!(actions[1].close_quantity, 0.0);

        for action in &actions {
            book.apply_protective_fill(action);
        }
        let state = book.get(&key).unwrap();
        assert!(state.partial_tp50_executed());
        assert!(state.partial_tp100_executed());

        // Venue has not reported the close yet: nothing fires again
        let pos = position("BTCUSDT", PositionSide::Long, 50_000.0, 57_000.0, 0.2, 70.0);
        assert!(tick(&guard, &mut book, &[pos]).is_empty());
    }

    #[test]
    fn short_partial_take_profit_fires_at_first_target() {
        let guard = partial_only();
        let mut book = PositionBook::new();
        let key = PositionKey::new("ETHUSDT", PositionSide::Short);
        track_opened(&mut book, key.clone(), 3_000.0, 2_700.0);

        let pos = position("ETHUSDT", PositionSide::Short, 3_000.0, 2_900.0, 2.0, 10.0);
        assert!(tick(&guard, &mut book, &[pos]).is_empty());

        let pos = position("ETHUSDT", PositionSide::Short, 3_000.0, 2_850.0, 2.0, 25.0);
        let actions = tick(&guard, &mut book, &[pos]);
        assert_eq!(actions.len(), 1);
        assert_relative_eq!(actions[0].close_quantity, 1.0);
        book.apply_protective_fill(&actions[0]);

        let pos = position("ETHUSDT", PositionSide::Short, 3_000.0, 2_700.0, 1.0, 50.0);
        let actions = tick(&guard, &mut book, &[pos]);
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0].trigger,
            ProtectiveTrigger::PartialTakeProfit100 { .. }
        ));
    }

    #[test]
    fn failed_partial_close_is_retried() {
        let guard = partial_only();
        let mut book = PositionBook::new();
        let key = PositionKey::new("SOLUSDT", PositionSide::Long);
        track_opened(&mut book, key, 100.0, 120.0);

        let pos = position("SOLUSDT", PositionSide::Long, 100.0, 111.0, 10.0, 11.0);
        assert_eq!(tick(&guard, &mut book, &[pos.clone()]).len(), 1);
        // Not applied: the venue rejected the close
        assert_eq!(tick(&guard, &mut book, &[pos]).len(), 1);
    }

    #[test]
    fn trailing_stop_supersedes_partial_take_profit() {
        let guard = ProfitGuard::default();
        let mut book = PositionBook::new();
        let key = PositionKey::new("BTCUSDT", PositionSide::Long);
        track_opened(&mut book, key, 100.0, 110.0);

        let peak = position("BTCUSDT", PositionSide::Long, 100.0, 106.0, 1.0, 20.0);
        let actions = tick(&guard, &mut book, &[peak]);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].trigger.label(), "partial_tp_50");
        for action in &actions {
            book.apply_protective_fill(action);
        }

        let retrace = position("BTCUSDT", PositionSide::Long, 100.0, 103.0, 0.5, 15.0);
        let actions = tick(&guard, &mut book, &[retrace]);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].trigger.label(), "trailing_stop");
    }

    // -----------------------------------------------------------------------
    // Loss circuit breaker
    // -----------------------------------------------------------------------

    fn closed_long(entry: f64, stop: Option<f64>, last_price: f64) -> ClosedPosition {
        ClosedPosition {
            key: PositionKey::new("BTCUSDT", PositionSide::Long),
            state: TrackedPositionState::opened(
                entry,
                ProtectionLevels {
                    stop_loss: stop,
                    take_profit: None,
                },
                "",
                "",
                Utc::now(),
            ),
            last_price,
        }
    }

    fn breaker() -> LossCircuitBreaker {
        LossCircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_base_minutes(45.0)
                .with_multiplier(2.67)
                .with_max_minutes(1_000.0),
        )
    }

    #[test]
    fn backoff_grows_exponentially() {
        let config = CircuitBreakerConfig::default()
            .with_base_minutes(45.0)
            .with_multiplier(2.67)
            .with_max_minutes(1_000.0);
        assert_relative_eq!(config.backoff_minutes(1), 45.0, epsilon = 1e-9);
        assert_relative_eq!(config.backoff_minutes(2), 120.15, epsilon = 1e-9);
        assert_relative_eq!(config.backoff_minutes(3), 320.8005, epsilon = 1e-9);

        let capped = config.with_max_minutes(300.0);
        assert_relative_eq!(capped.backoff_minutes(3), 300.0);
        assert_relative_eq!(capped.backoff_minutes(10), 300.0);
    }

    #[test]
    fn consecutive_stop_outs_extend_backoff() {
        let mut cb = breaker();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

        cb.detect_losses(&[], 10_000.0, t0);
        let mut equity = 10_000.0;
        let mut expected = [45.0, 120.15, 320.8005].iter();
        for i in 0..3 {
            equity -= 100.0;
            let now = t0 + Duration::minutes(i * 5 + 1);
            let events = cb.detect_losses(&[closed_long(100.0, Some(95.0), 94.0)], equity, now);
            assert_eq!(events.len(), 1);
            assert_relative_eq!(events[0].backoff_minutes, *expected.next().unwrap(), epsilon = 1e-9);
        }
        assert_eq!(cb.stop_loss_count(), 3);

        let status = cb.check(t0 + Duration::minutes(20));
        assert!(status.is_active());
    }

    #[test]
    fn vanished_position_with_rising_equity_is_not_a_loss() {
        let mut cb = breaker();
        let now = Utc::now();
        cb.detect_losses(&[], 10_000.0, now);

        // Price sits right at the stop, but equity went up
        let events = cb.detect_losses(&[closed_long(100.0, Some(95.0), 95.0)], 10_050.0, now);
        assert!(events.is_empty());
        assert_eq!(cb.stop_loss_count(), 0);
        assert!(!cb.check(now).is_active());
    }

    #[test]
    fn first_cycle_has_no_equity_baseline() {
        let mut cb = breaker();
        let events = cb.detect_losses(&[closed_long(100.0, Some(95.0), 90.0)], 9_000.0, Utc::now());
        assert!(events.is_empty());
        assert_eq!(cb.state().last_observed_equity, Some(9_000.0));
    }

    #[test]
    fn take_profit_close_is_not_a_loss_even_if_equity_fell() {
        let mut cb = breaker();
        let now = Utc::now();
        cb.detect_losses(&[], 10_000.0, now);
        let events = cb.detect_losses(&[closed_long(100.0, Some(95.0), 112.0)], 9_990.0, now);
        assert!(events.is_empty());
    }

    #[test]
    fn equity_baseline_updates_after_classification() {
        let mut cb = breaker();
        let now = Utc::now();
        cb.detect_losses(&[], 10_000.0, now);
        cb.detect_losses(&[], 9_000.0, now);
        // Compared against 9,000, not 10,000
        let events = cb.detect_losses(&[closed_long(100.0, Some(95.0), 94.0)], 9_500.0, now);
        assert!(events.is_empty());
    }

    #[test]
    fn counter_resets_after_quiet_window() {
        let mut cb = LossCircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_base_minutes(45.0)
                .with_reset_hours(2.0),
        );
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        cb.detect_losses(&[], 10_000.0, t0);
        cb.detect_losses(&[closed_long(100.0, None, 90.0)], 9_800.0, t0);
        assert_eq!(cb.stop_loss_count(), 1);
        assert!(cb.check(t0 + Duration::minutes(30)).is_active());
        assert!(!cb.check(t0 + Duration::minutes(50)).is_active());
        assert_eq!(cb.stop_loss_count(), 1);

        assert!(!cb.check(t0 + Duration::hours(2)).is_active());
        assert_eq!(cb.stop_loss_count(), 0);

        // Next stop-out starts from the base again
        let later = t0 + Duration::hours(3);
        let events = cb.detect_losses(&[closed_long(100.0, None, 90.0)], 9_600.0, later);
        assert_relative_eq!(events[0].backoff_minutes, 45.0);
    }

    #[test]
    fn disabled_breaker_never_blocks() {
        let mut cb = LossCircuitBreaker::new(CircuitBreakerConfig {
            enabled: false,
            ..CircuitBreakerConfig::default()
        });
        let now = Utc::now();
        cb.detect_losses(&[], 10_000.0, now);
        let events = cb.detect_losses(&[closed_long(100.0, Some(95.0), 90.0)], 9_000.0, now);
        assert!(events.is_empty());
        assert!(!cb.check(now).is_active());
    }

    // -----------------------------------------------------------------------
    // Daily loss guard
    // -----------------------------------------------------------------------

    #[test]
    fn daily_loss_pause_and_window_reset() {
        let mut guard = DailyLossGuard::new(5.0, 60);
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();

        assert_eq!(guard.observe(10_000.0, t0), 0.0);
        assert_relative_eq!(guard.observe(9_600.0, t0 + Duration::hours(1)), -400.0);
        assert!(guard.paused_until(t0 + Duration::hours(1)).is_none());

        guard.observe(9_400.0, t0 + Duration::hours(2));
        assert!(guard.paused_until(t0 + Duration::hours(2)).is_some());
        assert!(guard.paused_until(t0 + Duration::hours(4)).is_none());

        // New window baseline
        assert_eq!(guard.observe(9_400.0, t0 + Duration::hours(25)), 0.0);
    }

    #[test]
    fn daily_loss_guard_disabled_with_zero_limit() {
        let mut guard = DailyLossGuard::new(0.0, 60);
        let now = Utc::now();
        guard.observe(10_000.0, now);
        guard.observe(1_000.0, now);
        assert!(guard.paused_until(now).is_none());
    }
}
