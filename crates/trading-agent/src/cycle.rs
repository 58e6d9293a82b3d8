use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use decision_engine::{sequence, DecisionValidator, ProposedIntent};
use exchange_trait::{AccountBalance, ExchangeTrader, MarketReader, PositionKey, PositionSnapshot};
use market_data::{fetch_context, render_context};
use proposal_client::{AccountSummary, PositionContext, ProposalRequest, ProposalSource};
use risk_manager::{
    BreakerStatus, ClosedPosition, DailyLossGuard, LossCircuitBreaker, OrderClassifier,
    PositionBook, ProfitGuard, ProtectionLevels, StopProximityClassifier, TrackedPositionState,
    TriggerPriceClassifier,
};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::{AgentConfig, InstanceMode, InstanceSpec};
use crate::cycle_log::CycleLog;
use crate::dispatcher::ExecutionDispatcher;
use crate::metrics::AgentMetrics;
use crate::position_manager::PositionManager;
use crate::types::{CycleRecord, DecisionOutcome, DecisionRecord};

/// One independently running trader: its own venue, book, breaker, metrics
/// and cycle records. Nothing here is shared with other instances.
pub struct TradingInstance {
    id: String,
    mode: InstanceMode,
    trader: Arc<dyn ExchangeTrader>,
    market: Arc<dyn MarketReader>,
    source: Arc<dyn ProposalSource>,
    log: CycleLog,

    validator: DecisionValidator,
    dispatcher: ExecutionDispatcher,
    positions: PositionManager,
    breaker: LossCircuitBreaker,
    daily: DailyLossGuard,
    classifier: Box<dyn OrderClassifier>,
    book: PositionBook,
    metrics: AgentMetrics,

    watchlist: Vec<String>,
    scan_interval_minutes: u32,
    /// Equity at the first successful refresh, the baseline for total PnL
    initial_equity: Option<f64>,
    cycle_number: u64,
}

impl TradingInstance {
    pub fn new(
        spec: &InstanceSpec,
        config: &AgentConfig,
        trader: Arc<dyn ExchangeTrader>,
        market: Arc<dyn MarketReader>,
        source: Arc<dyn ProposalSource>,
        log: CycleLog,
    ) -> Self {
        let guard = ProfitGuard::new(config.trailing_stop_config(), config.partial_take_profit_config());
        let loss_classifier = StopProximityClassifier {
            tolerance_pct: config.stop_classification_tolerance_pct,
        };

        Self {
            id: spec.id.clone(),
            mode: spec.mode,
            dispatcher: ExecutionDispatcher::new(
                trader.clone(),
                spec.mode,
                config.price_drift_tolerance_pct,
                config.partial_take_profit_enabled,
            ),
            positions: PositionManager::new(trader.clone(), guard),
            trader,
            market,
            source,
            log,
            validator: DecisionValidator::new(config.validator_config()),
            breaker: LossCircuitBreaker::with_classifier(
                config.breaker_config(),
                Box::new(loss_classifier),
            ),
            daily: DailyLossGuard::new(config.daily_loss_limit_pct, config.daily_loss_pause_minutes),
            classifier: Box::new(TriggerPriceClassifier),
            book: PositionBook::new(),
            metrics: AgentMetrics::new(spec.id.clone(), config.metrics_log_interval_cycles),
            watchlist: config.watchlist.clone(),
            scan_interval_minutes: config.scan_interval_minutes,
            initial_equity: None,
            cycle_number: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> InstanceMode {
        self.mode
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn metrics(&self) -> &AgentMetrics {
        &self.metrics
    }

    pub fn breaker(&self) -> &LossCircuitBreaker {
        &self.breaker
    }

    /// Continue cycle numbering and counters from a previous run.
    pub async fn restore(&mut self) -> Result<()> {
        self.cycle_number = self.log.last_cycle_number(&self.id).await?;
        if !self.log.load_metrics(&self.id, &mut self.metrics).await? {
            tracing::info!(instance = %self.id, "No persisted metrics found, starting fresh");
        }
        Ok(())
    }

    /// Cycle on a fixed interval until `stop` flips to true. A running cycle is
    /// never interrupted; the flag is checked between cycles.
    pub async fn run(mut self, interval: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            instance = %self.id,
            mode = %self.mode,
            venue = self.trader.venue_name(),
            source = self.source.source_name(),
            "Trading instance started (every {}s)",
            interval.as_secs()
        );

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle(Utc::now()).await;
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(instance = %self.id, "Trading instance stopping");
        self.metrics.log_metrics();
        if let Err(e) = self.log.save_metrics(&self.id, &self.metrics).await {
            tracing::warn!(instance = %self.id, "Failed to save final metrics: {:#}", e);
        }
    }

    /// Run one full cycle and persist its record. Never fails: every problem
    /// ends up in the returned record.
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleRecord {
        let cycle_start = AgentMetrics::start_timer();
        self.cycle_number += 1;
        let mut record = CycleRecord::new(&self.id, self.mode.as_str(), self.cycle_number, now);

        self.execute_cycle(now, &mut record).await;

        self.metrics.finish_cycle(cycle_start, record.success);
        if let Err(e) = self.log.append(&record).await {
            tracing::error!(instance = %self.id, "Failed to persist cycle record: {:#}", e);
        }
        if let Err(e) = self.log.save_metrics(&self.id, &self.metrics).await {
            tracing::warn!(instance = %self.id, "Failed to save metrics: {:#}", e);
        }

        tracing::info!(
            instance = %self.id,
            cycle = record.cycle_number,
            success = record.success,
            positions = record.positions.len(),
            executed = record.count("executed"),
            rejected = record.count("rejected"),
            failed = record.count("failed"),
            protective = record.protective_actions.len(),
            skipped = record.skipped.is_some(),
            duration_ms = self.metrics.last_total_duration_ms,
            "Cycle complete"
        );

        record
    }

    async fn execute_cycle(&mut self, now: DateTime<Utc>, record: &mut CycleRecord) {
        // Lets the stop-loss counter reset after a quiet window before this
        // cycle's closes are classified
        self.breaker.check(now);

        // Refresh: without a live view no decision is safe to apply
        let refresh_start = AgentMetrics::start_timer();
        let (balance, positions) = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(instance = %self.id, "Position refresh failed: {:#}", e);
                record.fail(format!("position refresh failed: {:#}", e));
                return;
            }
        };
        let equity = balance.total_equity();
        let initial_equity = *self.initial_equity.get_or_insert(equity);

        let seeds = self.seed_levels(&positions).await;
        let outcome = self.book.refresh(&positions, &seeds, now);
        for key in &outcome.added {
            if let Some(state) = self.book.get(key) {
                record.log(format!(
                    "tracking {} (entry {:.4}, stop {}, target {})",
                    key,
                    state.entry_price,
                    fmt_level(state.stop_loss_price),
                    fmt_level(state.take_profit_price)
                ));
            }
        }

        // Loss detection
        let closed = self.closed_positions(outcome.removed).await;
        let events = self.breaker.detect_losses(&closed, equity, now);
        for event in &events {
            record.log(format!(
                "stop-out on {} at {:.4} (#{} in a row), trading paused {:.1} min",
                event.key, event.last_price, event.stop_loss_count, event.backoff_minutes
            ));
        }
        self.metrics.loss_events += events.len() as u64;
        record.loss_events = events;
        record.daily_pnl = Some(self.daily.observe(equity, now));
        self.metrics.record_refresh_duration(refresh_start);

        // Profit/loss controllers run even while trading is paused
        let protection_start = AgentMetrics::start_timer();
        let protective = self
            .positions
            .check_positions(&mut self.book, &positions, now)
            .await;
        let closes = protective.iter().filter(|r| r.success).count();
        let exited: Vec<PositionKey> = protective
            .iter()
            .filter(|r| r.success && r.trigger.is_full_close())
            .map(|r| r.key.clone())
            .collect();
        for r in &protective {
            match &r.error {
                None => record.log(format!(
                    "{} on {}: closed {}",
                    r.trigger.label(),
                    r.key,
                    r.filled_quantity.unwrap_or(r.requested_quantity)
                )),
                Some(e) => record.log(format!("{} on {} failed: {}", r.trigger.label(), r.key, e)),
            }
        }
        self.metrics.protective_closes += closes as u64;
        record.protective_actions = protective;

        let (balance, positions) = if closes > 0 {
            match self.snapshot().await {
                Ok(snapshot) => {
                    // A stop that fills in between stays tracked, so the next
                    // cycle still classifies it as a loss
                    let seeds = self.seed_levels(&snapshot.1).await;
                    let outcome = self.book.refresh_after_exits(&snapshot.1, &seeds, &exited, now);
                    for (key, _) in &outcome.removed {
                        record.log(format!("{} fully closed by protective exit", key));
                    }
                    snapshot
                }
                Err(e) => {
                    tracing::error!(
                        instance = %self.id,
                        "Refresh after protective closes failed: {:#}", e
                    );
                    record.fail(format!("refresh after protective closes failed: {:#}", e));
                    return;
                }
            }
        } else {
            (balance, positions)
        };
        self.metrics.record_protection_duration(protection_start);

        let account = AccountSummary::from_venue(&balance, &positions, initial_equity);
        record.account = Some(account.clone());
        record.positions = positions.clone();

        // Gates
        let status = self.breaker.check(now);
        record.breaker = status.clone();
        record.breaker_state = Some(self.breaker.state());
        if let BreakerStatus::Active {
            until,
            remaining_minutes,
            stop_loss_count,
        } = status
        {
            self.metrics.breaker_skips += 1;
            tracing::warn!(
                instance = %self.id,
                "Loss circuit breaker active until {} ({:.1} min left, {} stop-outs), skipping proposals",
                until.format("%H:%M:%S"),
                remaining_minutes,
                stop_loss_count
            );
            record.skip(format!(
                "loss circuit breaker active until {} ({:.1} min left, {} consecutive stop-outs)",
                until.to_rfc3339(),
                remaining_minutes,
                stop_loss_count
            ));
            return;
        }

        if let Some(until) = self.daily.paused_until(now) {
            self.metrics.pause_skips += 1;
            record.paused_until = Some(until);
            record.skip(format!("daily loss limit reached, paused until {}", until.to_rfc3339()));
            return;
        }

        if !self.mode.allows_new_positions() && positions.is_empty() {
            record.skip("no positions to manage");
            return;
        }

        // Market context
        let candidates = self.candidates(&positions);
        let snapshots =
            fetch_context(self.market.as_ref(), &candidates, self.scan_interval_minutes).await;
        let market_context = render_context(self.market.as_ref(), &snapshots);
        record.candidates = candidates.clone();

        let request = ProposalRequest {
            now,
            cycle_number: self.cycle_number,
            account,
            positions: self.position_context(&positions, now),
            candidates,
            market_context,
            limits: self.validator.config().clone(),
            scan_interval_minutes: self.scan_interval_minutes,
            allow_new_positions: self.mode.allows_new_positions(),
        };

        // Solicit
        let solicit_start = AgentMetrics::start_timer();
        let result = self.source.get_proposals(&request).await;
        self.metrics.record_solicit_duration(solicit_start);
        let batch = match result {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(instance = %self.id, "Proposal request failed: {}", e);
                record.rationale = e.rationale().map(str::to_string);
                record.fail(format!("proposal request failed: {}", e));
                return;
            }
        };
        self.metrics.proposals_received += batch.intents.len() as u64;
        record.prompt = Some(format!("{}\n\n{}", batch.system_prompt, batch.user_prompt));
        record.rationale = Some(batch.rationale);
        record.proposed = batch.intents.clone();

        // Validate, sequence, dispatch
        let dispatch_start = AgentMetrics::start_timer();
        let (accepted, rejected) = self
            .validator
            .validate_batch(&batch.intents, balance.total_equity());

        for (proposed, err) in rejected {
            tracing::warn!(
                instance = %self.id,
                "Rejected {} {}: {}",
                proposed.action,
                proposed.symbol,
                err
            );
            record.log(format!("rejected {} {}: {}", proposed.action, proposed.symbol, err));
            self.metrics.decisions_rejected += 1;
            record.decisions.push(DecisionRecord {
                symbol: proposed.symbol.clone(),
                action: proposed.action.clone(),
                proposed,
                outcome: DecisionOutcome::Rejected {
                    reason: err.to_string(),
                },
            });
        }

        for intent in sequence(accepted) {
            let outcome = match self.dispatcher.dispatch(&intent, &mut self.book, now).await {
                Ok(_) if intent.action.is_passive() => DecisionOutcome::Accepted,
                Ok(execution) => {
                    self.metrics.executions_ok += 1;
                    record.log(format!(
                        "executed {}: qty {} @ {}",
                        intent,
                        execution.quantity,
                        fmt_level(execution.price)
                    ));
                    for warning in &execution.warnings {
                        record.log(format!("{}: {}", intent, warning));
                    }
                    DecisionOutcome::Executed(execution)
                }
                Err(e) => {
                    self.metrics.executions_failed += 1;
                    tracing::error!(instance = %self.id, "{} failed: {}", intent, e);
                    record.log(format!("failed {}: {}", intent, e));
                    DecisionOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            record.decisions.push(DecisionRecord {
                symbol: intent.symbol.clone(),
                action: intent.action.as_str().to_string(),
                proposed: ProposedIntent::from(&intent),
                outcome,
            });
        }
        self.metrics.record_dispatch_duration(dispatch_start);

        record.success = true;
    }

    async fn snapshot(&self) -> Result<(AccountBalance, Vec<PositionSnapshot>)> {
        // Positions first: a venue may settle fills while reporting them
        let positions = self.trader.get_positions().await?;
        let balance = self.trader.get_balance().await?;
        Ok((balance, positions))
    }

    /// Stop/target levels for keys seen for the first time, recovered from
    /// their symbol's resting orders. Best effort.
    async fn seed_levels(&self, positions: &[PositionSnapshot]) -> HashMap<PositionKey, ProtectionLevels> {
        let untracked = self.book.untracked_keys(positions);
        let mut symbols: Vec<&str> = untracked.iter().map(|k| k.symbol.as_str()).collect();
        symbols.sort_unstable();
        symbols.dedup();

        let mut seeds = HashMap::new();
        for symbol in symbols {
            let orders = match self.trader.get_open_orders(symbol).await {
                Ok(orders) => orders,
                Err(e) => {
                    tracing::debug!("Open orders for {} unavailable: {:#}", symbol, e);
                    continue;
                }
            };
            for position in positions
                .iter()
                .filter(|p| p.symbol == symbol && untracked.contains(&p.key()))
            {
                seeds.insert(position.key(), self.classifier.classify(position, &orders));
            }
        }
        seeds
    }

    async fn closed_positions(
        &self,
        removed: Vec<(PositionKey, TrackedPositionState)>,
    ) -> Vec<ClosedPosition> {
        let mut closed = Vec::with_capacity(removed.len());
        for (key, state) in removed {
            let last_price = match self.trader.get_market_price(&key.symbol).await {
                Ok(price) if price > 0.0 => price,
                _ => state.last_mark_price,
            };
            closed.push(ClosedPosition {
                key,
                state,
                last_price,
            });
        }
        closed
    }

    /// Watchlist plus held symbols; a manage-only instance looks at held symbols only.
    fn candidates(&self, positions: &[PositionSnapshot]) -> Vec<String> {
        let mut symbols: Vec<String> = if self.mode.allows_new_positions() {
            self.watchlist.clone()
        } else {
            Vec::new()
        };
        for position in positions {
            if !symbols.contains(&position.symbol) {
                symbols.push(position.symbol.clone());
            }
        }
        symbols
    }

    fn position_context(&self, positions: &[PositionSnapshot], now: DateTime<Utc>) -> Vec<PositionContext> {
        positions
            .iter()
            .map(|p| match self.book.get(&p.key()) {
                Some(state) => PositionContext {
                    margin_used: p.margin_used(),
                    first_seen_at: Some(state.first_seen_at),
                    holding_minutes: Some((now - state.first_seen_at).num_minutes()),
                    stop_loss: state.stop_loss_price,
                    take_profit: state.take_profit_price,
                    max_profit_pct: state.max_profit_pct,
                    max_loss_pct: state.max_loss_pct,
                    drawdown_from_peak_pct: state.drawdown_from_peak(p.unrealized_pnl_pct),
                    invalidation_condition: state.invalidation_condition.clone(),
                    opening_reasoning: state.opening_reasoning.clone(),
                    position: p.clone(),
                },
                None => PositionContext::bare(p.clone()),
            })
            .collect()
    }
}

fn fmt_level(level: Option<f64>) -> String {
    level.map_or_else(|| "-".to_string(), |v| format!("{:.4}", v))
}
