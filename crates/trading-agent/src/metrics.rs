use std::time::Instant;

/// Per-instance telemetry: aggregate counters plus last-cycle phase timings.
pub struct AgentMetrics {
    instance_id: String,

    pub cycles_run: u64,
    pub cycles_failed: u64,
    pub proposals_received: u64,
    pub decisions_rejected: u64,
    pub executions_ok: u64,
    pub executions_failed: u64,
    pub protective_closes: u64,
    pub breaker_skips: u64,
    pub pause_skips: u64,
    pub loss_events: u64,

    // Per-cycle timing (last cycle)
    pub last_refresh_duration_ms: u64,
    pub last_protection_duration_ms: u64,
    pub last_solicit_duration_ms: u64,
    pub last_dispatch_duration_ms: u64,
    pub last_total_duration_ms: u64,

    log_interval_cycles: u64,
}

impl AgentMetrics {
    pub fn new(instance_id: impl Into<String>, log_interval_cycles: u64) -> Self {
        Self {
            instance_id: instance_id.into(),
            cycles_run: 0,
            cycles_failed: 0,
            proposals_received: 0,
            decisions_rejected: 0,
            executions_ok: 0,
            executions_failed: 0,
            protective_closes: 0,
            breaker_skips: 0,
            pause_skips: 0,
            loss_events: 0,
            last_refresh_duration_ms: 0,
            last_protection_duration_ms: 0,
            last_solicit_duration_ms: 0,
            last_dispatch_duration_ms: 0,
            last_total_duration_ms: 0,
            log_interval_cycles,
        }
    }

    pub fn start_timer() -> Instant {
        Instant::now()
    }

    pub fn record_refresh_duration(&mut self, start: Instant) {
        self.last_refresh_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_protection_duration(&mut self, start: Instant) {
        self.last_protection_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_solicit_duration(&mut self, start: Instant) {
        self.last_solicit_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_dispatch_duration(&mut self, start: Instant) {
        self.last_dispatch_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn finish_cycle(&mut self, cycle_start: Instant, success: bool) {
        self.last_total_duration_ms = cycle_start.elapsed().as_millis() as u64;
        self.cycles_run += 1;
        if !success {
            self.cycles_failed += 1;
        }

        if self.log_interval_cycles > 0 && self.cycles_run.is_multiple_of(self.log_interval_cycles)
        {
            self.log_metrics();
        }
    }

    /// Share of dispatched decisions the venue accepted (0-100%)
    pub fn execution_success_rate(&self) -> f64 {
        let total = self.executions_ok + self.executions_failed;
        if total == 0 {
            return 0.0;
        }
        (self.executions_ok as f64 / total as f64) * 100.0
    }

    pub fn log_metrics(&self) {
        tracing::info!(
            instance = %self.instance_id,
            cycles = self.cycles_run,
            cycles_failed = self.cycles_failed,
            proposals_received = self.proposals_received,
            decisions_rejected = self.decisions_rejected,
            executions_ok = self.executions_ok,
            executions_failed = self.executions_failed,
            execution_success_rate = format!("{:.1}%", self.execution_success_rate()),
            protective_closes = self.protective_closes,
            breaker_skips = self.breaker_skips,
            pause_skips = self.pause_skips,
            loss_events = self.loss_events,
            last_cycle_ms = self.last_total_duration_ms,
            last_refresh_ms = self.last_refresh_duration_ms,
            last_protection_ms = self.last_protection_duration_ms,
            last_solicit_ms = self.last_solicit_duration_ms,
            last_dispatch_ms = self.last_dispatch_duration_ms,
            "Agent metrics summary"
        );
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "cycles_run": self.cycles_run,
            "cycles_failed": self.cycles_failed,
            "proposals_received": self.proposals_received,
            "decisions_rejected": self.decisions_rejected,
            "executions_ok": self.executions_ok,
            "executions_failed": self.executions_failed,
            "protective_closes": self.protective_closes,
            "breaker_skips": self.breaker_skips,
            "pause_skips": self.pause_skips,
            "loss_events": self.loss_events,
        })
    }

    /// Restore counters from persisted JSON. Unknown or missing keys are left alone.
    pub fn restore_from_json(&mut self, json: &serde_json::Value) {
        let counters: [(&str, &mut u64); 10] = [
            ("cycles_run", &mut self.cycles_run),
            ("cycles_failed", &mut self.cycles_failed),
            ("proposals_received", &mut self.proposals_received),
            ("decisions_rejected", &mut self.decisions_rejected),
            ("executions_ok", &mut self.executions_ok),
            ("executions_failed", &mut self.executions_failed),
            ("protective_closes", &mut self.protective_closes),
            ("breaker_skips", &mut self.breaker_skips),
            ("pause_skips", &mut self.pause_skips),
            ("loss_events", &mut self.loss_events),
        ];
        for (name, slot) in counters {
            if let Some(v) = json.get(name).and_then(|v| v.as_u64()) {
                *slot = v;
            }
        }
        tracing::info!(
            instance = %self.instance_id,
            "Restored metrics from persisted state (cycles={})",
            self.cycles_run
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip_restores_counters() {
        let mut metrics = AgentMetrics::new("auto", 0);
        metrics.proposals_received = 12;
        metrics.executions_ok = 3;
        metrics.executions_failed = 1;
        metrics.finish_cycle(AgentMetrics::start_timer(), false);

        let mut restored = AgentMetrics::new("auto", 0);
        restored.restore_from_json(&metrics.to_json());
        assert_eq!(restored.cycles_run, 1);
        assert_eq!(restored.cycles_failed, 1);
        assert_eq!(restored.proposals_received, 12);
        assert_eq!(restored.execution_success_rate(), 75.0);
    }

    #[test]
    fn test_restore_ignores_missing_keys() {
        let mut metrics = AgentMetrics::new("auto", 0);
        metrics.breaker_skips = 4;
        metrics.restore_from_json(&serde_json::json!({ "loss_events": 2, "cycles_run": "x" }));
        assert_eq!(metrics.breaker_skips, 4);
        assert_eq!(metrics.loss_events, 2);
        assert_eq!(metrics.cycles_run, 0);
    }
}
