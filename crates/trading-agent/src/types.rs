use chrono::{DateTime, Utc};
use decision_engine::ProposedIntent;
use exchange_trait::{PositionKey, PositionSnapshot};
use proposal_client::AccountSummary;
use risk_manager::{BreakerState, BreakerStatus, LossEvent, ProtectiveTrigger};
use serde::Serialize;

/// What the venue reported for an executed decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Execution {
    pub quantity: f64,
    pub price: Option<f64>,
    pub order_id: Option<String>,
    /// Follow-up problems that did not undo the execution (e.g. a stop order
    /// the venue refused)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Execution {
    /// Nothing sent to the venue.
    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Valid, with nothing to send to the venue (hold/wait)
    Accepted,
    Rejected { reason: String },
    Executed(Execution),
    Failed { reason: String },
}

impl DecisionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DecisionOutcome::Accepted => "accepted",
            DecisionOutcome::Rejected { .. } => "rejected",
            DecisionOutcome::Executed(_) => "executed",
            DecisionOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub symbol: String,
    pub action: String,
    pub proposed: ProposedIntent,
    pub outcome: DecisionOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtectiveRecord {
    pub key: PositionKey,
    pub trigger: ProtectiveTrigger,
    pub requested_quantity: f64,
    pub mark_price: f64,
    pub success: bool,
    pub filled_quantity: Option<f64>,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

/// One persisted row per instance per cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub instance_id: String,
    pub mode: String,
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
    /// Why solicitation was skipped, if it was
    pub skipped: Option<String>,

    pub account: Option<AccountSummary>,
    pub positions: Vec<PositionSnapshot>,
    pub candidates: Vec<String>,

    pub prompt: Option<String>,
    pub rationale: Option<String>,
    pub proposed: Vec<ProposedIntent>,
    pub decisions: Vec<DecisionRecord>,
    pub protective_actions: Vec<ProtectiveRecord>,
    pub loss_events: Vec<LossEvent>,

    pub breaker: BreakerStatus,
    pub breaker_state: Option<BreakerState>,
    pub paused_until: Option<DateTime<Utc>>,
    pub daily_pnl: Option<f64>,

    pub log: Vec<String>,
}

impl CycleRecord {
    pub fn new(instance_id: &str, mode: &str, cycle_number: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            mode: mode.to_string(),
            cycle_number,
            timestamp,
            success: false,
            error_message: None,
            skipped: None,
            account: None,
            positions: Vec::new(),
            candidates: Vec::new(),
            prompt: None,
            rationale: None,
            proposed: Vec::new(),
            decisions: Vec::new(),
            protective_actions: Vec::new(),
            loss_events: Vec::new(),
            breaker: BreakerStatus::Clear,
            breaker_state: None,
            paused_until: None,
            daily_pnl: None,
            log: Vec::new(),
        }
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.log(format!("cycle aborted: {}", message));
        self.success = false;
        self.error_message = Some(message);
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.log(format!("solicitation skipped: {}", reason));
        self.success = true;
        self.skipped = Some(reason);
    }

    pub fn count(&self, label: &str) -> usize {
        self.decisions
            .iter()
            .filter(|d| d.outcome.label() == label)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let executed = DecisionOutcome::Executed(Execution {
            quantity: 0.5,
            price: Some(100.0),
            order_id: Some("PAPER-1".to_string()),
            warnings: Vec::new(),
        });
        let json = serde_json::to_value(&executed).unwrap();
        assert_eq!(json["status"], "executed");
        assert_eq!(json["order_id"], "PAPER-1");
        assert!(json.get("warnings").is_none());

        let rejected = DecisionOutcome::Rejected {
            reason: "risk:reward 1.50 below 2.00".to_string(),
        };
        let json = serde_json::to_value(&rejected).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "risk:reward 1.50 below 2.00");
    }

    #[test]
    fn test_fail_and_skip_set_flags() {
        let mut record = CycleRecord::new("auto", "full_auto", 3, Utc::now());
        record.fail("position refresh failed");
        assert!(!record.success);
        assert_eq!(record.error_message.as_deref(), Some("position refresh failed"));

        let mut record = CycleRecord::new("auto", "full_auto", 4, Utc::now());
        record.skip("circuit breaker active");
        assert!(record.success);
        assert_eq!(record.log.len(), 1);
    }
}
