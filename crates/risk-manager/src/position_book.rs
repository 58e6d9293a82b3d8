use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use exchange_trait::{PositionKey, PositionSnapshot};

use crate::models::{ProtectionLevels, ProtectiveAction, ProtectiveTrigger, TrackedPositionState};

/// Result of reconciling the book with a live snapshot.
#[derive(Debug, Default)]
pub struct RefreshOutcome {
    pub added: Vec<PositionKey>,
    /// Keys that were tracked last cycle but are gone now, with their final state
    pub removed: Vec<(PositionKey, TrackedPositionState)>,
}

/// Owned table of tracked state, one entry per live (symbol, side).
///
/// Each trading instance owns exactly one book; nothing here is shared.
#[derive(Debug, Default, Clone)]
pub struct PositionBook {
    entries: BTreeMap<PositionKey, TrackedPositionState>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &PositionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &PositionKey) -> Option<&TrackedPositionState> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &PositionKey) -> Option<&mut TrackedPositionState> {
        self.entries.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PositionKey, &TrackedPositionState)> {
        self.entries.iter()
    }

    /// Start tracking a position opened by this engine. Replaces any stale entry.
    pub fn insert(&mut self, key: PositionKey, state: TrackedPositionState) {
        self.entries.insert(key, state);
    }

    /// Live keys that have no tracked state yet.
    pub fn untracked_keys(&self, positions: &[PositionSnapshot]) -> Vec<PositionKey> {
        positions
            .iter()
            .map(|p| p.key())
            .filter(|k| !self.entries.contains_key(k))
            .collect()
    }

    /// Reconcile with the live position set:
    /// new keys are created (seeded from `seeds` when available), known keys
    /// have their PnL extremes extended, vanished keys are dropped and returned.
    pub fn refresh(
        &mut self,
        positions: &[PositionSnapshot],
        seeds: &HashMap<PositionKey, ProtectionLevels>,
        now: DateTime<Utc>,
    ) -> RefreshOutcome {
        self.reconcile(positions, seeds, now, |_| true)
    }

    /// Reconcile right after protective closes. Only keys in `exited` may be
    /// dropped; anything else that vanished stays tracked so the next
    /// [`refresh`](Self::refresh) reports it for loss classification.
    pub fn refresh_after_exits(
        &mut self,
        positions: &[PositionSnapshot],
        seeds: &HashMap<PositionKey, ProtectionLevels>,
        exited: &[PositionKey],
        now: DateTime<Utc>,
    ) -> RefreshOutcome {
        self.reconcile(positions, seeds, now, |key| exited.contains(key))
    }

    fn reconcile(
        &mut self,
        positions: &[PositionSnapshot],
        seeds: &HashMap<PositionKey, ProtectionLevels>,
        now: DateTime<Utc>,
        may_drop: impl Fn(&PositionKey) -> bool,
    ) -> RefreshOutcome {
        let mut outcome = RefreshOutcome::default();

        for snapshot in positions {
            let key = snapshot.key();
            match self.entries.get_mut(&key) {
                Some(state) => {
                    state.observe(snapshot.unrealized_pnl_pct, snapshot.mark_price);
                }
                None => {
                    let levels = seeds.get(&key).copied().unwrap_or_default();
                    let state = TrackedPositionState::observed(snapshot, levels, now);
                    tracing::debug!(
                        "Tracking new position {} (entry {:.4}, stop {:?}, target {:?})",
                        key,
                        state.entry_price,
                        state.stop_loss_price,
                        state.take_profit_price
                    );
                    self.entries.insert(key.clone(), state);
                    outcome.added.push(key);
                }
            }
        }

        let live: Vec<PositionKey> = positions.iter().map(|p| p.key()).collect();
        let stale: Vec<PositionKey> = self
            .entries
            .keys()
            .filter(|k| !live.contains(k))
            .cloned()
            .collect();
        for key in stale {
            if !may_drop(&key) {
                tracing::debug!("{} vanished mid-cycle, keeping it for loss classification", key);
                continue;
            }
            if let Some(state) = self.entries.remove(&key) {
                tracing::info!("Position {} closed, dropping tracked state", key);
                outcome.removed.push((key, state));
            }
        }

        outcome
    }

    /// Record a protective close that the venue accepted.
    pub fn apply_protective_fill(&mut self, action: &ProtectiveAction) {
        let Some(state) = self.entries.get_mut(&action.key) else {
            return;
        };
        match action.trigger {
            ProtectiveTrigger::PartialTakeProfit50 { .. } => state.mark_partial_tp50(),
            ProtectiveTrigger::PartialTakeProfit100 { .. } => state.mark_partial_tp100(),
            // Removed on the next refresh once the venue reports it flat
            ProtectiveTrigger::TrailingStop { .. } => {}
        }
    }
}
