use crate::models::DecisionIntent;

/// Reorder a validated batch so exposure shrinks before it grows:
/// decrease, close, update_loss_profit, increase, open, then hold/wait.
/// The sort is stable, so intents of the same class keep their relative order.
pub fn sequence(mut intents: Vec<DecisionIntent>) -> Vec<DecisionIntent> {
    intents.sort_by_key(|intent| intent.action.priority());
    intents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Action;

    fn intent(symbol: &str, action: Action) -> DecisionIntent {
        DecisionIntent {
            symbol: symbol.to_string(),
            action,
            leverage: 0,
            position_size_usd: 0.0,
            entry_price: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            confidence: 0.0,
            risk_usd: 0.0,
            reasoning: String::new(),
            invalidation_condition: String::new(),
        }
    }

    fn labels(intents: &[DecisionIntent]) -> Vec<String> {
        intents.iter().map(|i| i.to_string()).collect()
    }

    #[test]
    fn test_shrinking_runs_before_growing() {
        let batch = vec![
            intent("BTCUSDT", Action::OpenLong),
            intent("ETHUSDT", Action::CloseShort),
            intent("SOLUSDT", Action::DecreaseLong),
        ];
        assert_eq!(
            labels(&sequence(batch)),
            vec![
                "decrease_long SOLUSDT",
                "close_short ETHUSDT",
                "open_long BTCUSDT"
            ]
        );
    }

    #[test]
    fn test_full_priority_ladder() {
        let batch = vec![
            intent("", Action::Wait),
            intent("A", Action::OpenShort),
            intent("B", Action::IncreaseLong),
            intent("C", Action::UpdateLossProfit),
            intent("D", Action::CloseLong),
            intent("E", Action::DecreaseShort),
        ];
        let ordered: Vec<Action> = sequence(batch).iter().map(|i| i.action).collect();
        assert_eq!(
            ordered,
            vec![
                Action::DecreaseShort,
                Action::CloseLong,
                Action::UpdateLossProfit,
                Action::IncreaseLong,
                Action::OpenShort,
                Action::Wait,
            ]
        );
    }

    #[test]
    fn test_ties_keep_original_order() {
        let batch = vec![
            intent("XRPUSDT", Action::OpenLong),
            intent("ETHUSDT", Action::Hold),
            intent("BTCUSDT", Action::OpenShort),
            intent("SOLUSDT", Action::CloseLong),
            intent("ADAUSDT", Action::OpenLong),
            intent("DOGEUSDT", Action::CloseShort),
        ];
        assert_eq!(
            labels(&sequence(batch)),
            vec![
                "close_long SOLUSDT",
                "close_short DOGEUSDT",
                "open_long XRPUSDT",
                "open_short BTCUSDT",
                "open_long ADAUSDT",
                "hold ETHUSDT",
            ]
        );
    }

    #[test]
    fn test_empty_batch() {
        assert!(sequence(Vec::new()).is_empty());
    }
}
