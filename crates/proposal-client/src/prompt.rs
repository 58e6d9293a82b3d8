use std::fmt::Write;

use decision_engine::Action;

use crate::context::{PositionContext, ProposalRequest};

/// Hard rules and the output contract. Mirrors what the validator enforces,
/// so a compliant reply is never rejected for limits it was not told about.
pub fn build_system_prompt(request: &ProposalRequest) -> String {
    let limits = &request.limits;
    let equity = request.account.total_equity;
    let mut s = String::with_capacity(2048);

    s.push_str("You are a disciplined perpetual futures trader managing a leveraged account.\n\n");

    s.push_str("# HARD RULES\n");
    let _ = writeln!(
        s,
        "1. Leverage: BTC/ETH at most {}x, other symbols at most {}x.",
        limits.btc_eth_max_leverage, limits.altcoin_max_leverage
    );
    let _ = writeln!(
        s,
        "2. Position notional: BTC/ETH at most {:.0}x equity ({:.2} USD), other symbols at most {:.0}x equity ({:.2} USD).",
        limits.btc_eth_max_notional_multiple,
        equity * limits.btc_eth_max_notional_multiple,
        limits.altcoin_max_notional_multiple,
        equity * limits.altcoin_max_notional_multiple
    );
    let _ = writeln!(
        s,
        "3. Every open/increase needs stop_loss and take_profit with reward:risk >= {:.1}.",
        limits.min_risk_reward
    );
    s.push_str("4. Longs: stop_loss < entry_price < take_profit. Shorts: take_profit < entry_price < stop_loss.\n");
    s.push_str("5. Never open a second position on a symbol and side that is already open; use increase_* instead.\n");
    s.push_str("6. Every open/increase needs a concrete invalidation_condition.\n");
    if !request.allow_new_positions {
        s.push_str("7. This account only manages existing positions: do not propose open_long or open_short.\n");
    }
    let _ = writeln!(
        s,
        "\nDecisions are re-evaluated every {} minutes. Profitable positions are protected automatically by a trailing stop and staged take-profits.",
        request.scan_interval_minutes
    );

    s.push_str("\n# OUTPUT FORMAT\n");
    s.push_str("First write your analysis as plain text. Then output a single JSON array of decisions and nothing after it.\n");
    s.push_str("Allowed actions: ");
    let names: Vec<&str> = Action::ALL.iter().map(|a| a.as_str()).collect();
    s.push_str(&names.join(", "));
    s.push('\n');
    s.push_str(
        "Fields: symbol, action, leverage, position_size_usd, entry_price, stop_loss, take_profit, \
         confidence (0-100), risk_usd, reasoning, invalidation_condition.\n",
    );
    s.push_str("For decrease_* actions position_size_usd is the USD amount to reduce by.\n");
    s.push_str("Example:\n");
    s.push_str(
        r#"[{"symbol": "BTCUSDT", "action": "open_long", "leverage": 3, "position_size_usd": 1500, "entry_price": 50000, "stop_loss": 49000, "take_profit": 52500, "confidence": 70, "risk_usd": 30, "reasoning": "trend continuation", "invalidation_condition": "4h close below 48800"}]"#,
    );
    s.push('\n');
    s
}

/// Account, positions and market context for this cycle.
pub fn build_user_prompt(request: &ProposalRequest) -> String {
    let account = &request.account;
    let mut s = String::with_capacity(4096);

    let _ = writeln!(
        s,
        "Time: {} | Cycle #{}\n",
        request.now.format("%Y-%m-%d %H:%M:%S UTC"),
        request.cycle_number
    );

    let _ = writeln!(
        s,
        "Account: equity {:.2} | available {:.2} | unrealized {:+.2} | total PnL {:+.2} ({:+.2}%) | margin used {:.2} ({:.1}%) | positions {}\n",
        account.total_equity,
        account.available_balance,
        account.unrealized_pnl,
        account.total_pnl,
        account.total_pnl_pct,
        account.margin_used,
        account.margin_used_pct,
        account.position_count
    );

    if request.positions.is_empty() {
        s.push_str("Open positions: none\n\n");
    } else {
        s.push_str("## Open positions\n");
        for (i, pos) in request.positions.iter().enumerate() {
            write_position(&mut s, i + 1, pos);
        }
        s.push('\n');
    }

    if !request.candidates.is_empty() {
        let _ = writeln!(s, "Candidate symbols: {}\n", request.candidates.join(", "));
    }

    if request.market_context.trim().is_empty() {
        s.push_str("Market data: unavailable this cycle\n");
    } else {
        s.push_str("## Market data\n");
        s.push_str(&request.market_context);
        if !request.market_context.ends_with('\n') {
            s.push('\n');
        }
    }

    s.push_str("\nAnalyse and output your decisions.\n");
    s
}

fn write_position(s: &mut String, index: usize, ctx: &PositionContext) {
    let p = &ctx.position;
    let _ = write!(
        s,
        "{}. {} {} | qty {} | entry {:.4} | mark {:.4} | {}x | PnL {:+.2} ({:+.2}%) | margin {:.2} | liq {:.4}",
        index,
        p.symbol,
        p.side.as_str().to_uppercase(),
        p.quantity,
        p.entry_price,
        p.mark_price,
        p.effective_leverage(),
        p.unrealized_pnl,
        p.unrealized_pnl_pct,
        ctx.margin_used,
        p.liquidation_price
    );
    if let Some(minutes) = ctx.holding_minutes {
        if minutes >= 60 {
            let _ = write!(s, " | held {}h{}m", minutes / 60, minutes % 60);
        } else {
            let _ = write!(s, " | held {}m", minutes);
        }
    }
    s.push('\n');

    let _ = writeln!(
        s,
        "   peak {:+.2}% | worst {:+.2}% | drawdown from peak {:.2}%",
        ctx.max_profit_pct, ctx.max_loss_pct, ctx.drawdown_from_peak_pct
    );
    match (ctx.stop_loss, ctx.take_profit) {
        (None, None) => {}
        (stop, target) => {
            let fmt_level = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |x| format!("{x:.4}"));
            let _ = writeln!(s, "   stop {} | target {}", fmt_level(stop), fmt_level(target));
        }
    }
    if !ctx.invalidation_condition.is_empty() {
        let _ = writeln!(s, "   invalidation: {}", ctx.invalidation_condition);
    }
    if !ctx.opening_reasoning.is_empty() {
        let _ = writeln!(s, "   opened because: {}", ctx.opening_reasoning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AccountSummary;
    use chrono::{TimeZone, Utc};
    use decision_engine::ValidatorConfig;
    use exchange_trait::{PositionSide, PositionSnapshot};

    fn request(allow_new_positions: bool) -> ProposalRequest {
        ProposalRequest {
            now: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
            cycle_number: 7,
            account: AccountSummary {
                total_equity: 1_000.0,
                ..AccountSummary::default()
            },
            positions: Vec::new(),
            candidates: vec!["BTCUSDT".into(), "SOLUSDT".into()],
            market_context: String::new(),
            limits: ValidatorConfig::default(),
            scan_interval_minutes: 3,
            allow_new_positions,
        }
    }

    #[test]
    fn test_system_prompt_states_limits() {
        let prompt = build_system_prompt(&request(true));
        assert!(prompt.contains("BTC/ETH at most 5x"));
        assert!(prompt.contains("10000.00 USD"));
        assert!(prompt.contains(">= 2.0"));
        assert!(prompt.contains("update_loss_profit"));
        assert!(!prompt.contains("only manages existing positions"));

        let manage_only = build_system_prompt(&request(false));
        assert!(manage_only.contains("do not propose open_long"));
    }

    #[test]
    fn test_user_prompt_lists_positions() {
        let mut req = request(true);
        let mut ctx = PositionContext::bare(PositionSnapshot {
            symbol: "ETHUSDT".into(),
            side: PositionSide::Short,
            quantity: 1.5,
            entry_price: 3_000.0,
            mark_price: 2_950.0,
            leverage: 5,
            unrealized_pnl: 75.0,
            unrealized_pnl_pct: 8.33,
            liquidation_price: 3_550.0,
            update_time: None,
        });
        ctx.holding_minutes = Some(95);
        ctx.stop_loss = Some(3_100.0);
        ctx.invalidation_condition = "reclaims 3050".into();
        req.positions.push(ctx);

        let prompt = build_user_prompt(&req);
        assert!(prompt.contains("Cycle #7"));
        assert!(prompt.contains("ETHUSDT SHORT"));
        assert!(prompt.contains("held 1h35m"));
        assert!(prompt.contains("stop 3100.0000 | target -"));
        assert!(prompt.contains("invalidation: reclaims 3050"));
        assert!(prompt.contains("Candidate symbols: BTCUSDT, SOLUSDT"));
        assert!(prompt.contains("Market data: unavailable"));
    }
}
