//! Strategy Evaluator — the core algorithmic subsystem (spec.md §4.4).
//!
//! `evaluate` is a pure function over a [`MarketContext`] snapshot: no I/O, no
//! clock other than the passed-in `now`, no randomness. Grounded on the
//! teacher's `strategy.rs` (`evaluate(...) -> Action`, priority-chain with
//! early return) generalized from a single fixed-price SL/TP pair to the
//! nine-rule DCA ladder in spec.md §4.4.2.

use rust_decimal::Decimal;

use crate::config::StrategyParams;
use crate::types::{MarketContext, Position, Side, Signal, SignalAction};

/// Evaluate one market snapshot and return the single highest-priority
/// signal. Referentially transparent: same `ctx`/`now` always yields the
/// same `Signal` (spec.md §8 invariant 4).
pub fn evaluate(ctx: &MarketContext, now: i64, params: &StrategyParams) -> Signal {
    let time_left = ctx.time_left(now);

    if let Some(signal) = force_exit(ctx, time_left, params) {
        return signal;
    }
    if let Some(signal) = force_unwind(ctx, time_left, params) {
        return signal;
    }
    if let Some(signal) = place_take_profit(ctx, time_left, params) {
        return signal;
    }
    if let Some(signal) = unwind_trigger(ctx, params) {
        return signal;
    }

    // No-hedging invariant: suppress entry/DCA/high-scalp rules while both
    // sides carry a LEVEL ladder (should only happen transiently mid-unwind).
    if ctx.has_hedge_inconsistency() {
        return Signal::noop();
    }

    if let Some(signal) = dca_2(ctx, params) {
        return signal;
    }
    if let Some(signal) = dca_1(ctx, params) {
        return signal;
    }
    if let Some(signal) = initial_entry(ctx, time_left, params) {
        return signal;
    }
    if let Some(signal) = high_scalp_entry(ctx, time_left, params) {
        return signal;
    }

    Signal::noop()
}

/// Rule 1 — force exit: at/under `force_exit_time_left`, close any position
/// that is underwater, or everything once `time_left <= 60`.
fn force_exit(ctx: &MarketContext, time_left: i64, params: &StrategyParams) -> Option<Signal> {
    if time_left > params.force_exit_time_left {
        return None;
    }
    let everything = time_left <= 60;
    let position = ctx.positions.iter().find(|p| {
        everything || p.unrealized_pnl(ctx.ask_for(p.side).unwrap_or(p.entry_price)) < Decimal::ZERO
    })?;
    Some(Signal {
        action: SignalAction::ExitMarket,
        side: position.side,
        size: position.size,
        price: ctx.ask_for(position.side).unwrap_or(position.entry_price),
        reason: format!("force-exit-{}min", params.force_exit_time_left / 60),
        dca_level: position.dca_level,
    })
}

/// Rule 2 — force unwind: at/under `force_unwind_time_left`, buy the
/// opposite side at market to close out the remaining LEVEL ladder.
fn force_unwind(ctx: &MarketContext, time_left: i64, params: &StrategyParams) -> Option<Signal> {
    if time_left > params.force_unwind_time_left {
        return None;
    }
    let side = [Side::Yes, Side::No]
        .into_iter()
        .find(|&s| ctx.has_level_ladder(s))?;
    let size = ladder_size(ctx, side);
    Some(Signal {
        action: SignalAction::ForceUnwind,
        side: side.opposite(),
        size,
        price: ctx.ask_for(side.opposite()).unwrap_or(Decimal::ZERO),
        reason: "force-unwind".to_string(),
        dca_level: 0,
    })
}

/// Rule 3 — place a take-profit limit for any LEVEL ladder averaging at or
/// below 0.50 that has no resting TP yet, unless we're already past the
/// force-unwind deadline (where invariant 4 forbids resting TPs entirely).
fn place_take_profit(ctx: &MarketContext, time_left: i64, params: &StrategyParams) -> Option<Signal> {
    if time_left <= params.force_unwind_time_left {
        return None;
    }
    for side in [Side::Yes, Side::No] {
        let positions = ctx.level_positions(side);
        if positions.is_empty() {
            continue;
        }
        if average_entry(&positions) > dec05() {
            continue;
        }
        if has_resting_tp(ctx, side) {
            continue;
        }
        let size = ladder_size(ctx, side);
        return Some(Signal {
            action: SignalAction::PlaceTpLimit,
            side,
            size,
            price: params.tp_price,
            reason: format!("tp@{}", params.tp_price),
            dca_level: 0,
        });
    }
    None
}

/// Rule 4 — unwind trigger: if the side we hold is threatened by the
/// opposite side's ask dropping below `unwind_trigger`, exit by closing the
/// held side.
fn unwind_trigger(ctx: &MarketContext, params: &StrategyParams) -> Option<Signal> {
    for side in [Side::Yes, Side::No] {
        if !ctx.has_level_ladder(side) {
            continue;
        }
        let opposite_ask = match ctx.ask_for(side.opposite()) {
            Some(a) => a,
            None => continue,
        };
        if opposite_ask < params.unwind_trigger {
            let size = ladder_size(ctx, side);
            return Some(Signal {
                action: SignalAction::ExitMarket,
                side,
                size,
                price: ctx.ask_for(side).unwrap_or(Decimal::ZERO),
                reason: "unwind".to_string(),
                dca_level: 0,
            });
        }
    }
    None
}

/// Rule 5 — DCA-2: exactly two LEVEL positions on a side, cumulative drop
/// from first entry at or past `dca_drop_2`.
fn dca_2(ctx: &MarketContext, params: &StrategyParams) -> Option<Signal> {
    for side in [Side::Yes, Side::No] {
        let positions = ctx.level_positions(side);
        if positions.len() != 2 {
            continue;
        }
        let first_entry = positions.iter().find(|p| p.dca_level == 0)?.entry_price;
        let ask = ctx.ask_for(side)?;
        if ask <= first_entry - params.dca_drop_2 {
            return Some(Signal {
                action: enter_action(side),
                side,
                size: params.clip_size,
                price: ask,
                reason: "dca-2".to_string(),
                dca_level: 2,
            });
        }
    }
    None
}

/// Rule 6 — DCA-1: exactly one LEVEL position on a side, drop from first
/// entry at or past `dca_drop_1`.
fn dca_1(ctx: &MarketContext, params: &StrategyParams) -> Option<Signal> {
    for side in [Side::Yes, Side::No] {
        let positions = ctx.level_positions(side);
        if positions.len() != 1 {
            continue;
        }
        let first_entry = positions[0].entry_price;
        let ask = ctx.ask_for(side)?;
        if ask <= first_entry - params.dca_drop_1 {
            return Some(Signal {
                action: enter_action(side),
                side,
                size: params.clip_size,
                price: ask,
                reason: "dca-1".to_string(),
                dca_level: 1,
            });
        }
    }
    None
}

/// Rule 7 — initial LEVEL entry. Tie-break on equal price favors YES.
fn initial_entry(ctx: &MarketContext, time_left: i64, params: &StrategyParams) -> Option<Signal> {
    if ctx.has_level_ladder(Side::Yes) || ctx.has_level_ladder(Side::No) {
        return None;
    }
    if ctx.completed_cycles >= params.max_completed_cycles {
        return None;
    }
    if time_left < params.min_entry_time_left {
        return None;
    }

    let yes_ask = ctx.yes_price.filter(|&p| p <= params.entry_trigger);
    let no_ask = ctx.no_price.filter(|&p| p <= params.entry_trigger);

    let side = match (yes_ask, no_ask) {
        (Some(y), Some(n)) => {
            if y <= n {
                Side::Yes
            } else {
                Side::No
            }
        }
        (Some(_), None) => Side::Yes,
        (None, Some(_)) => Side::No,
        (None, None) => return None,
    };
    let ask = ctx.ask_for(side)?;
    Some(Signal {
        action: enter_action(side),
        side,
        size: params.clip_size,
        price: ask,
        reason: format!("entry@{ask}"),
        dca_level: 0,
    })
}

/// Rule 8 — high-scalp opportunistic entry, late in market life, outside
/// the DCA ladder's price band.
fn high_scalp_entry(ctx: &MarketContext, time_left: i64, params: &StrategyParams) -> Option<Signal> {
    if time_left >= params.min_entry_time_left {
        return None;
    }
    if ctx.high_scalp_count() as u32 >= params.max_high_scalps {
        return None;
    }
    for side in [Side::Yes, Side::No] {
        if ctx.has_level_ladder(side) {
            continue;
        }
        let ask = match ctx.ask_for(side) {
            Some(a) => a,
            None => continue,
        };
        if ask > params.entry_trigger && ask <= params.high_scalp_entry {
            return Some(Signal {
                action: enter_action(side),
                side,
                size: params.clip_size,
                price: ask,
                reason: "high-scalp".to_string(),
                dca_level: 0,
            });
        }
    }
    None
}

fn enter_action(side: Side) -> SignalAction {
    match side {
        Side::Yes => SignalAction::EnterYes,
        Side::No => SignalAction::EnterNo,
    }
}

fn ladder_size(ctx: &MarketContext, side: Side) -> Decimal {
    ctx.level_positions(side).iter().map(|p| p.size).sum()
}

fn average_entry(positions: &[&Position]) -> Decimal {
    let total_size: Decimal = positions.iter().map(|p| p.size).sum();
    if total_size.is_zero() {
        return Decimal::ZERO;
    }
    let weighted: Decimal = positions.iter().map(|p| p.entry_price * p.size).sum();
    weighted / total_size
}

/// Matches the "<SIDE>:<order-id>" tagging convention the coordinator uses
/// when it inserts into `active_tp_order_ids`, since the bare id alone
/// doesn't carry side.
fn has_resting_tp(ctx: &MarketContext, side: Side) -> bool {
    let prefix = match side {
        Side::Yes => "YES:",
        Side::No => "NO:",
    };
    ctx.active_tp_order_ids.iter().any(|id| id.starts_with(prefix))
}

fn dec05() -> Decimal {
    use rust_decimal_macros::dec;
    dec!(0.50)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketDescriptor;
    use rust_decimal_macros::dec;

    fn descriptor(end_time: i64) -> MarketDescriptor {
        MarketDescriptor {
            market_id: "m1".into(),
            question: "q".into(),
            token_yes: "y".into(),
            token_no: "n".into(),
            end_time,
            min_tick: dec!(0.01),
        }
    }

    fn ctx_at(now: i64, life_secs: i64) -> MarketContext {
        MarketContext::new(descriptor(now + life_secs))
    }

    // S1 — happy LEVEL round-trip: entry, then TP placement once ask hits 0.88.
    #[test]
    fn s1_initial_entry_then_tp() {
        let params = StrategyParams::default();
        let mut ctx = ctx_at(0, 14 * 60);
        ctx.yes_price = Some(dec!(0.33));
        ctx.no_price = Some(dec!(0.70));
        let signal = evaluate(&ctx, 0, &params);
        assert_eq!(signal.action, SignalAction::EnterYes);
        assert_eq!(signal.dca_level, 0);
        assert_eq!(signal.size, params.clip_size);

        ctx.positions.push(Position {
            side: Side::Yes,
            size: dec!(10),
            entry_price: dec!(0.33),
            entry_time: 0,
            is_high_scalp: false,
            dca_level: 0,
        });
        ctx.yes_price = Some(dec!(0.88));
        let now = 4 * 60;
        let signal = evaluate(&ctx, now, &params);
        assert_eq!(signal.action, SignalAction::PlaceTpLimit);
        assert_eq!(signal.side, Side::Yes);
        assert_eq!(signal.price, params.tp_price);
        assert_eq!(signal.size, dec!(10));

        // TP already resting -> no re-emission (rule 3 short-circuits).
        ctx.active_tp_order_ids.insert("YES:order-1".to_string());
        let signal = evaluate(&ctx, now, &params);
        assert_ne!(signal.action, SignalAction::PlaceTpLimit);
    }

    // S2 — DCA-1 then unwind.
    #[test]
    fn s2_dca1_then_unwind() {
        let params = StrategyParams::default();
        let mut ctx = ctx_at(0, 14 * 60);
        ctx.positions.push(Position {
            side: Side::Yes,
            size: dec!(10),
            entry_price: dec!(0.34),
            entry_time: 0,
            is_high_scalp: false,
            dca_level: 0,
        });
        ctx.yes_price = Some(dec!(0.10));
        ctx.no_price = Some(dec!(0.70));
        let signal = evaluate(&ctx, 60, &params);
        assert_eq!(signal.action, SignalAction::EnterYes);
        assert_eq!(signal.dca_level, 1);

        ctx.positions.push(Position {
            side: Side::Yes,
            size: dec!(10),
            entry_price: dec!(0.10),
            entry_time: 60,
            is_high_scalp: false,
            dca_level: 1,
        });
        ctx.no_price = Some(dec!(0.58));
        let signal = evaluate(&ctx, 70, &params);
        assert_eq!(signal.action, SignalAction::ExitMarket);
        assert_eq!(signal.side, Side::Yes);
        assert_eq!(signal.size, dec!(20));
        assert_eq!(signal.reason, "unwind");
    }

    // S3 — force unwind at 5 minutes left, no TP possible.
    #[test]
    fn s3_force_unwind_at_deadline() {
        let params = StrategyParams::default();
        let mut ctx = ctx_at(0, 0);
        ctx.descriptor.end_time = 299;
        ctx.positions.push(Position {
            side: Side::Yes,
            size: dec!(10),
            entry_price: dec!(0.34),
            entry_time: 0,
            is_high_scalp: false,
            dca_level: 0,
        });
        ctx.yes_price = Some(dec!(0.20));
        ctx.no_price = Some(dec!(0.75));
        let signal = evaluate(&ctx, 0, &params);
        assert_eq!(signal.action, SignalAction::ForceUnwind);
        assert_eq!(signal.side, Side::No);
        assert_eq!(signal.size, dec!(10));
    }

    // S4 — force exit at 3 minutes with a loss.
    #[test]
    fn s4_force_exit_with_loss() {
        let params = StrategyParams::default();
        let mut ctx = ctx_at(0, 0);
        ctx.descriptor.end_time = 180;
        ctx.positions.push(Position {
            side: Side::No,
            size: dec!(20),
            entry_price: dec!(0.40),
            entry_time: 0,
            is_high_scalp: false,
            dca_level: 0,
        });
        ctx.no_price = Some(dec!(0.25));
        let signal = evaluate(&ctx, 0, &params);
        assert_eq!(signal.action, SignalAction::ExitMarket);
        assert_eq!(signal.side, Side::No);
        assert_eq!(signal.size, dec!(20));
    }

    // S5 — cycle cap refuses a 4th LEVEL entry.
    #[test]
    fn s5_cycle_cap_refuses_entry() {
        let params = StrategyParams::default();
        let mut ctx = ctx_at(0, 10 * 60);
        ctx.completed_cycles = 3;
        ctx.yes_price = Some(dec!(0.30));
        let signal = evaluate(&ctx, 0, &params);
        assert_eq!(signal.action, SignalAction::Noop);
    }

    // S6 — high-scalp late entry when LEVEL entry is time-gated out.
    #[test]
    fn s6_high_scalp_late_entry() {
        let params = StrategyParams::default();
        let mut ctx = ctx_at(0, 250);
        ctx.yes_price = Some(dec!(0.89));
        ctx.no_price = Some(dec!(0.50));
        let signal = evaluate(&ctx, 0, &params);
        assert_eq!(signal.action, SignalAction::EnterYes);
        assert_eq!(signal.reason, "high-scalp");
        assert_eq!(signal.size, params.clip_size);
    }

    #[test]
    fn boundary_time_left_equals_force_unwind_fires() {
        let params = StrategyParams::default();
        let mut ctx = ctx_at(0, 300);
        ctx.positions.push(Position {
            side: Side::Yes,
            size: dec!(10),
            entry_price: dec!(0.3),
            entry_time: 0,
            is_high_scalp: false,
            dca_level: 0,
        });
        let signal = evaluate(&ctx, 0, &params);
        assert_eq!(signal.action, SignalAction::ForceUnwind);
    }

    #[test]
    fn boundary_ask_equals_entry_trigger_fires() {
        let params = StrategyParams::default();
        let mut ctx = ctx_at(0, 10 * 60);
        ctx.yes_price = Some(params.entry_trigger);
        let signal = evaluate(&ctx, 0, &params);
        assert_eq!(signal.action, SignalAction::EnterYes);
    }

    #[test]
    fn empty_book_no_entry_but_force_exit_still_evaluated() {
        let params = StrategyParams::default();
        let mut ctx = ctx_at(0, 10 * 60);
        ctx.descriptor.end_time = 30;
        ctx.positions.push(Position {
            side: Side::Yes,
            size: dec!(5),
            entry_price: dec!(0.3),
            entry_time: 0,
            is_high_scalp: false,
            dca_level: 0,
        });
        // No ask available at all; force-exit rule (time_left<=60) still fires.
        let signal = evaluate(&ctx, 0, &params);
        assert_eq!(signal.action, SignalAction::ExitMarket);
    }

    #[test]
    fn hedge_inconsistency_suppresses_entry_rules() {
        let params = StrategyParams::default();
        let mut ctx = ctx_at(0, 10 * 60);
        ctx.positions.push(Position {
            side: Side::Yes,
            size: dec!(10),
            entry_price: dec!(0.3),
            entry_time: 0,
            is_high_scalp: false,
            dca_level: 0,
        });
        ctx.positions.push(Position {
            side: Side::No,
            size: dec!(10),
            entry_price: dec!(0.3),
            entry_time: 0,
            is_high_scalp: false,
            dca_level: 0,
        });
        ctx.yes_price = Some(dec!(0.05));
        ctx.no_price = Some(dec!(0.70));
        let signal = evaluate(&ctx, 0, &params);
        assert_eq!(signal.action, SignalAction::Noop);
    }

    #[test]
    fn determinism_same_input_same_output() {
        let params = StrategyParams::default();
        let mut ctx = ctx_at(0, 10 * 60);
        ctx.yes_price = Some(dec!(0.33));
        let a = evaluate(&ctx, 0, &params);
        let b = evaluate(&ctx, 0, &params);
        assert_eq!(a.action, b.action);
        assert_eq!(a.side, b.side);
        assert_eq!(a.size, b.size);
        assert_eq!(a.price, b.price);
        assert_eq!(a.dca_level, b.dca_level);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::types::MarketDescriptor;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn ctx_with(
        yes_price: Option<i64>,
        no_price: Option<i64>,
        yes_entry: Option<i64>,
        no_entry: Option<i64>,
        end_time: i64,
        completed_cycles: u32,
    ) -> MarketContext {
        let cents = |c: i64| Decimal::new(c, 2);
        let descriptor = MarketDescriptor {
            market_id: "m".into(),
            question: "q".into(),
            token_yes: "y".into(),
            token_no: "n".into(),
            end_time,
            min_tick: dec!(0.01),
        };
        let mut ctx = MarketContext::new(descriptor);
        ctx.yes_price = yes_price.map(cents);
        ctx.no_price = no_price.map(cents);
        ctx.completed_cycles = completed_cycles;
        if let Some(c) = yes_entry {
            ctx.positions.push(Position {
                side: Side::Yes,
                size: dec!(10),
                entry_price: cents(c),
                entry_time: 0,
                is_high_scalp: false,
                dca_level: 0,
            });
        }
        if let Some(c) = no_entry {
            ctx.positions.push(Position {
                side: Side::No,
                size: dec!(10),
                entry_price: cents(c),
                entry_time: 0,
                is_high_scalp: false,
                dca_level: 0,
            });
        }
        ctx
    }

    proptest! {
        // Invariant 4: evaluate is referentially transparent over any reachable
        // snapshot — the same (ctx, now) always yields the same Signal.
        #[test]
        fn evaluate_is_deterministic(
            yes in 0i64..100,
            no in 0i64..100,
            yes_entry in proptest::option::of(0i64..100),
            no_entry in proptest::option::of(0i64..100),
            end_time in 0i64..2000,
            now in 0i64..2000,
            cycles in 0u32..6,
        ) {
            let params = StrategyParams::default();
            let ctx = ctx_with(Some(yes), Some(no), yes_entry, no_entry, end_time, cycles);
            let a = evaluate(&ctx, now, &params);
            let b = evaluate(&ctx, now, &params);
            prop_assert_eq!(a.action, b.action);
            prop_assert_eq!(a.side, b.side);
            prop_assert_eq!(a.size, b.size);
            prop_assert_eq!(a.price, b.price);
            prop_assert_eq!(a.dca_level, b.dca_level);
        }

        // Invariant 5 (no-hedging): whenever both sides already carry a LEVEL
        // ladder, the evaluator never issues an entry, DCA, or high-scalp
        // action — only exits/unwinds are allowed to touch a hedged market.
        #[test]
        fn hedged_market_never_gets_new_entries(
            yes in 0i64..100,
            no in 0i64..100,
            yes_entry in 0i64..100,
            no_entry in 0i64..100,
            end_time in 300i64..2000,
            now in 0i64..100,
        ) {
            let params = StrategyParams::default();
            let ctx = ctx_with(Some(yes), Some(no), Some(yes_entry), Some(no_entry), end_time, 0);
            let signal = evaluate(&ctx, now, &params);
            prop_assert!(!matches!(
                signal.action,
                SignalAction::EnterYes | SignalAction::EnterNo
            ));
        }

        // Invariant 6: the cycle cap is load-bearing — once completed_cycles
        // has reached the configured max, no new LEVEL ladder ever opens.
        #[test]
        fn cycle_cap_blocks_new_ladder(
            yes in 0i64..35,
            no in 0i64..35,
            end_time in 500i64..2000,
            now in 0i64..50,
        ) {
            let params = StrategyParams::default();
            let ctx = ctx_with(Some(yes), Some(no), None, None, end_time, params.max_completed_cycles);
            let signal = evaluate(&ctx, now, &params);
            prop_assert!(!matches!(
                signal.action,
                SignalAction::EnterYes | SignalAction::EnterNo
            ));
        }
    }
}
