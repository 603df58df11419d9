//! Core data model: tokens, market descriptors, order book levels, positions,
//! and the signal vocabulary shared between the evaluator and the coordinator.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Opaque venue identifier for one side (YES or NO) of a binary market.
pub type Token = String;

/// Side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Yes => write!(f, "YES"),
            Side::No => write!(f, "NO"),
        }
    }
}

/// Immutable description of a binary market, supplied externally by the
/// (out-of-scope) market discovery/scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketDescriptor {
    pub market_id: String,
    pub question: String,
    pub token_yes: Token,
    pub token_no: Token,
    /// Absolute UTC unix seconds at which the market resolves.
    pub end_time: i64,
    /// Price increment, e.g. 0.01.
    pub min_tick: Decimal,
}

/// One level of an order book side: a price and the resting size at it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// L2 order book for one token. Bids are kept descending by price, asks
/// ascending. Levels with size 0 are never stored.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    /// Last applied venue sequence number, if the feed provides one.
    pub sequence: Option<u64>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<OrderBookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<OrderBookLevel> {
        self.asks.first().copied()
    }

    /// Replace the book atomically from a full snapshot. Zero-size levels are
    /// dropped and each side is sorted into its book-invariant order.
    pub fn apply_snapshot(
        &mut self,
        mut bids: Vec<OrderBookLevel>,
        mut asks: Vec<OrderBookLevel>,
        sequence: Option<u64>,
    ) {
        bids.retain(|l| !l.size.is_zero());
        asks.retain(|l| !l.size.is_zero());
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        self.bids = bids;
        self.asks = asks;
        self.sequence = sequence;
    }

    /// Upsert or remove a single bid level, keeping descending sort order.
    pub fn apply_bid_delta(&mut self, level: OrderBookLevel) {
        apply_delta(&mut self.bids, level, true);
    }

    /// Upsert or remove a single ask level, keeping ascending sort order.
    pub fn apply_ask_delta(&mut self, level: OrderBookLevel) {
        apply_delta(&mut self.asks, level, false);
    }

    pub fn is_valid(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b.price < a.price,
            _ => true,
        }
    }
}

fn apply_delta(levels: &mut Vec<OrderBookLevel>, level: OrderBookLevel, descending: bool) {
    let pos = levels.iter().position(|l| l.price == level.price);
    if level.size.is_zero() {
        if let Some(i) = pos {
            levels.remove(i);
        }
        return;
    }
    match pos {
        Some(i) => levels[i] = level,
        None => {
            let insert_at = levels
                .iter()
                .position(|l| {
                    if descending {
                        l.price < level.price
                    } else {
                        l.price > level.price
                    }
                })
                .unwrap_or(levels.len());
            levels.insert(insert_at, level);
        }
    }
}

/// One averaging-down rung, or an opportunistic high-scalp entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub entry_time: i64,
    pub is_high_scalp: bool,
    /// 0 = initial entry, 1/2 = DCA rungs. Always 0 for high-scalp positions.
    pub dca_level: u32,
}

/// Coarse position counts published on `market_update` events, cheap enough
/// to compute and serialize every tick without leaking the full position
/// vector to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSummary {
    pub yes_count: usize,
    pub no_count: usize,
    pub high_scalp_count: usize,
}

impl Position {
    pub fn unrealized_pnl(&self, current_ask: Decimal) -> Decimal {
        (current_ask - self.entry_price) * self.size
    }
}

/// Mutable per-market runtime state owned by the Market Context Store.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub descriptor: MarketDescriptor,
    pub yes_price: Option<Decimal>,
    pub no_price: Option<Decimal>,
    pub yes_bid: Option<Decimal>,
    pub no_bid: Option<Decimal>,
    pub positions: Vec<Position>,
    pub completed_cycles: u32,
    pub active_tp_order_ids: BTreeSet<String>,
    pub last_signal_time: i64,
    /// Set on an invariant violation (spec.md §7): the market stops
    /// receiving signals but is left in the store for manual inspection.
    pub quarantined: bool,
}

impl MarketContext {
    pub fn new(descriptor: MarketDescriptor) -> Self {
        Self {
            descriptor,
            yes_price: None,
            no_price: None,
            yes_bid: None,
            no_bid: None,
            positions: Vec::new(),
            completed_cycles: 0,
            active_tp_order_ids: BTreeSet::new(),
            last_signal_time: 0,
            quarantined: false,
        }
    }

    /// Coarse position counts for the `market_update` event's
    /// `position_summary` field.
    pub fn position_summary(&self) -> PositionSummary {
        PositionSummary {
            yes_count: self.level_positions(Side::Yes).len(),
            no_count: self.level_positions(Side::No).len(),
            high_scalp_count: self.high_scalp_count(),
        }
    }

    pub fn ask_for(&self, side: Side) -> Option<Decimal> {
        match side {
            Side::Yes => self.yes_price,
            Side::No => self.no_price,
        }
    }

    pub fn bid_for(&self, side: Side) -> Option<Decimal> {
        match side {
            Side::Yes => self.yes_bid,
            Side::No => self.no_bid,
        }
    }

    pub fn level_positions(&self, side: Side) -> Vec<&Position> {
        self.positions
            .iter()
            .filter(|p| p.side == side && !p.is_high_scalp)
            .collect()
    }

    pub fn high_scalp_count(&self) -> usize {
        self.positions.iter().filter(|p| p.is_high_scalp).count()
    }

    pub fn has_level_ladder(&self, side: Side) -> bool {
        !self.level_positions(side).is_empty()
    }

    /// True once both sides carry an open LEVEL ladder simultaneously — should
    /// only ever be transient, mid-unwind.
    pub fn has_hedge_inconsistency(&self) -> bool {
        self.has_level_ladder(Side::Yes) && self.has_level_ladder(Side::No)
    }

    pub fn time_left(&self, now: i64) -> i64 {
        self.descriptor.end_time - now
    }
}

/// Action an evaluated [`Signal`] instructs the coordinator to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    EnterYes,
    EnterNo,
    PlaceTpLimit,
    ExitMarket,
    ForceUnwind,
    Noop,
}

/// Output of the strategy evaluator; input to the execution coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub reason: String,
    pub dca_level: u32,
}

impl Signal {
    pub fn noop() -> Self {
        Self {
            action: SignalAction::Noop,
            side: Side::Yes,
            size: Decimal::ZERO,
            price: Decimal::ZERO,
            reason: "noop".to_string(),
            dca_level: 0,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.action == SignalAction::Noop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn book_snapshot_sorts_and_drops_zero_size() {
        let mut book = OrderBook::default();
        book.apply_snapshot(
            vec![
                OrderBookLevel { price: dec!(0.30), size: dec!(10) },
                OrderBookLevel { price: dec!(0.40), size: dec!(5) },
                OrderBookLevel { price: dec!(0.20), size: dec!(0) },
            ],
            vec![
                OrderBookLevel { price: dec!(0.55), size: dec!(4) },
                OrderBookLevel { price: dec!(0.50), size: dec!(3) },
            ],
            Some(1),
        );
        assert_eq!(book.best_bid().unwrap().price, dec!(0.40));
        assert_eq!(book.best_ask().unwrap().price, dec!(0.50));
        assert!(book.is_valid());
    }

    #[test]
    fn delta_zero_size_removes_level() {
        let mut book = OrderBook::default();
        book.apply_bid_delta(OrderBookLevel { price: dec!(0.40), size: dec!(5) });
        book.apply_bid_delta(OrderBookLevel { price: dec!(0.35), size: dec!(2) });
        assert_eq!(book.bids.len(), 2);
        book.apply_bid_delta(OrderBookLevel { price: dec!(0.40), size: dec!(0) });
        assert_eq!(book.bids.len(), 1);
        assert_eq!(book.bids[0].price, dec!(0.35));
    }

    #[test]
    fn hedge_inconsistency_detects_both_sides() {
        let descriptor = MarketDescriptor {
            market_id: "m".into(),
            question: "q".into(),
            token_yes: "y".into(),
            token_no: "n".into(),
            end_time: 1000,
            min_tick: dec!(0.01),
        };
        let mut ctx = MarketContext::new(descriptor);
        assert!(!ctx.has_hedge_inconsistency());
        ctx.positions.push(Position {
            side: Side::Yes,
            size: dec!(10),
            entry_price: dec!(0.3),
            entry_time: 0,
            is_high_scalp: false,
            dca_level: 0,
        });
        assert!(!ctx.has_hedge_inconsistency());
        ctx.positions.push(Position {
            side: Side::No,
            size: dec!(10),
            entry_price: dec!(0.3),
            entry_time: 0,
            is_high_scalp: false,
            dca_level: 0,
        });
        assert!(ctx.has_hedge_inconsistency());
    }
}
