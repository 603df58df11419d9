//! Engine Loop (spec.md §4.6) and control surface.
//!
//! Generalizes the teacher's single-market `run()` loop in `runner.rs` into
//! a multi-market tick driver plus `start`/`stop`/`add_market`/
//! `remove_market`/`get_status`. Book-update-driven immediate evaluation and
//! the periodic tick both funnel into the same `evaluate_market` entry
//! point, so both paths always go through the coordinator's per-market
//! serialization — mirroring how the teacher's `runner.rs` treats book
//! refresh and the sleep-based tick as two paths into one buy/TP/SL check.
//! `Engine` is `Clone` (every field is a shared handle) so the order book
//! tracker's update callback, which must be `'static` and runs from a
//! detached task, can hold its own handle back into the engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::EngineError;
use crate::events::{EngineEvent, ErrorKind, EventBus};
use crate::execution::ExecutionCoordinator;
use crate::orderbook::{OrderBookCallback, OrderBookTracker};
use crate::spot::SpotPriceTracker;
use crate::store::MarketContextStore;
use crate::strategy;
use crate::types::{MarketDescriptor, OrderBook, Token};
use crate::venue::VenueClient;

#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub active_markets: usize,
    pub trading_enabled: bool,
    pub tick_ms: u64,
    pub spot_price: Option<rust_decimal::Decimal>,
    /// Markets quarantined by an invariant violation (spec.md §7) — still
    /// in the store for inspection, but no longer receiving signals.
    pub quarantined_markets: usize,
}

/// Drives per-market evaluation on a fixed tick and on book updates, owns
/// the Market Context Store, Order Book Tracker, and Execution Coordinator.
#[derive(Clone)]
pub struct Engine {
    config: Config,
    store: MarketContextStore,
    books: Arc<OrderBookTracker>,
    spot: Arc<SpotPriceTracker>,
    coordinator: Arc<ExecutionCoordinator>,
    events: EventBus,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Engine {
    pub fn new(config: Config, venue: Arc<dyn VenueClient>) -> Self {
        let store = MarketContextStore::new();
        let events = EventBus::new();
        let books = Arc::new(OrderBookTracker::new(&config.venue_rest_base, &config.venue_ws_url));
        let spot = Arc::new(SpotPriceTracker::new(config.spot_feed_urls.clone()));
        let tradelog = if config.session_log_enabled {
            crate::tradelog::TradeLog::new(&config.session_log_dir, 0).ok().map(Arc::new)
        } else {
            None
        };
        let coordinator = Arc::new(ExecutionCoordinator::new(
            venue,
            store.clone(),
            events.clone(),
            tradelog,
            config.trading_enabled,
        ));
        Self {
            config,
            store,
            books,
            spot,
            coordinator,
            events,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn spot_price(&self) -> Option<rust_decimal::Decimal> {
        self.spot.get_current_price(now_unix())
    }

    /// Register a market: subscribes its two tokens on the Order Book
    /// Tracker with a callback that routes every top-of-book change back
    /// into an immediate `evaluate_market` call (spec.md §4.6), on top of
    /// the periodic tick. Refuses markets still inside a permanent-venue-
    /// rejection cooldown (spec.md §7) and markets past `max_concurrent_markets`.
    pub async fn add_market(&self, descriptor: MarketDescriptor) -> Result<()> {
        let market_id = descriptor.market_id.clone();
        let now = now_unix();
        if self.coordinator.is_add_blocked(&market_id, now) {
            return Err(EngineError::VenueRejected(format!(
                "market {market_id} is still in its post-rejection re-add cooldown"
            ))
            .into());
        }

        let active = self.store.len();
        if !self.store.contains(&market_id) && active >= self.config.max_concurrent_markets {
            return Err(EngineError::AtCapacity {
                active,
                max: self.config.max_concurrent_markets,
            }
            .into());
        }
        let tokens = vec![descriptor.token_yes.clone(), descriptor.token_no.clone()];
        self.store.add_market(descriptor);

        let engine_handle = self.clone();
        let on_update: OrderBookCallback = Arc::new(move |token, book| {
            let engine = engine_handle.clone();
            tokio::spawn(async move {
                engine.handle_book_update(token, book).await;
            });
        });
        if let Err(e) = self.books.subscribe(&tokens, on_update).await {
            warn!(error = %e, "order book subscribe failed, market will evaluate without live book until next tick");
            self.events.publish(EngineEvent::Error {
                market_id: Some(market_id.clone()),
                kind: ErrorKind::TransientFeed,
                detail: e.to_string(),
                ts: now,
            });
        }
        self.wake.notify_one();
        Ok(())
    }

    pub async fn remove_market(&self, market_id: &str) {
        if let Some(ctx) = self.store.snapshot(market_id) {
            self.coordinator.cancel_all_tp_orders(market_id, now_unix()).await;
            self.books
                .unsubscribe(&[ctx.descriptor.token_yes, ctx.descriptor.token_no])
                .await;
        }
        self.store.remove_market(market_id);
    }

    pub fn get_status(&self) -> BotStatus {
        BotStatus {
            active_markets: self.store.len(),
            trading_enabled: self.config.trading_enabled,
            tick_ms: self.config.tick_ms,
            spot_price: self.spot.get_current_price(now_unix()),
            quarantined_markets: self.store.snapshot_all().iter().filter(|c| c.quarantined).count(),
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.spot.stop();
        self.wake.notify_one();
    }

    /// Run the tick loop until `stop()` is called. Each tick: refresh
    /// market-context prices from the order book, evaluate every market,
    /// publish its `market_update`, and retire markets past their grace
    /// period. Independently, the Order Book Tracker's update callback
    /// (wired in `add_market`) triggers its own immediate evaluation and
    /// `market_update` the moment a book's top changes, so this loop's
    /// `tick_ms` period is an upper bound on staleness, not the only path.
    pub async fn run(&self) -> Result<()> {
        let mut ticker = interval(Duration::from_millis(self.config.tick_ms));
        info!(tick_ms = self.config.tick_ms, "engine loop starting");
        self.spot.start(now_unix);

        while !self.shutdown.load(Ordering::Relaxed) {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let now = now_unix();
            self.events.publish(EngineEvent::BotStatus {
                running: !self.shutdown.load(Ordering::Relaxed),
                active_markets: self.store.len(),
                total_pnl: self.coordinator.cumulative_realized_pnl(),
                win_rate: self.coordinator.win_rate(),
                completed_trades: self.coordinator.completed_trades(),
                ts: now,
            });

            for market_id in self.store.market_ids() {
                self.refresh_prices(&market_id).await;
                self.publish_market_update(&market_id, now);
                if let Err(e) = self.evaluate_market(&market_id, now).await {
                    warn!(market_id, error = %e, "evaluation failed");
                }
                self.maybe_retire(&market_id, now).await;
            }
        }
        info!("engine loop stopped");
        Ok(())
    }

    async fn refresh_prices(&self, market_id: &str) {
        let Some(ctx) = self.store.snapshot(market_id) else { return };
        let (yes_bid, yes_ask) = self.books.get_price(&ctx.descriptor.token_yes).await;
        let (no_bid, no_ask) = self.books.get_price(&ctx.descriptor.token_no).await;
        self.store.mutate(market_id, |ctx| {
            ctx.yes_price = yes_ask;
            ctx.no_price = no_ask;
            ctx.yes_bid = yes_bid;
            ctx.no_bid = no_bid;
        });
    }

    /// Order Book Tracker callback entry point (spec.md §4.2/§4.6): a
    /// token's top of book moved. Folds the new price into the owning
    /// market's context, publishes `market_update`, then evaluates that
    /// market immediately rather than waiting for the next tick.
    async fn handle_book_update(&self, token: Token, book: OrderBook) {
        let Some(market_id) = self.store.market_id_for_token(&token) else { return };
        let Some(ctx) = self.store.snapshot(&market_id) else { return };
        let is_yes = ctx.descriptor.token_yes == token;
        let bid = book.best_bid().map(|l| l.price);
        let ask = book.best_ask().map(|l| l.price);
        self.store.mutate(&market_id, |ctx| {
            if is_yes {
                ctx.yes_bid = bid;
                ctx.yes_price = ask;
            } else {
                ctx.no_bid = bid;
                ctx.no_price = ask;
            }
        });

        let now = now_unix();
        self.publish_market_update(&market_id, now);
        if let Err(e) = self.evaluate_market(&market_id, now).await {
            warn!(market_id, error = %e, "book-update evaluation failed");
        }
    }

    fn publish_market_update(&self, market_id: &str, now: i64) {
        let Some(ctx) = self.store.snapshot(market_id) else { return };
        self.events.publish(EngineEvent::MarketUpdate {
            market_id: market_id.to_string(),
            yes_price: ctx.yes_price,
            no_price: ctx.no_price,
            yes_bid: ctx.yes_bid,
            no_bid: ctx.no_bid,
            time_left: ctx.time_left(now),
            position_summary: ctx.position_summary(),
            ts: now,
        });
    }

    /// Evaluate one market against its current snapshot and execute the
    /// resulting signal. Both the periodic tick and book-update callbacks
    /// call this same entry point. Quarantined markets (spec.md §7
    /// invariant violations) are skipped entirely; a permanent venue
    /// rejection surfaced by the coordinator removes the market here.
    pub async fn evaluate_market(&self, market_id: &str, now: i64) -> Result<()> {
        let Some(ctx) = self.store.snapshot(market_id) else {
            return Ok(());
        };
        if ctx.quarantined {
            return Ok(());
        }
        let signal = strategy::evaluate(&ctx, now, &self.config.strategy);
        if signal.is_noop() {
            return Ok(());
        }
        if self.entries_halted() && is_entry_action(signal.action) {
            return Ok(());
        }
        let result = self.coordinator.execute(market_id, signal, now).await;
        if let Err(e) = &result {
            if matches!(e.downcast_ref::<EngineError>(), Some(EngineError::VenueRejected(_))) {
                self.remove_market(market_id).await;
            }
        }
        result
    }

    /// True once cumulative realized PnL has breached `daily_loss_limit`
    /// (a negative threshold). Exits and unwinds still go through — only
    /// new entries are suppressed.
    fn entries_halted(&self) -> bool {
        self.coordinator.cumulative_realized_pnl() <= self.config.daily_loss_limit
    }

    /// A market retires once its grace period has elapsed and it carries no
    /// open positions or resting TP orders.
    async fn maybe_retire(&self, market_id: &str, now: i64) {
        let Some(ctx) = self.store.snapshot(market_id) else { return };
        let grace_elapsed = now > ctx.descriptor.end_time + self.config.retirement_grace_secs;
        if grace_elapsed && ctx.positions.is_empty() && ctx.active_tp_order_ids.is_empty() {
            info!(market_id, "retiring market past grace period");
            self.remove_market(market_id).await;
        }
    }
}

fn is_entry_action(action: crate::types::SignalAction) -> bool {
    matches!(
        action,
        crate::types::SignalAction::EnterYes | crate::types::SignalAction::EnterNo
    )
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::DryRunVenue;
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

    #[tokio::test]
    async fn add_and_remove_market_updates_status() {
        let config = Config {
            trading_enabled: false,
            session_log_enabled: false,
            ..Config::default()
        };
        let engine = Engine::new(config, Arc::new(DryRunVenue));
        engine.add_market(descriptor(now_unix() + 600)).await.unwrap();
        assert_eq!(engine.get_status().active_markets, 1);
        engine.remove_market("m1").await;
        assert_eq!(engine.get_status().active_markets, 0);
    }

    #[tokio::test]
    async fn add_market_rejects_past_capacity() {
        let config = Config {
            trading_enabled: false,
            max_concurrent_markets: 1,
            session_log_enabled: false,
            ..Config::default()
        };
        let engine = Engine::new(config, Arc::new(DryRunVenue));
        engine.add_market(descriptor(now_unix() + 600)).await.unwrap();
        let mut second = descriptor(now_unix() + 600);
        second.market_id = "m2".into();
        let err = engine.add_market(second).await.unwrap_err();
        assert!(err.to_string().contains("at capacity"));
        assert_eq!(engine.get_status().active_markets, 1);
    }

    #[tokio::test]
    async fn evaluate_market_on_unknown_id_is_noop() {
        let config = Config {
            session_log_enabled: false,
            ..Config::default()
        };
        let engine = Engine::new(config, Arc::new(DryRunVenue));
        engine.evaluate_market("missing", 0).await.unwrap();
    }

    #[tokio::test]
    async fn quarantined_market_is_skipped_by_evaluate_market() {
        let config = Config {
            trading_enabled: false,
            session_log_enabled: false,
            ..Config::default()
        };
        let engine = Engine::new(config, Arc::new(DryRunVenue));
        engine.add_market(descriptor(10_000)).await.unwrap();
        engine.store.mutate("m1", |ctx| {
            ctx.quarantined = true;
            ctx.yes_price = Some(dec!(0.20));
        });
        engine.evaluate_market("m1", 0).await.unwrap();
        assert!(engine.store.snapshot("m1").unwrap().positions.is_empty());
        assert_eq!(engine.get_status().quarantined_markets, 1);
    }

    #[tokio::test]
    async fn daily_loss_limit_halts_entries_but_not_exits() {
        use crate::types::{Position, Side, Signal, SignalAction};

        let config = Config {
            trading_enabled: false,
            daily_loss_limit: dec!(-50),
            session_log_enabled: false,
            ..Config::default()
        };
        let engine = Engine::new(config, Arc::new(DryRunVenue));
        engine.add_market(descriptor(10_000)).await.unwrap();

        // Force a realized loss past the limit via a losing exit.
        engine
            .coordinator
            .execute(
                "m1",
                Signal {
                    action: SignalAction::EnterYes,
                    side: Side::Yes,
                    size: dec!(100),
                    price: dec!(0.50),
                    reason: "entry".into(),
                    dca_level: 0,
                },
                0,
            )
            .await
            .unwrap();
        engine
            .coordinator
            .execute(
                "m1",
                Signal {
                    action: SignalAction::ExitMarket,
                    side: Side::Yes,
                    size: dec!(100),
                    price: dec!(0.0),
                    reason: "force-exit".into(),
                    dca_level: 0,
                },
                1,
            )
            .await
            .unwrap();
        assert!(engine.entries_halted());

        // A fresh LEVEL entry is suppressed while halted...
        engine.store.mutate("m1", |ctx| {
            ctx.yes_price = Some(dec!(0.20));
        });
        engine.evaluate_market("m1", 2).await.unwrap();
        assert!(engine.store.snapshot("m1").unwrap().positions.is_empty());

        // ...but force-exit of an existing position still fires.
        engine.store.mutate("m1", |ctx| {
            ctx.positions.push(Position {
                side: Side::No,
                size: dec!(5),
                entry_price: dec!(0.3),
                entry_time: 0,
                is_high_scalp: false,
                dca_level: 0,
            });
        });
        engine.evaluate_market("m1", 9_999).await.unwrap();
        let ctx = engine.store.snapshot("m1").unwrap();
        assert!(ctx.positions.is_empty());
    }

    #[tokio::test]
    async fn retirement_removes_market_past_grace_with_no_positions() {
        let config = Config {
            trading_enabled: false,
            retirement_grace_secs: 0,
            session_log_enabled: false,
            ..Config::default()
        };
        let engine = Engine::new(config, Arc::new(DryRunVenue));
        engine.add_market(descriptor(0)).await.unwrap();
        engine.maybe_retire("m1", 1).await;
        assert_eq!(engine.get_status().active_markets, 0);
    }
}
