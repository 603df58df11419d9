//! Execution Coordinator (spec.md §4.5).
//!
//! Turns a [`Signal`] into venue order calls, serialized per market so two
//! concurrent evaluations of the same market can never race each other's
//! orders. Grounded on the teacher's `clob.rs` (`ClobClient` trait /
//! dry-run flag) generalized to a per-market `tokio::sync::Mutex` token —
//! needed here because the teacher never ran more than one market, so it
//! never needed this serialization — and on `runner.rs`'s retry-with-backoff
//! shape for its SL/TP retry loops (`[100, 200, 400]`ms cancel retries),
//! generalized into a bounded retry helper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::events::{EngineEvent, ErrorKind, EventBus};
use crate::store::MarketContextStore;
use crate::tradelog::TradeLog;
use crate::types::{Position, Side, Signal, SignalAction};
use crate::venue::{LimitOrderParams, OrderSide, OrderType, VenueClient};

/// Cancel retry backoff, in milliseconds — mirrors the teacher's
/// balance/allowance retry ladder.
const CANCEL_RETRY_BACKOFF_MS: [u64; 3] = [100, 200, 400];

/// How long (seconds) a market stays refused for re-add after a permanent
/// venue rejection removes it (spec.md §7).
const READD_COOLDOWN_SECS: i64 = 60;

/// A venue error string is treated as permanent (auth/market-level, not a
/// transient timeout or rate limit) when it carries one of these markers.
fn is_permanent_venue_error(msg: &str) -> bool {
    let m = msg.to_lowercase();
    m.contains("401") || m.contains("403") || m.contains("unauthorized") || m.contains("forbidden") || m.contains("invalid market")
}

/// A cancel failure is treated as an invariant violation — our
/// `active_tp_order_ids` bookkeeping disagrees with what the venue
/// currently knows about — when the venue reports the order doesn't exist.
fn is_order_not_found(msg: &str) -> bool {
    let m = msg.to_lowercase();
    m.contains("not found") || m.contains("404") || m.contains("unknown order")
}

/// Coordinates order placement/cancellation for all markets, with one
/// serialization token per market held across the whole `execute` call so
/// the book-update path and the tick path can never interleave orders for
/// the same market.
pub struct ExecutionCoordinator {
    venue: Arc<dyn VenueClient>,
    store: MarketContextStore,
    events: EventBus,
    tradelog: Option<Arc<TradeLog>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    trading_enabled: bool,
    realized_pnl: parking_lot::Mutex<Decimal>,
    /// (completed trades, winning trades) — drives the `bot_status` event's
    /// `win_rate`/`completed_trades` fields.
    trade_counts: parking_lot::Mutex<(u32, u32)>,
    /// market_id -> unix second until which `add_market` must refuse re-add,
    /// set when a permanent venue rejection removes a market.
    readd_block: parking_lot::Mutex<HashMap<String, i64>>,
}

impl ExecutionCoordinator {
    pub fn new(
        venue: Arc<dyn VenueClient>,
        store: MarketContextStore,
        events: EventBus,
        tradelog: Option<Arc<TradeLog>>,
        trading_enabled: bool,
    ) -> Self {
        Self {
            venue,
            store,
            events,
            tradelog,
            locks: Mutex::new(HashMap::new()),
            trading_enabled,
            realized_pnl: parking_lot::Mutex::new(Decimal::ZERO),
            trade_counts: parking_lot::Mutex::new((0, 0)),
            readd_block: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Cumulative realized PnL across every market this coordinator has
    /// closed a position for, since process start. Compared against
    /// `Config::daily_loss_limit` by the engine loop to decide whether new
    /// entries are still allowed.
    pub fn cumulative_realized_pnl(&self) -> Decimal {
        *self.realized_pnl.lock()
    }

    pub fn completed_trades(&self) -> u32 {
        self.trade_counts.lock().0
    }

    /// Fraction of completed trades that closed at a profit, 0 if none have
    /// completed yet.
    pub fn win_rate(&self) -> Decimal {
        let (total, wins) = *self.trade_counts.lock();
        if total == 0 {
            Decimal::ZERO
        } else {
            Decimal::from(wins) / Decimal::from(total)
        }
    }

    /// True while `market_id` is still inside its post-permanent-rejection
    /// re-add cooldown (spec.md §7).
    pub fn is_add_blocked(&self, market_id: &str, now: i64) -> bool {
        self.readd_block
            .lock()
            .get(market_id)
            .map(|&until| now < until)
            .unwrap_or(false)
    }

    fn block_readd(&self, market_id: &str, now: i64) {
        self.readd_block.lock().insert(market_id.to_string(), now + READD_COOLDOWN_SECS);
    }

    async fn lock_for(&self, market_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(market_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Execute a signal for a market. Acquires the market's serialization
    /// token for the whole call; a NOOP returns immediately without ever
    /// touching the venue.
    ///
    /// A signal with a negative size is an evaluator contract violation
    /// (spec.md §7): it aborts this market's tick only, surfaced loudly as
    /// an `error` event, without quarantining the market or touching the
    /// venue.
    pub async fn execute(&self, market_id: &str, signal: Signal, now: i64) -> Result<()> {
        if signal.is_noop() {
            return Ok(());
        }
        if signal.size < Decimal::ZERO {
            self.emit_error(
                market_id,
                now,
                ErrorKind::EvaluatorContractViolation,
                format!("evaluator emitted negative size {} for {:?}", signal.size, signal.action),
            );
            return Err(EngineError::EvaluatorContractViolation {
                market_id: market_id.to_string(),
                detail: format!("negative size {}", signal.size),
            }
            .into());
        }

        let lock = self.lock_for(market_id).await;
        let _guard = lock.lock().await;

        self.events.publish(EngineEvent::SignalGenerated {
            market_id: market_id.to_string(),
            side: signal.side,
            action: signal.action,
            size: signal.size,
            price: signal.price,
            dca_level: signal.dca_level,
            reason: signal.reason.clone(),
            ts: now,
        });

        let token = self.token_for(market_id, signal.side)?;

        match signal.action {
            SignalAction::EnterYes | SignalAction::EnterNo => {
                self.place_entry(market_id, &token, &signal, now).await
            }
            SignalAction::PlaceTpLimit => self.place_tp(market_id, &token, &signal, now).await,
            SignalAction::ExitMarket | SignalAction::ForceUnwind => {
                self.exit_position(market_id, &token, &signal, now).await
            }
            SignalAction::Noop => Ok(()),
        }
    }

    fn token_for(&self, market_id: &str, side: Side) -> Result<String> {
        let ctx = self
            .store
            .snapshot(market_id)
            .ok_or_else(|| EngineError::UnknownMarket(market_id.to_string()))?;
        Ok(match side {
            Side::Yes => ctx.descriptor.token_yes,
            Side::No => ctx.descriptor.token_no,
        })
    }

    /// Reacts to a venue rejection by classifying it permanent or transient
    /// and returning whether the caller should treat this as a hard failure
    /// (permanent: market gets removed and re-add blocked upstream).
    fn handle_venue_rejection(&self, market_id: &str, now: i64, msg: String) -> Result<()> {
        if is_permanent_venue_error(&msg) {
            self.emit_error(market_id, now, ErrorKind::PermanentVenue, msg.clone());
            self.block_readd(market_id, now);
            Err(EngineError::VenueRejected(msg).into())
        } else {
            self.emit_error(market_id, now, ErrorKind::TransientVenue, msg);
            Ok(())
        }
    }

    async fn place_entry(&self, market_id: &str, token: &str, signal: &Signal, now: i64) -> Result<()> {
        if !self.trading_enabled {
            self.record_position(market_id, signal, now);
            return Ok(());
        }
        let result = self
            .venue
            .place_limit_order(
                LimitOrderParams {
                    token_id: token.to_string(),
                    side: OrderSide::Buy,
                    price: signal.price,
                    size: signal.size,
                    expiration_unix: None,
                    post_only: false,
                    fee_rate_bps: None,
                },
                OrderType::Fak,
            )
            .await?;

        if !result.success {
            return self.handle_venue_rejection(market_id, now, result.error_msg.unwrap_or_else(|| "entry order rejected".into()));
        }

        self.record_position(market_id, signal, now);
        self.events.publish(EngineEvent::TradeExecuted {
            market_id: market_id.to_string(),
            side: signal.side,
            action: signal.action,
            size: signal.size,
            price: signal.price,
            pnl: None,
            order_id: result.order_id.clone(),
            reason: signal.reason.clone(),
            ts: now,
        });
        if let Some(log) = &self.tradelog {
            log.record_fill(market_id, signal, result.order_id.as_deref(), now);
        }
        Ok(())
    }

    fn record_position(&self, market_id: &str, signal: &Signal, now: i64) {
        self.store.mutate(market_id, |ctx| {
            ctx.positions.push(Position {
                side: signal.side,
                size: signal.size,
                entry_price: signal.price,
                entry_time: now,
                is_high_scalp: signal.reason == "high-scalp",
                dca_level: signal.dca_level,
            });
            ctx.last_signal_time = now;
        });
    }

    /// PLACE_TP_LIMIT (spec.md §4.5): first cancel any existing TP order(s)
    /// for this market/side, then place the new one — so a DCA rung added
    /// after a TP is already resting never leaves a stale-sized TP behind.
    async fn place_tp(&self, market_id: &str, token: &str, signal: &Signal, now: i64) -> Result<()> {
        self.cancel_resting_tp(market_id, signal.side, now).await;

        if !self.trading_enabled {
            self.tag_tp_order(market_id, signal.side, "dry-run");
            return Ok(());
        }
        let result = self
            .venue
            .place_limit_order(
                LimitOrderParams {
                    token_id: token.to_string(),
                    side: OrderSide::Sell,
                    price: signal.price,
                    size: signal.size,
                    expiration_unix: None,
                    post_only: true,
                    fee_rate_bps: None,
                },
                OrderType::Gtc,
            )
            .await?;

        if !result.success {
            return self.handle_venue_rejection(market_id, now, result.error_msg.unwrap_or_else(|| "tp order rejected".into()));
        }
        if let Some(order_id) = &result.order_id {
            self.tag_tp_order(market_id, signal.side, order_id);
        }
        self.events.publish(EngineEvent::TradeExecuted {
            market_id: market_id.to_string(),
            side: signal.side,
            action: signal.action,
            size: signal.size,
            price: signal.price,
            pnl: None,
            order_id: result.order_id,
            reason: signal.reason.clone(),
            ts: now,
        });
        Ok(())
    }

    fn tag_tp_order(&self, market_id: &str, side: Side, order_id: &str) {
        let prefix = match side {
            Side::Yes => "YES:",
            Side::No => "NO:",
        };
        self.store.mutate(market_id, |ctx| {
            ctx.active_tp_order_ids.insert(format!("{prefix}{order_id}"));
        });
    }

    async fn exit_position(&self, market_id: &str, token: &str, signal: &Signal, now: i64) -> Result<()> {
        // Cancel any resting TP for this side first, with bounded retry,
        // so the exit never races a concurrent TP fill.
        self.cancel_resting_tp(market_id, signal.side, now).await;

        if !self.trading_enabled {
            let pnl = self.close_position(market_id, signal, now);
            self.events.publish(EngineEvent::TradeExecuted {
                market_id: market_id.to_string(),
                side: signal.side,
                action: signal.action,
                size: signal.size,
                price: signal.price,
                pnl: Some(pnl),
                order_id: None,
                reason: signal.reason.clone(),
                ts: now,
            });
            return Ok(());
        }

        let order_side = match signal.action {
            SignalAction::ForceUnwind => OrderSide::Buy,
            _ => OrderSide::Sell,
        };
        let result = self
            .venue
            .place_market_order(token, order_side, signal.price, signal.size)
            .await?;

        if !result.success {
            return self.handle_venue_rejection(market_id, now, result.error_msg.unwrap_or_else(|| "exit order rejected".into()));
        }

        let pnl = self.close_position(market_id, signal, now);
        self.events.publish(EngineEvent::TradeExecuted {
            market_id: market_id.to_string(),
            side: signal.side,
            action: signal.action,
            size: signal.size,
            price: signal.price,
            pnl: Some(pnl),
            order_id: result.order_id.clone(),
            reason: signal.reason.clone(),
            ts: now,
        });
        if let Some(log) = &self.tradelog {
            log.record_close(market_id, signal, result.order_id.as_deref(), now);
        }
        Ok(())
    }

    /// Closes the LEVEL positions on the affected side and, per the
    /// cycle-counting resolution in DESIGN.md, increments `completed_cycles`
    /// whenever that closes out the side's last LEVEL rung (a full
    /// entry-to-exit round), regardless of whether it closed at a profit.
    /// Returns the PnL realized by this close.
    fn close_position(&self, market_id: &str, signal: &Signal, now: i64) -> Decimal {
        let close_side = match signal.action {
            SignalAction::ForceUnwind => signal.side.opposite(),
            _ => signal.side,
        };
        let (closed_pnl, completed) = self
            .store
            .mutate(market_id, |ctx| {
                let had_ladder = ctx.has_level_ladder(close_side);
                let closed: Decimal = ctx
                    .positions
                    .iter()
                    .filter(|p| p.side == close_side && !p.is_high_scalp)
                    .map(|p| p.unrealized_pnl(signal.price))
                    .sum();
                ctx.positions.retain(|p| p.side != close_side || p.is_high_scalp);
                let completed = had_ladder && !ctx.has_level_ladder(close_side);
                if completed {
                    ctx.completed_cycles += 1;
                }
                ctx.last_signal_time = now;
                (closed, completed)
            })
            .unwrap_or((Decimal::ZERO, false));
        *self.realized_pnl.lock() += closed_pnl;
        if completed {
            let mut counts = self.trade_counts.lock();
            counts.0 += 1;
            if closed_pnl > Decimal::ZERO {
                counts.1 += 1;
            }
        }
        closed_pnl
    }

    /// Cancel a market's resting TP order(s) for one side, retrying up to
    /// three times with the teacher's backoff ladder on venue failure. A
    /// venue "order not found" response is an invariant violation — our
    /// `active_tp_order_ids` bookkeeping disagrees with the venue — and
    /// quarantines the market (spec.md §7) rather than just logging.
    async fn cancel_resting_tp(&self, market_id: &str, side: Side, now: i64) {
        let prefix = match side {
            Side::Yes => "YES:",
            Side::No => "NO:",
        };
        let order_ids: Vec<String> = self
            .store
            .snapshot(market_id)
            .map(|ctx| {
                ctx.active_tp_order_ids
                    .iter()
                    .filter(|id| id.starts_with(prefix))
                    .map(|id| id.trim_start_matches(prefix).to_string())
                    .collect()
            })
            .unwrap_or_default();

        for order_id in order_ids {
            let mut succeeded = false;
            let mut not_found = false;
            for (attempt, backoff_ms) in CANCEL_RETRY_BACKOFF_MS.iter().enumerate() {
                match self.venue.cancel_order(&order_id).await {
                    Ok(result) if result.success => {
                        succeeded = true;
                        break;
                    }
                    Ok(result) => {
                        let msg = result.error_msg.unwrap_or_default();
                        if is_order_not_found(&msg) {
                            not_found = true;
                            break;
                        }
                        warn!(market_id, order_id, attempt, error = %msg, "cancel TP failed, retrying");
                    }
                    Err(e) => {
                        warn!(market_id, order_id, attempt, error = %e, "cancel TP errored, retrying");
                    }
                }
                sleep(Duration::from_millis(*backoff_ms)).await;
            }
            if not_found {
                self.emit_error(
                    market_id,
                    now,
                    ErrorKind::InvariantViolation,
                    format!("cancel target order {order_id} unknown to venue, active_tp_order_ids out of sync"),
                );
                self.store.mutate(market_id, |ctx| ctx.quarantined = true);
            } else if !succeeded {
                error!(market_id, order_id, "cancel TP exhausted retries");
            }
            self.store.mutate(market_id, |ctx| {
                ctx.active_tp_order_ids.remove(&format!("{prefix}{order_id}"));
            });
        }
    }

    fn emit_error(&self, market_id: &str, now: i64, kind: ErrorKind, detail: String) {
        error!(market_id, ?kind, detail, "execution error");
        self.events.publish(EngineEvent::Error {
            market_id: Some(market_id.to_string()),
            kind,
            detail: detail.clone(),
            ts: now,
        });
        if let Some(log) = &self.tradelog {
            log.record_error(Some(market_id), kind, &detail, now);
        }
    }

    /// Deadline sweep: cancel every resting TP for a market regardless of
    /// side, used when a market is force-unwound or retired.
    pub async fn cancel_all_tp_orders(&self, market_id: &str, now: i64) {
        self.cancel_resting_tp(market_id, Side::Yes, now).await;
        self.cancel_resting_tp(market_id, Side::No, now).await;
        info!(market_id, "swept all resting TP orders");
    }
}
