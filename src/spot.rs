//! Spot Price Tracker (spec.md §4.1).
//!
//! Maintains the underlying asset's live spot price from two independent
//! feed connections, with a short ring buffer for "price N seconds ago"
//! lookups. Grounded on the teacher's `clob_ws_book.rs` connection shape
//! (background receive task, `Arc<RwLock<..>>` shared state, periodic
//! ping) generalized to a plain price feed with a watchdog/backoff
//! reconnect loop instead of a single best-effort connect. Each feed keeps
//! its own latest-sample slot so `get_current_price` can average whichever
//! feeds are still fresh rather than reading one shared "last write wins"
//! value, per spec.md §4.1's fallback semantics.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// How long price samples are retained for `get_price_change_since`.
const RETENTION_SECS: i64 = 600;

/// A feed sample older than this is no longer usable for `get_current_price`.
const FRESHNESS_SECS: i64 = 5;

const PING_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: i64,
    price: Decimal,
}

struct RingBuffer {
    samples: VecDeque<Sample>,
}

impl RingBuffer {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, at: i64, price: Decimal) {
        self.samples.push_back(Sample { at, price });
        while let Some(front) = self.samples.front() {
            if at - front.at > RETENTION_SECS {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn latest(&self) -> Option<Decimal> {
        self.samples.back().map(|s| s.price)
    }

    /// Price at or before `at - seconds_ago`, nearest match.
    fn price_at_or_before(&self, at: i64, seconds_ago: i64) -> Option<Decimal> {
        let target = at - seconds_ago;
        self.samples
            .iter()
            .rev()
            .find(|s| s.at <= target)
            .map(|s| s.price)
    }
}

/// Per-feed connection state: its own latest sample (for the fresh-average
/// in `get_current_price`), an exponential backoff counter, and a connected
/// flag for `is_healthy`.
struct FeedHandle {
    url: String,
    connected: AtomicBool,
    latest: Mutex<Option<Sample>>,
    join: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Tracks spot price from two independent feeds (primary + backup), each
/// independently reconnected on failure. `get_current_price` averages
/// whichever feeds currently hold a sample fresher than `FRESHNESS_SECS`.
pub struct SpotPriceTracker {
    buffer: Arc<Mutex<RingBuffer>>,
    feeds: Vec<Arc<FeedHandle>>,
    shutdown: Arc<AtomicBool>,
}

impl SpotPriceTracker {
    pub fn new(feed_urls: Vec<String>) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(RingBuffer::new())),
            feeds: feed_urls
                .into_iter()
                .map(|url| {
                    Arc::new(FeedHandle {
                        url,
                        connected: AtomicBool::new(false),
                        latest: Mutex::new(None),
                        join: Mutex::new(None),
                    })
                })
                .collect(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start background connect+watchdog tasks for every configured feed.
    /// Each feed reconnects independently with exponential backoff; as long
    /// as one feed is alive, `get_current_price` keeps returning fresh data.
    pub fn start(&self, now_fn: impl Fn() -> i64 + Send + Sync + 'static) {
        let now_fn = Arc::new(now_fn);
        for feed in &self.feeds {
            let feed_for_task = Arc::clone(feed);
            let buffer = Arc::clone(&self.buffer);
            let shutdown = Arc::clone(&self.shutdown);
            let now_fn = Arc::clone(&now_fn);
            let handle = tokio::spawn(async move {
                let feed = feed_for_task;
                let mut backoff_secs = 1u64;
                while !shutdown.load(Ordering::Relaxed) {
                    match connect_feed(&feed, &buffer, &shutdown, now_fn.as_ref()).await {
                        Ok(()) => {
                            feed.connected.store(false, Ordering::Relaxed);
                            backoff_secs = 1;
                        }
                        Err(e) => {
                            feed.connected.store(false, Ordering::Relaxed);
                            warn!(feed = %feed.url, error = %e, backoff_secs, "spot feed connect failed");
                            sleep(Duration::from_secs(backoff_secs)).await;
                            backoff_secs = (backoff_secs * 2).min(60);
                        }
                    }
                }
            });
            *feed.join.lock() = Some(handle);
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for feed in &self.feeds {
            if let Some(handle) = feed.join.lock().take() {
                handle.abort();
            }
        }
    }

    /// Average of every feed's latest sample still fresher than
    /// `FRESHNESS_SECS`. `None` if no feed has reported recently (spec.md
    /// §4.1: neither feed usable). With one fresh feed and one stale or
    /// disconnected, returns the fresh feed's price alone.
    pub fn get_current_price(&self, now: i64) -> Option<Decimal> {
        let fresh: Vec<Decimal> = self
            .feeds
            .iter()
            .filter_map(|f| *f.latest.lock())
            .filter(|s| now - s.at <= FRESHNESS_SECS)
            .map(|s| s.price)
            .collect();
        if fresh.is_empty() {
            return None;
        }
        Some(fresh.iter().sum::<Decimal>() / Decimal::from(fresh.len()))
    }

    pub fn get_price_change_since(&self, now: i64, seconds_ago: i64) -> Option<Decimal> {
        let buffer = self.buffer.lock();
        let current = buffer.latest()?;
        let past = buffer.price_at_or_before(now, seconds_ago)?;
        Some(current - past)
    }

    /// True if at least one feed is currently connected.
    pub fn is_healthy(&self) -> bool {
        self.feeds.iter().any(|f| f.connected.load(Ordering::Relaxed))
    }

    /// Record a price sample directly against feed `feed_idx`, for tests and
    /// for any feed connector that reports through a shared callback rather
    /// than owning the connection. Out-of-range indices still feed the
    /// shared retention buffer used by `get_price_change_since`.
    pub fn record_sample(&self, feed_idx: usize, at: i64, price: Decimal) {
        self.buffer.lock().push(at, price);
        if let Some(feed) = self.feeds.get(feed_idx) {
            *feed.latest.lock() = Some(Sample { at, price });
        }
    }
}

/// Extract a price from a feed message: either `{"price": ...}` (string or
/// number) or a bare numeric payload.
fn parse_price(text: &str) -> Option<Decimal> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        if let Some(field) = value.get("price") {
            if let Some(s) = field.as_str() {
                return Decimal::from_str(s.trim()).ok();
            }
            if let Some(f) = field.as_f64() {
                return Decimal::try_from(f).ok();
            }
        }
        return None;
    }
    Decimal::from_str(text.trim()).ok()
}

/// Open one feed's WS connection and read price ticks until it closes or
/// `shutdown` is set, writing every parsed sample into both the shared
/// retention buffer and this feed's own latest-sample slot.
async fn connect_feed(
    feed: &Arc<FeedHandle>,
    buffer: &Mutex<RingBuffer>,
    shutdown: &AtomicBool,
    now_fn: &(impl Fn() -> i64 + Send + Sync),
) -> anyhow::Result<()> {
    let (ws_stream, _) = connect_async(&feed.url).await.context("spot feed connect")?;
    let (mut write, mut read) = ws_stream.split();
    feed.connected.store(true, Ordering::Relaxed);
    debug!(feed = %feed.url, "spot feed connected");

    let mut ping_interval = interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping_interval.tick().await;

    while !shutdown.load(Ordering::Relaxed) {
        tokio::select! {
            _ = ping_interval.tick() => {
                if write.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
            }
            msg = read.next() => {
                let Some(Ok(msg)) = msg else { break };
                if let Message::Text(text) = msg {
                    if let Some(price) = parse_price(&text) {
                        let at = now_fn();
                        buffer.lock().push(at, price);
                        *feed.latest.lock() = Some(Sample { at, price });
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ring_buffer_retains_window_and_evicts_stale_samples() {
        let mut buf = RingBuffer::new();
        buf.push(0, dec!(100));
        buf.push(300, dec!(105));
        buf.push(700, dec!(110));
        assert_eq!(buf.latest(), Some(dec!(110)));
        // Sample at t=0 is now older than RETENTION_SECS relative to t=700.
        assert!(buf.samples.iter().all(|s| s.at != 0));
    }

    #[test]
    fn price_change_since_finds_nearest_past_sample() {
        let mut buf = RingBuffer::new();
        buf.push(0, dec!(100));
        buf.push(60, dec!(103));
        buf.push(120, dec!(108));
        let past = buf.price_at_or_before(120, 60);
        assert_eq!(past, Some(dec!(103)));
    }

    #[test]
    fn tracker_reports_none_with_no_samples() {
        let tracker = SpotPriceTracker::new(vec!["wss://a".into(), "wss://b".into()]);
        assert_eq!(tracker.get_current_price(1000), None);
        assert_eq!(tracker.get_price_change_since(1000, 60), None);
    }

    #[test]
    fn tracker_computes_change_after_recording_samples() {
        let tracker = SpotPriceTracker::new(vec![]);
        tracker.record_sample(0, 0, dec!(50000));
        tracker.record_sample(0, 60, dec!(50500));
        let change = tracker.get_price_change_since(60, 60);
        assert_eq!(change, Some(dec!(500)));
    }

    #[test]
    fn current_price_averages_two_fresh_feeds() {
        let tracker = SpotPriceTracker::new(vec!["wss://a".into(), "wss://b".into()]);
        tracker.record_sample(0, 100, dec!(50000));
        tracker.record_sample(1, 99, dec!(50200));
        assert_eq!(tracker.get_current_price(100), Some(dec!(50100)));
    }

    #[test]
    fn current_price_falls_back_to_the_one_fresh_feed() {
        let tracker = SpotPriceTracker::new(vec!["wss://a".into(), "wss://b".into()]);
        tracker.record_sample(0, 50, dec!(49000));
        tracker.record_sample(1, 100, dec!(50200));
        // Feed 0's sample is 50s stale relative to now=100, well past FRESHNESS_SECS.
        assert_eq!(tracker.get_current_price(100), Some(dec!(50200)));
    }

    #[test]
    fn current_price_none_when_every_feed_is_stale() {
        let tracker = SpotPriceTracker::new(vec!["wss://a".into()]);
        tracker.record_sample(0, 0, dec!(50000));
        assert_eq!(tracker.get_current_price(100), None);
    }

    #[test]
    fn parse_price_reads_string_and_numeric_and_bare_payloads() {
        assert_eq!(parse_price(r#"{"price": "50123.45"}"#), Some(dec!(50123.45)));
        assert_eq!(parse_price(r#"{"price": 50123.45}"#), Some(dec!(50123.45)));
        assert_eq!(parse_price("50123.45"), Some(dec!(50123.45)));
        assert_eq!(parse_price(r#"{"other": 1}"#), None);
    }
}
