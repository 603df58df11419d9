//! Market Context Store (spec.md §4.3).
//!
//! Thread-safe registry of [`MarketContext`] keyed by market id. New module
//! — the teacher is single-market and has no registry — grounded on the
//! actor/state patterns in the example pack's `app_state.rs`/`state.rs`
//! (coarse map-spine lock, fine-grained per-entry lock) and built with the
//! teacher's preferred concurrency primitive, `parking_lot`, for the short
//! critical sections around the map spine.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::{MarketContext, MarketDescriptor};

/// One registry entry: an independently lockable market context, so
/// concurrent evaluation of different markets never contends on the map
/// spine lock.
struct Entry {
    context: RwLock<MarketContext>,
}

/// Registry of all currently tracked markets.
#[derive(Clone)]
pub struct MarketContextStore {
    inner: Arc<RwLock<HashMap<String, Arc<Entry>>>>,
}

impl MarketContextStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a new market. No-op if already present.
    pub fn add_market(&self, descriptor: MarketDescriptor) {
        let market_id = descriptor.market_id.clone();
        let mut map = self.inner.write();
        map.entry(market_id).or_insert_with(|| {
            Arc::new(Entry {
                context: RwLock::new(MarketContext::new(descriptor)),
            })
        });
    }

    pub fn remove_market(&self, market_id: &str) -> bool {
        self.inner.write().remove(market_id).is_some()
    }

    pub fn contains(&self, market_id: &str) -> bool {
        self.inner.read().contains_key(market_id)
    }

    pub fn market_ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Find which market a token belongs to, for routing order-book update
    /// callbacks (keyed by token) back to a market id.
    pub fn market_id_for_token(&self, token: &str) -> Option<String> {
        self.inner
            .read()
            .iter()
            .find(|(_, entry)| {
                let ctx = entry.context.read();
                ctx.descriptor.token_yes == token || ctx.descriptor.token_no == token
            })
            .map(|(id, _)| id.clone())
    }

    /// Deep copy of one market's context, for evaluation against a
    /// consistent snapshot.
    pub fn snapshot(&self, market_id: &str) -> Option<MarketContext> {
        let entry = self.inner.read().get(market_id).cloned()?;
        let ctx = entry.context.read().clone();
        Some(ctx)
    }

    pub fn snapshot_all(&self) -> Vec<MarketContext> {
        let map = self.inner.read();
        map.values().map(|e| e.context.read().clone()).collect()
    }

    /// Apply a mutation to one market's context under its own lock, without
    /// holding the map spine lock for the duration.
    pub fn mutate<F, R>(&self, market_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut MarketContext) -> R,
    {
        let entry = self.inner.read().get(market_id).cloned()?;
        let mut context = entry.context.write();
        Some(f(&mut context))
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MarketContextStore {
    fn default() -> Self {
        Self::new()
    }
}
