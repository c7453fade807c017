//! Local order book (C5): a price-indexed bid/ask ladder with bounded depth.
//!
//! Grounded on `collector::binance_depth::OrderBookState` (teacher), with
//! `Decimal` keys instead of integer-cents (see SPEC_FULL.md Open Question 2)
//! so price equality matches the exchange's own tick exactly.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::model::WireLevel;

/// Default upper bound on levels kept per side (§3).
pub const DEFAULT_MAX_DEPTH: usize = 1000;

/// Price-indexed order book for one symbol.
///
/// `bids` iterates ascending by price; callers that want descending
/// (best-first) order use `.iter().rev()`. `asks` iterates ascending, which
/// is already best-first.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub symbol: String,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    pub last_update_id: i64,
    pub synchronized: bool,
    pub max_depth: usize,
    pub update_count: u64,
    pub resync_count: u64,
    pub consecutive_failures: u32,
    pub last_resync_time: Option<DateTime<Utc>>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            synchronized: false,
            max_depth: DEFAULT_MAX_DEPTH,
            update_count: 0,
            resync_count: 0,
            consecutive_failures: 0,
            last_resync_time: None,
        }
    }

    pub fn bids_count(&self) -> usize {
        self.bids.len()
    }

    pub fn asks_count(&self) -> usize {
        self.asks.len()
    }

    /// Best bid (highest price), if any.
    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next_back().map(|(&p, &q)| (p, q))
    }

    /// Best ask (lowest price), if any.
    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(&p, &q)| (p, q))
    }

    /// Top `n` bids, best first (descending price).
    pub fn top_bids(&self, n: usize) -> Vec<(Decimal, Decimal)> {
        self.bids.iter().rev().take(n).map(|(&p, &q)| (p, q)).collect()
    }

    /// Top `n` asks, best first (ascending price).
    pub fn top_asks(&self, n: usize) -> Vec<(Decimal, Decimal)> {
        self.asks.iter().take(n).map(|(&p, &q)| (p, q)).collect()
    }

    /// Invariant 2 (§8): no crossed book.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => bid >= ask,
            _ => false,
        }
    }

    /// Wipe both sides and load a full snapshot, inserting only levels with
    /// qty > 0 (invariant 1, §3; transition 2, §4.2).
    pub fn load_snapshot(&mut self, last_update_id: i64, bids: &[WireLevel], asks: &[WireLevel]) {
        self.bids.clear();
        self.asks.clear();

        for lvl in bids {
            if let (Some(p), Some(q)) = (lvl.price(), lvl.qty()) {
                if q > Decimal::ZERO {
                    self.bids.insert(p, q);
                }
            }
        }
        for lvl in asks {
            if let (Some(p), Some(q)) = (lvl.price(), lvl.qty()) {
                if q > Decimal::ZERO {
                    self.asks.insert(p, q);
                }
            }
        }

        self.last_update_id = last_update_id;
        self.trim();
    }

    /// Apply-updates algorithm (§4.2): zero quantity deletes the level,
    /// non-zero quantity sets it. Used both in *Live* and during buffered
    /// replay.
    pub fn apply_levels(&mut self, bids: &[WireLevel], asks: &[WireLevel]) {
        for lvl in bids {
            if let (Some(p), Some(q)) = (lvl.price(), lvl.qty()) {
                if q.is_zero() {
                    self.bids.remove(&p);
                } else {
                    self.bids.insert(p, q);
                }
            }
        }
        for lvl in asks {
            if let (Some(p), Some(q)) = (lvl.price(), lvl.qty()) {
                if q.is_zero() {
                    self.asks.remove(&p);
                } else {
                    self.asks.insert(p, q);
                }
            }
        }
        self.trim();
    }

    /// While a side exceeds `max_depth`, drop the level furthest from best
    /// (lowest-priced bid, highest-priced ask) — invariant 3, §3.
    fn trim(&mut self) {
        while self.bids.len() > self.max_depth {
            if let Some(&lowest) = self.bids.keys().next() {
                self.bids.remove(&lowest);
            }
        }
        while self.asks.len() > self.max_depth {
            if let Some(&highest) = self.asks.keys().next_back() {
                self.asks.remove(&highest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn lvl(p: &str, q: &str) -> WireLevel {
        WireLevel(p.to_string(), q.to_string())
    }

    #[test]
    fn load_snapshot_discards_zero_qty_levels() {
        let mut book = OrderBook::new("BTCUSDT");
        book.load_snapshot(100, &[lvl("10", "1"), lvl("9", "0")], &[lvl("11", "2")]);
        assert_eq!(book.bids_count(), 1);
        assert_eq!(book.best_bid(), Some((dec!(10), dec!(1))));
        assert_eq!(book.best_ask(), Some((dec!(11), dec!(2))));
        assert_eq!(book.last_update_id, 100);
    }

    #[test]
    fn apply_levels_deletion_by_zero_is_idempotent() {
        let mut book = OrderBook::new("BTCUSDT");
        book.load_snapshot(1, &[], &[lvl("11", "1"), lvl("12", "2")]);
        book.apply_levels(&[], &[lvl("11", "0"), lvl("12", "3")]);
        assert_eq!(book.asks_count(), 1);
        assert_eq!(book.best_ask(), Some((dec!(12), dec!(3))));

        // Re-applying the same zero-qty delete is a no-op.
        book.apply_levels(&[], &[lvl("11", "0")]);
        assert_eq!(book.asks_count(), 1);
    }

    #[test]
    fn trim_drops_the_level_furthest_from_best_not_the_inserted_one() {
        let mut book = OrderBook::new("BTCUSDT");
        book.max_depth = 2;
        book.apply_levels(&[lvl("10", "1"), lvl("9", "1")], &[]);
        assert_eq!(book.bids_count(), 2);

        // Inserting a new best bid should evict the lowest (9), not itself.
        book.apply_levels(&[lvl("11", "1")], &[]);
        assert_eq!(book.bids_count(), 2);
        assert!(book.top_bids(10).iter().all(|(p, _)| *p != dec!(9)));
        assert_eq!(book.best_bid(), Some((dec!(11), dec!(1))));
    }

    #[test]
    fn not_crossed_when_bid_below_ask() {
        let mut book = OrderBook::new("BTCUSDT");
        book.load_snapshot(1, &[lvl("10", "1")], &[lvl("11", "1")]);
        assert!(!book.is_crossed());
    }
}
