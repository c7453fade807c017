//! Book manager (C7): owns one order book and its sync state machine per
//! symbol, the sole mutator of both, and emits periodic summaries.
//!
//! Grounded on the teacher's per-symbol ownership pattern in
//! `collector::binance_depth::BinanceDepthStream` (one struct per symbol
//! holding both the book and its stream), combined with the watchdog's
//! periodic-tick style in `supervisor::watchdog::Watchdog`.

use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::bus::{BookSummary, BusSender, Record};
use crate::model::{DepthDiff, DepthSnapshot};
use crate::orderbook::OrderBook;
use crate::sync::{self, Phase, ReconcileOutcome, SyncState};

/// Default interval between summary emissions (§4.3).
pub const DEFAULT_SUMMARY_INTERVAL: Duration = Duration::from_secs(10);
/// Default depth of the top-of-book levels carried on each summary (§4.2).
pub const DEFAULT_SUMMARY_TOP_N: usize = 10;

/// Owns the book + sync state for one symbol.
pub struct BookManager {
    symbol: String,
    book: OrderBook,
    sync: SyncState,
    bus: BusSender,
    summary_interval: Duration,
    last_summary: Option<chrono::DateTime<Utc>>,
}

impl BookManager {
    pub fn new(symbol: impl Into<String>, bus: BusSender) -> Self {
        let symbol = symbol.into();
        Self {
            book: OrderBook::new(symbol.clone()),
            sync: SyncState::new(symbol.clone()),
            symbol,
            bus,
            summary_interval: DEFAULT_SUMMARY_INTERVAL,
            last_summary: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.sync.phase()
    }

    pub fn is_synchronized(&self) -> bool {
        self.book.synchronized
    }

    /// Feed one depth diff into the sync state machine.
    pub fn on_diff(&mut self, diff: DepthDiff) {
        let now = Utc::now();
        self.sync.on_diff(&mut self.book, diff, now);
    }

    pub fn ready_to_initialize(&self) -> bool {
        self.sync.ready_to_initialize(Utc::now())
    }

    pub fn begin_initializing(&mut self) {
        self.sync.begin_initializing();
    }

    pub fn on_snapshot_failure(&mut self) {
        self.sync.on_snapshot_failure();
    }

    pub fn on_snapshot_success(&mut self, snapshot: &DepthSnapshot) -> ReconcileOutcome {
        if self.phase() != Phase::Initializing {
            let err = crate::error::IngestError::InvalidStateTransition {
                from: self.phase().to_string(),
                to: Phase::Reconciling.to_string(),
            };
            warn!(symbol = %self.symbol, error = %err, "snapshot arrived outside Initializing, reconciling anyway");
        }
        self.sync.on_snapshot_success(&mut self.book, snapshot, Utc::now())
    }

    /// Periodic drift check; `cooldown` distinguishes the manager's own
    /// trigger from a faster external monitor's (§4.2 transition 5).
    pub fn maybe_schedule_resync(&mut self, cooldown: Duration) -> bool {
        self.sync.maybe_schedule_resync(&mut self.book, Utc::now(), cooldown)
    }

    /// Emit a summary record if the interval has elapsed. Logs a warning
    /// instead of emitting while the book isn't yet synchronized (§4.3).
    pub async fn maybe_emit_summary(&mut self) {
        let now = Utc::now();
        let due = self
            .last_summary
            .map(|last| now.signed_duration_since(last) >= chrono::Duration::from_std(self.summary_interval).unwrap())
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_summary = Some(now);

        if !self.book.synchronized {
            warn!(symbol = %self.symbol, phase = %self.sync.phase(), "summary tick while unsynchronized, skipping");
            return;
        }

        let summary = self.build_summary(now);
        debug!(symbol = %self.symbol, best_bid = ?summary.best_bid, best_ask = ?summary.best_ask, "summary");
        if self.bus.send(Record::Summary(summary)).await.is_err() {
            warn!(symbol = %self.symbol, "bus closed, dropping summary");
        }
    }

    fn build_summary(&self, now: chrono::DateTime<Utc>) -> BookSummary {
        let best_bid = self.book.best_bid().map(|(p, _)| p);
        let best_ask = self.book.best_ask().map(|(p, _)| p);
        let mid_price = match (best_bid, best_ask) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::from(2)),
            _ => None,
        };
        let spread_bps = match (best_bid, best_ask, mid_price) {
            (Some(b), Some(a), Some(mid)) if !mid.is_zero() => Some((a - b) / mid * Decimal::from(10_000)),
            _ => None,
        };

        BookSummary {
            symbol: self.symbol.clone(),
            localtime: now,
            best_bid,
            best_ask,
            mid_price,
            spread_bps,
            last_update_id: self.book.last_update_id,
            update_count: self.book.update_count,
            resync_count: self.book.resync_count,
            bids_count: self.book.bids_count(),
            asks_count: self.book.asks_count(),
            top_bids: self.book.top_bids(DEFAULT_SUMMARY_TOP_N),
            top_asks: self.book.top_asks(DEFAULT_SUMMARY_TOP_N),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::channel;
    use crate::model::WireLevel;

    fn snapshot() -> DepthSnapshot {
        DepthSnapshot {
            last_update_id: 10,
            bids: vec![WireLevel("10".into(), "1".into())],
            asks: vec![WireLevel("11".into(), "1".into())],
            localtime: Utc::now(),
        }
    }

    #[tokio::test]
    async fn summary_skipped_while_unsynchronized() {
        let (tx, mut rx) = channel(4);
        let mut mgr = BookManager::new("BTCUSDT", tx);
        mgr.maybe_emit_summary().await;
        drop(mgr);
        assert!(rx.recv().await.is_none(), "no summary should have been enqueued");
    }

    #[tokio::test]
    async fn summary_emitted_once_synchronized() {
        let (tx, mut rx) = channel(4);
        let mut mgr = BookManager::new("BTCUSDT", tx);
        mgr.on_snapshot_success(&snapshot());
        assert!(mgr.is_synchronized());

        mgr.maybe_emit_summary().await;
        let record = rx.recv().await.expect("summary expected");
        match record {
            Record::Summary(s) => {
                assert_eq!(s.symbol, "BTCUSDT");
                assert_eq!(s.best_bid, Some(rust_decimal_macros::dec!(10)));
                assert_eq!(s.best_ask, Some(rust_decimal_macros::dec!(11)));
                assert!(s.mid_price.is_some());
                assert_eq!(s.top_bids, vec![(rust_decimal_macros::dec!(10), rust_decimal_macros::dec!(1))]);
                assert_eq!(s.top_asks, vec![(rust_decimal_macros::dec!(11), rust_decimal_macros::dec!(1))]);
            }
            _ => panic!("expected summary record"),
        }
    }

    #[test]
    fn resync_cooldowns_are_distinguishable() {
        assert!(sync::MANAGER_RESYNC_COOLDOWN > sync::MONITOR_RESYNC_COOLDOWN);
    }
}
