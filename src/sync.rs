//! Sync state machine (C6): buffering, snapshot-reconciliation, drift
//! detection and resync for one symbol's book (§4.2). This is the hardest
//! subsystem in the spec; grounded on the snapshot+buffer reconcile pattern
//! in `examples/other_examples/...JuanParker1-exrs...binance_f_orderbook.rs`
//! (`Orderbook::partial`/`update`/`verify`), generalized from an ad-hoc
//! `if`/`else if` chain into the five explicit states §4.2 requires, and on
//! the teacher's state-enum style (`coordination::circuit_breaker::
//! CircuitState`).

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::model::DepthDiff;
use crate::orderbook::OrderBook;

/// Default bound on the per-symbol event buffer (§3).
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;
/// Default consecutive-failure threshold before a resync is scheduled (§4.2).
pub const DEFAULT_RESYNC_THRESHOLD: u32 = 5;
/// Grace period in *Buffering* before attempting the first snapshot (§4.2 transition 1).
pub const DEFAULT_INITIAL_GRACE: Duration = Duration::from_secs(3);
/// Cool-down used by the book manager's own resync trigger (§4.2 transition 5).
pub const MANAGER_RESYNC_COOLDOWN: Duration = Duration::from_secs(30);
/// Cool-down used by the monitor task's auto-resync trigger (§4.2 transition 5).
pub const MONITOR_RESYNC_COOLDOWN: Duration = Duration::from_secs(5);

/// The five states of §4.2, in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Buffering,
    Initializing,
    Reconciling,
    Live,
    ResyncPending,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Buffering => write!(f, "buffering"),
            Phase::Initializing => write!(f, "initializing"),
            Phase::Reconciling => write!(f, "reconciling"),
            Phase::Live => write!(f, "live"),
            Phase::ResyncPending => write!(f, "resync_pending"),
        }
    }
}

/// Bounded FIFO of buffered depth-diff events (§3).
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: VecDeque<DepthDiff>,
    cap: usize,
}

impl EventBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(cap.min(4096)),
            cap,
        }
    }

    /// Append an event, evicting the oldest on overflow (§8 boundary: cap+1
    /// elements drops the oldest, keeps the newest).
    pub fn push(&mut self, event: DepthDiff) {
        if self.events.len() >= self.cap {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Drain the buffer, returning events sorted ascending by `u` (§4.2
    /// transition 3: "a sorted copy of the buffered events by ascending u").
    pub fn drain_sorted_by_u(&mut self) -> Vec<DepthDiff> {
        let mut drained: Vec<DepthDiff> = self.events.drain(..).collect();
        drained.sort_by_key(|e| e.final_update_id);
        drained
    }
}

/// Outcome of a reconcile attempt, for logging/metrics at the call site.
#[derive(Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Reconcile succeeded; book is now *Live*.
    Synced,
    /// No buffered event covered the snapshot's `lastUpdateId`; caller should
    /// re-fetch a snapshot. Unconsumed events (not definitely stale) are
    /// restored to the buffer.
    StaleSnapshot,
}

/// Per-symbol synchronization state machine.
pub struct SyncState {
    pub symbol: String,
    phase: Phase,
    buffer: EventBuffer,
    resync_threshold: u32,
    grace: Duration,
    buffering_since: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self::with_params(
            symbol,
            DEFAULT_BUFFER_CAPACITY,
            DEFAULT_RESYNC_THRESHOLD,
            DEFAULT_INITIAL_GRACE,
        )
    }

    pub fn with_params(
        symbol: impl Into<String>,
        buffer_cap: usize,
        resync_threshold: u32,
        grace: Duration,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            phase: Phase::Buffering,
            buffer: EventBuffer::new(buffer_cap),
            resync_threshold,
            grace,
            buffering_since: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Record receipt of a depth diff. Returns `true` if the event was
    /// applied directly to the book (Live fast path), `false` if it was
    /// buffered instead.
    pub fn on_diff(&mut self, book: &mut OrderBook, diff: DepthDiff, now: DateTime<Utc>) -> bool {
        if self.phase != Phase::Live {
            self.enter_buffering_if_fresh(now);
            self.buffer.push(diff);
            return false;
        }

        // Already covered by a prior event (§4.2 transition 4).
        if diff.final_update_id <= book.last_update_id {
            return false;
        }

        if diff.prev_final_update_id == book.last_update_id {
            book.apply_levels(&diff.bids, &diff.asks);
            book.last_update_id = diff.final_update_id;
            book.update_count += 1;
            book.consecutive_failures = 0;
            true
        } else {
            book.consecutive_failures += 1;
            book.synchronized = false;
            warn!(
                symbol = %self.symbol,
                expected_pu = book.last_update_id,
                got_pu = diff.prev_final_update_id,
                failures = book.consecutive_failures,
                "continuity violation, desyncing and buffering"
            );
            self.enter_buffering_if_fresh(now);
            self.buffer.push(diff);
            false
        }
    }

    fn enter_buffering_if_fresh(&mut self, now: DateTime<Utc>) {
        if self.phase != Phase::Buffering {
            self.phase = Phase::Buffering;
            self.buffering_since = Some(now);
        } else if self.buffering_since.is_none() {
            self.buffering_since = Some(now);
        }
    }

    /// True once the grace period has elapsed and the buffer holds at least
    /// one event (§4.2 transition 1).
    pub fn ready_to_initialize(&self, now: DateTime<Utc>) -> bool {
        self.phase == Phase::Buffering
            && !self.buffer.is_empty()
            && self
                .buffering_since
                .map(|since| now.signed_duration_since(since) >= chrono::Duration::from_std(self.grace).unwrap_or_default())
                .unwrap_or(false)
    }

    pub fn begin_initializing(&mut self) {
        self.phase = Phase::Initializing;
    }

    /// Snapshot fetch failed: stay in *Buffering*, caller retries after
    /// backoff (§4.2 transition 2, §7).
    pub fn on_snapshot_failure(&mut self) {
        self.phase = Phase::Buffering;
    }

    /// Snapshot fetch succeeded: load the book, drain and replay the buffer
    /// (§4.2 transitions 2-3).
    pub fn on_snapshot_success(
        &mut self,
        book: &mut OrderBook,
        snapshot: &crate::model::DepthSnapshot,
        now: DateTime<Utc>,
    ) -> ReconcileOutcome {
        book.load_snapshot(snapshot.last_update_id, &snapshot.bids, &snapshot.asks);
        self.phase = Phase::Reconciling;

        let drained = self.buffer.drain_sorted_by_u();

        // Discard events strictly stale relative to the snapshot.
        let candidates: Vec<DepthDiff> = drained
            .into_iter()
            .filter(|e| e.final_update_id >= book.last_update_id)
            .collect();

        let first_valid_idx = candidates.iter().position(|e| {
            e.first_update_id <= book.last_update_id && book.last_update_id <= e.final_update_id
        });

        let Some(idx) = first_valid_idx else {
            // Buffer doesn't cover the snapshot's lastUpdateId: stale snapshot.
            // Restore the non-stale candidates for the next attempt.
            for e in candidates {
                self.buffer.push(e);
            }
            self.phase = Phase::Initializing;
            warn!(symbol = %self.symbol, last_update_id = snapshot.last_update_id, "stale snapshot, re-fetching");
            return ReconcileOutcome::StaleSnapshot;
        };

        // Apply the first valid event and everything after it, relaxed
        // continuity for the initial-sync window (§4.2 transition 3).
        let mut final_u = book.last_update_id;
        for event in &candidates[idx..] {
            if event.final_update_id > book.last_update_id {
                book.apply_levels(&event.bids, &event.asks);
                book.last_update_id = event.final_update_id;
                final_u = event.final_update_id;
            }
        }

        if let Some(last) = candidates[idx..].last() {
            if last.final_update_id != final_u {
                warn!(
                    symbol = %self.symbol,
                    derived = final_u,
                    buffered_tail = last.final_update_id,
                    "reconcile cross-check mismatch (SPEC_FULL.md Open Question 1)"
                );
            }
        }

        self.buffer.clear();
        self.phase = Phase::Live;
        self.buffering_since = None;
        book.synchronized = true;
        book.consecutive_failures = 0;
        info!(symbol = %self.symbol, last_update_id = book.last_update_id, "synchronized");
        ReconcileOutcome::Synced
    }

    /// Drift handling (§4.2 transition 5): if the failure threshold and
    /// cool-down are both satisfied, schedule a resync (transition to
    /// *Initializing* via the transient *Resync-pending* state) and return
    /// `true`. Distinct callers (the manager's periodic check vs. a faster
    /// monitor task) pass different cool-downs.
    pub fn maybe_schedule_resync(
        &mut self,
        book: &mut OrderBook,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> bool {
        if self.phase != Phase::Buffering || book.consecutive_failures < self.resync_threshold {
            return false;
        }

        let cooldown_elapsed = book
            .last_resync_time
            .map(|t| now.signed_duration_since(t) >= chrono::Duration::from_std(cooldown).unwrap_or_default())
            .unwrap_or(true);
        if !cooldown_elapsed {
            return false;
        }

        self.phase = Phase::ResyncPending;
        book.resync_count += 1;
        book.last_resync_time = Some(now);
        info!(symbol = %self.symbol, resync_count = book.resync_count, "scheduling resync");
        self.begin_initializing();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DepthSnapshot, WireLevel};
    use chrono::TimeZone;

    fn diff(u_first: i64, u_final: i64, pu: i64) -> DepthDiff {
        DepthDiff {
            event_type: "depthUpdate".to_string(),
            event_time: 0,
            transaction_time: 0,
            symbol: "BTCUSDT".to_string(),
            first_update_id: u_first,
            final_update_id: u_final,
            prev_final_update_id: pu,
            bids: vec![],
            asks: vec![],
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn snapshot(last_update_id: i64) -> DepthSnapshot {
        DepthSnapshot {
            last_update_id,
            bids: vec![WireLevel("10".into(), "1".into())],
            asks: vec![WireLevel("11".into(), "1".into())],
            localtime: now(),
        }
    }

    #[test]
    fn happy_path_reconcile_scenario() {
        // Scenario 1 from §8.
        let mut book = OrderBook::new("BTCUSDT");
        let mut sync = SyncState::new("BTCUSDT");

        sync.on_diff(&mut book, diff(99, 101, 98), now());
        sync.on_diff(&mut book, diff(102, 103, 101), now());

        let outcome = sync.on_snapshot_success(&mut book, &snapshot(100), now());
        assert_eq!(outcome, ReconcileOutcome::Synced);
        assert_eq!(sync.phase(), Phase::Live);
        assert_eq!(book.last_update_id, 103);
        assert!(book.synchronized);
    }

    #[test]
    fn stale_snapshot_scenario() {
        // Scenario 2 from §8.
        let mut book = OrderBook::new("BTCUSDT");
        let mut sync = SyncState::new("BTCUSDT");

        sync.on_diff(&mut book, diff(60, 70, 55), now());
        let outcome = sync.on_snapshot_success(&mut book, &snapshot(50), now());
        assert_eq!(outcome, ReconcileOutcome::StaleSnapshot);
        assert_eq!(sync.phase(), Phase::Initializing);
    }

    #[test]
    fn continuity_violation_scenario() {
        // Scenario 3 from §8.
        let mut book = OrderBook::new("BTCUSDT");
        book.last_update_id = 200;
        book.synchronized = true;
        let mut sync = SyncState::new("BTCUSDT");
        sync.begin_initializing(); // pretend we got here via a prior reconcile
        sync.phase = Phase::Live;

        let applied = sync.on_diff(&mut book, diff(210, 215, 208), now());
        assert!(!applied);
        assert_eq!(book.consecutive_failures, 1);
        assert!(!book.synchronized);
        assert_eq!(book.last_update_id, 200, "book must not mutate on continuity failure");
        assert_eq!(sync.buffered_len(), 1);
        assert_eq!(sync.phase(), Phase::Buffering);
    }

    #[test]
    fn resync_on_threshold_scenario() {
        // Scenario 4 from §8.
        let mut book = OrderBook::new("BTCUSDT");
        book.last_update_id = 1;
        let mut sync = SyncState::new("BTCUSDT");
        sync.phase = Phase::Live;

        for i in 0..5 {
            sync.on_diff(&mut book, diff(100 + i, 101 + i, 999), now());
        }
        assert_eq!(book.consecutive_failures, 5);

        let scheduled = sync.maybe_schedule_resync(&mut book, now(), MANAGER_RESYNC_COOLDOWN);
        assert!(scheduled);
        assert_eq!(book.resync_count, 1);
        assert_eq!(sync.phase(), Phase::Initializing);
    }

    #[test]
    fn resync_respects_cooldown() {
        let mut book = OrderBook::new("BTCUSDT");
        book.consecutive_failures = 10;
        book.last_resync_time = Some(now());
        let mut sync = SyncState::new("BTCUSDT");
        sync.phase = Phase::Buffering;

        let scheduled = sync.maybe_schedule_resync(&mut book, now(), MANAGER_RESYNC_COOLDOWN);
        assert!(!scheduled, "cooldown has not elapsed");
    }

    #[test]
    fn idempotence_of_reapply_in_reconcile() {
        let mut book = OrderBook::new("BTCUSDT");
        let mut sync = SyncState::new("BTCUSDT");

        sync.on_diff(&mut book, diff(1, 50, 0), now());
        sync.on_snapshot_success(&mut book, &snapshot(100), now());
        let after_first = book.last_update_id;

        // A second reconcile with only already-covered events changes nothing.
        let mut sync2 = SyncState::new("BTCUSDT");
        sync2.on_diff(&mut book, diff(1, 50, 0), now());
        let outcome = sync2.on_snapshot_success(&mut book, &snapshot(100), now());
        assert_eq!(outcome, ReconcileOutcome::Synced);
        assert_eq!(book.last_update_id, after_first);
    }

    #[test]
    fn buffer_eviction_keeps_newest() {
        let mut buf = EventBuffer::new(2);
        buf.push(diff(1, 1, 0));
        buf.push(diff(2, 2, 1));
        buf.push(diff(3, 3, 2));
        let drained = buf.drain_sorted_by_u();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].final_update_id, 2);
        assert_eq!(drained[1].final_update_id, 3);
    }
}
