//! Event bus (C2): a bounded multi-producer, single-consumer channel
//! carrying every persisted event as one tagged sum type.
//!
//! Grounded on the teacher's channel-based hand-off in
//! `platform::queue` (bounded `tokio::sync::mpsc`, backpressure by
//! blocking the sender) generalized per SPEC_FULL.md's redesign flag:
//! one variant per record kind instead of separate typed channels.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::model::{AggTrade, DepthDiff, DepthSnapshot, Kline};

/// A book summary emitted periodically by the book manager (C7).
#[derive(Debug, Clone)]
pub struct BookSummary {
    pub symbol: String,
    pub localtime: DateTime<Utc>,
    pub best_bid: Option<rust_decimal::Decimal>,
    pub best_ask: Option<rust_decimal::Decimal>,
    pub mid_price: Option<rust_decimal::Decimal>,
    pub spread_bps: Option<rust_decimal::Decimal>,
    pub last_update_id: i64,
    pub update_count: u64,
    pub resync_count: u64,
    pub bids_count: usize,
    pub asks_count: usize,
    /// Top-of-book levels, best first, each side (§4.2 Summaries).
    pub top_bids: Vec<(rust_decimal::Decimal, rust_decimal::Decimal)>,
    pub top_asks: Vec<(rust_decimal::Decimal, rust_decimal::Decimal)>,
}

/// One event placed on the bus. Every variant carries the local receive
/// time the writer needs for day-rollover and CSV ordering (§3). Records
/// sourced from a combined WebSocket stream also carry the originating
/// stream name; `Snapshot`/`Summary` don't come from a stream frame and so
/// have none.
#[derive(Debug, Clone)]
pub enum Record {
    AggTrade {
        symbol: String,
        stream: String,
        localtime: DateTime<Utc>,
        event: AggTrade,
    },
    Depth {
        symbol: String,
        stream: String,
        localtime: DateTime<Utc>,
        event: DepthDiff,
    },
    Kline {
        symbol: String,
        stream: String,
        localtime: DateTime<Utc>,
        event: Kline,
    },
    Snapshot {
        symbol: String,
        localtime: DateTime<Utc>,
        event: DepthSnapshot,
    },
    Summary(BookSummary),
}

impl Record {
    pub fn symbol(&self) -> &str {
        match self {
            Record::AggTrade { symbol, .. } => symbol,
            Record::Depth { symbol, .. } => symbol,
            Record::Kline { symbol, .. } => symbol,
            Record::Snapshot { symbol, .. } => symbol,
            Record::Summary(s) => &s.symbol,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Record::AggTrade { .. } => "aggtrade",
            Record::Depth { .. } => "depth",
            Record::Kline { .. } => "kline",
            Record::Snapshot { .. } => "snapshot",
            Record::Summary(_) => "summary",
        }
    }
}

/// Sending half of the bus. Cloned once per producing task (stream
/// clients and the book manager); `send` blocks the producer when the
/// bus is full, which is the intended backpressure (§3, §9).
#[derive(Clone)]
pub struct BusSender(mpsc::Sender<Record>);

impl BusSender {
    pub async fn send(&self, record: Record) -> Result<(), mpsc::error::SendError<Record>> {
        self.0.send(record).await
    }
}

/// Receiving half of the bus. There is exactly one consumer: the writer.
pub struct BusReceiver(mpsc::Receiver<Record>);

impl BusReceiver {
    pub async fn recv(&mut self) -> Option<Record> {
        self.0.recv().await
    }
}

/// Construct a bounded bus with the given capacity (§6
/// `performance.queue_maxsize`).
pub fn channel(capacity: usize) -> (BusSender, BusReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (BusSender(tx), BusReceiver(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn send_then_recv_round_trips_a_record() {
        let (tx, mut rx) = channel(4);
        tx.send(Record::AggTrade {
            symbol: "BTCUSDT".to_string(),
            stream: "btcusdt@aggTrade".to_string(),
            localtime: Utc::now(),
            event: AggTrade {
                event_type: "aggTrade".to_string(),
                event_time: 0,
                symbol: "BTCUSDT".to_string(),
                agg_trade_id: 1,
                price: "1".to_string(),
                quantity: "1".to_string(),
                first_trade_id: 1,
                last_trade_id: 1,
                trade_time: 0,
                is_buyer_maker: false,
            },
        })
        .await
        .unwrap();

        let record = rx.recv().await.unwrap();
        assert_eq!(record.kind(), "aggtrade");
        assert_eq!(record.symbol(), "BTCUSDT");
    }

    #[tokio::test]
    async fn full_bus_blocks_until_drained() {
        let (tx, mut rx) = channel(1);
        let summary = Record::Summary(BookSummary {
            symbol: "ETHUSDT".to_string(),
            localtime: Utc::now(),
            best_bid: None,
            best_ask: None,
            mid_price: None,
            spread_bps: None,
            last_update_id: 0,
            update_count: 0,
            resync_count: 0,
            bids_count: 0,
            asks_count: 0,
            top_bids: vec![],
            top_asks: vec![],
        });
        tx.send(summary.clone()).await.unwrap();

        let tx2 = tx.clone();
        let blocked = tokio::spawn(async move { tx2.send(summary).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished(), "second send should block while full");

        rx.recv().await.unwrap();
        blocked.await.unwrap().unwrap();
    }
}
