//! CSV batched writer (C8): the bus's sole consumer. Buffers records per
//! (kind, symbol), flushes on size or time, and rolls files at UTC day
//! boundaries. The snapshot kind is the one exception to append-and-grow:
//! every flush overwrites that day's file with the latest snapshot in full.
//!
//! Grounded on `csv::Writer::from_path` + `.serialize(event)` and the
//! `Utc::today()` day-rollover comparison in
//! `examples/other_examples/...JuanParker1-exrs...binance_f_orderbook.rs`
//! (the `csv` crate itself is not in the teacher's dependency stack; see
//! DESIGN.md), combined with the teacher's batch-and-flush discipline in
//! `collector::polymarket_orderbook_history`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::info;

use crate::bus::{BookSummary, BusReceiver, Record};
use crate::error::{IngestError, Result};
use crate::model::{AggTrade, DepthDiff, DepthSnapshot, Kline, WireLevel};

/// ENOSPC, portable across the platforms this binary actually targets.
const ENOSPC: i32 = 28;

fn levels_to_json(levels: &[WireLevel]) -> String {
    serde_json::to_string(levels).unwrap_or_default()
}

fn level_pairs_json(levels: &[(rust_decimal::Decimal, rust_decimal::Decimal)]) -> String {
    let pairs: Vec<(String, String)> = levels.iter().map(|(p, q)| (p.to_string(), q.to_string())).collect();
    serde_json::to_string(&pairs).unwrap_or_default()
}

fn opt_decimal(value: Option<rust_decimal::Decimal>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Tracks which day's file a (kind, symbol) pair is currently writing to.
struct Sink {
    kind: &'static str,
    symbol: String,
    day: NaiveDate,
}

/// Batched, day-rolling CSV writer. Owns the bus receiver; this is the
/// bus's only consumer (§4.4).
pub struct CsvWriter {
    rx: BusReceiver,
    output_dir: PathBuf,
    batch_size: usize,
    flush_interval: std::time::Duration,
    sinks: HashMap<(String, String), Sink>,
    writers: HashMap<PathBuf, csv::Writer<std::fs::File>>,
    buffers: HashMap<(String, String), Vec<Vec<String>>>,
}

impl CsvWriter {
    pub fn new(
        rx: BusReceiver,
        output_dir: impl Into<PathBuf>,
        batch_size: usize,
        flush_interval_secs: u64,
    ) -> Self {
        Self {
            rx,
            output_dir: output_dir.into(),
            batch_size,
            flush_interval: std::time::Duration::from_secs(flush_interval_secs.max(1)),
            sinks: HashMap::new(),
            writers: HashMap::new(),
            buffers: HashMap::new(),
        }
    }

    /// Per-kind file name templates (§4.4/§6). The snapshot kind alone puts
    /// the symbol first; every other kind puts the kind first.
    fn path_for(&self, kind: &str, symbol: &str, day: NaiveDate) -> PathBuf {
        let date = day.format("%Y%m%d");
        let filename = match kind {
            "aggtrade" => format!("aggtrade_{symbol}_{date}.csv"),
            "depth" => format!("depth_{symbol}_{date}.csv"),
            "kline" => format!("kline_1m_{symbol}_{date}.csv"),
            "summary" => format!("orderbook_{symbol}_{date}.csv"),
            "snapshot" => format!("{symbol}_depth_snapshot_{date}.csv"),
            other => unreachable!("unknown record kind {other}"),
        };
        self.output_dir.join(symbol).join(filename)
    }

    /// Main loop: drains the bus until it closes, flushing on batch-size
    /// and a periodic tick (§4.4 dual triggers).
    pub async fn run(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.flush_interval);
        loop {
            tokio::select! {
                record = self.rx.recv() => {
                    match record {
                        Some(r) => self.ingest(r)?,
                        None => {
                            self.flush_all()?;
                            info!("bus closed, writer exiting");
                            return Ok(());
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.flush_all()?;
                }
            }
        }
    }

    fn ingest(&mut self, record: Record) -> Result<()> {
        let kind = record.kind();
        let symbol = record.symbol().to_string();
        let localtime = record_localtime(&record);
        let rows = record_to_rows(&record);
        let key = (kind.to_string(), symbol);

        match self.sinks.get(&key) {
            Some(sink) if sink.day != localtime.date_naive() => {
                // Day rolled over: flush whatever is buffered under the old
                // day before the file name changes underneath it.
                self.flush_one(&key)?;
                self.sinks.get_mut(&key).unwrap().day = localtime.date_naive();
            }
            Some(_) => {}
            None => {
                self.sinks.insert(
                    key.clone(),
                    Sink {
                        kind,
                        symbol: record.symbol().to_string(),
                        day: localtime.date_naive(),
                    },
                );
            }
        }

        if kind == "snapshot" {
            // Each new snapshot supersedes the previous one for the day
            // (§4.4, §8 invariant 5: full overwrite, not append).
            self.buffers.insert(key.clone(), rows);
            return self.flush_one(&key);
        }

        self.buffers.entry(key.clone()).or_default().extend(rows);

        let should_flush = self
            .buffers
            .get(&key)
            .map(|b| b.len() >= self.batch_size)
            .unwrap_or(false);
        if should_flush {
            self.flush_one(&key)?;
        }
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        let keys: Vec<_> = self.buffers.keys().cloned().collect();
        for key in keys {
            self.flush_one(&key)?;
        }
        Ok(())
    }

    fn flush_one(&mut self, key: &(String, String)) -> Result<()> {
        let rows = match self.buffers.get_mut(key) {
            Some(rows) if !rows.is_empty() => std::mem::take(rows),
            _ => return Ok(()),
        };

        let sink = self.sinks.get(key).expect("sink exists for buffered key");
        let kind = sink.kind;
        let day = sink.day;
        let path = self.path_for(kind, &sink.symbol, day);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if kind == "snapshot" {
            // A fresh file every flush: the snapshot kind overwrites, it
            // never appends, so any cached append-mode handle is stale.
            self.writers.remove(&path);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?;
            let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
            writer.write_record(header_for(kind)).map_err(IngestError::from)?;
            for row in &rows {
                writer.write_record(row).map_err(IngestError::from)?;
            }
            flush_writer(&mut writer, &path)?;
            return Ok(());
        }

        let needs_header = !self.writers.contains_key(&path) && !path.exists();
        let writer = self.writers.entry(path.clone()).or_insert_with(|| {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .expect("open csv file for append");
            csv::WriterBuilder::new().has_headers(false).from_writer(file)
        });

        if needs_header {
            writer.write_record(header_for(kind)).map_err(IngestError::from)?;
        }
        for row in &rows {
            writer.write_record(row).map_err(IngestError::from)?;
        }
        flush_writer(writer, &path)?;

        Ok(())
    }
}

/// Flush, distinguishing a full disk (§7: fatal, must be surfaced) from any
/// other I/O failure.
fn flush_writer<W: std::io::Write>(writer: &mut csv::Writer<W>, path: &Path) -> Result<()> {
    match writer.flush() {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(ENOSPC) => Err(IngestError::DiskFull {
            path: path.display().to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Fixed per-kind column schema (§4.4), written once as the first line of
/// each newly created file (or every flush, for the snapshot kind).
fn header_for(kind: &str) -> &'static [&'static str] {
    match kind {
        "aggtrade" => &[
            "localtime",
            "stream",
            "event_time",
            "trade_time",
            "symbol",
            "agg_trade_id",
            "price",
            "quantity",
            "first_trade_id",
            "last_trade_id",
            "is_buyer_maker",
        ],
        "depth" => &[
            "localtime",
            "stream",
            "e",
            "E",
            "T",
            "s",
            "U",
            "u",
            "pu",
            "bids",
            "asks",
            "bids_count",
            "asks_count",
        ],
        "kline" => &[
            "localtime",
            "stream",
            "event_time",
            "symbol",
            "k_interval",
            "k_start_time",
            "k_close_time",
            "k_open",
            "k_close",
            "k_high",
            "k_low",
            "k_volume",
            "k_num_trades",
            "k_is_closed",
            "k_quote_volume",
            "k_taker_buy_base_volume",
            "k_taker_buy_quote_volume",
        ],
        "snapshot" => &["rank", "type", "price", "quantity", "localtime", "lastUpdateId"],
        "summary" => &[
            "localtime",
            "symbol",
            "best_bid",
            "best_ask",
            "mid_price",
            "spread_bps",
            "last_update_id",
            "update_count",
            "resync_count",
            "bids_count",
            "asks_count",
            "top_bids",
            "top_asks",
        ],
        other => unreachable!("unknown record kind {other}"),
    }
}

fn record_localtime(record: &Record) -> DateTime<Utc> {
    match record {
        Record::AggTrade { localtime, .. } => *localtime,
        Record::Depth { localtime, .. } => *localtime,
        Record::Kline { localtime, .. } => *localtime,
        Record::Snapshot { localtime, .. } => *localtime,
        Record::Summary(s) => s.localtime,
    }
}

/// Most records produce exactly one row; the snapshot kind's row-per-level
/// schema produces one row per book level (§4.4).
fn record_to_rows(record: &Record) -> Vec<Vec<String>> {
    match record {
        Record::AggTrade { localtime, stream, event, .. } => vec![agg_trade_row(*localtime, stream, event)],
        Record::Depth { localtime, stream, event, .. } => vec![depth_row(*localtime, stream, event)],
        Record::Kline { localtime, stream, event, .. } => vec![kline_row(*localtime, stream, event)],
        Record::Snapshot { localtime, event, .. } => snapshot_rows(*localtime, event),
        Record::Summary(s) => vec![summary_row(s)],
    }
}

fn agg_trade_row(localtime: DateTime<Utc>, stream: &str, e: &AggTrade) -> Vec<String> {
    vec![
        localtime.to_rfc3339(),
        stream.to_string(),
        e.event_time.to_string(),
        e.trade_time.to_string(),
        e.symbol.clone(),
        e.agg_trade_id.to_string(),
        e.price.clone(),
        e.quantity.clone(),
        e.first_trade_id.to_string(),
        e.last_trade_id.to_string(),
        e.is_buyer_maker.to_string(),
    ]
}

fn depth_row(localtime: DateTime<Utc>, stream: &str, e: &DepthDiff) -> Vec<String> {
    vec![
        localtime.to_rfc3339(),
        stream.to_string(),
        e.event_type.clone(),
        e.event_time.to_string(),
        e.transaction_time.to_string(),
        e.symbol.clone(),
        e.first_update_id.to_string(),
        e.final_update_id.to_string(),
        e.prev_final_update_id.to_string(),
        levels_to_json(&e.bids),
        levels_to_json(&e.asks),
        e.bids.len().to_string(),
        e.asks.len().to_string(),
    ]
}

fn kline_row(localtime: DateTime<Utc>, stream: &str, e: &Kline) -> Vec<String> {
    let k = &e.k;
    vec![
        localtime.to_rfc3339(),
        stream.to_string(),
        e.event_time.to_string(),
        e.symbol.clone(),
        k.interval.clone(),
        k.start_time.to_string(),
        k.close_time.to_string(),
        k.open.clone(),
        k.close.clone(),
        k.high.clone(),
        k.low.clone(),
        k.volume.clone(),
        k.num_trades.to_string(),
        k.is_closed.to_string(),
        k.quote_volume.clone(),
        k.taker_buy_base_volume.clone(),
        k.taker_buy_quote_volume.clone(),
    ]
}

/// Row-per-level, bids ranked best-first descending, asks best-first
/// ascending (§4.4: the long-format variant reserved for this kind only).
fn snapshot_rows(localtime: DateTime<Utc>, e: &DepthSnapshot) -> Vec<Vec<String>> {
    let mut bids: Vec<&WireLevel> = e.bids.iter().collect();
    bids.sort_by(|a, b| b.price().cmp(&a.price()));
    let mut asks: Vec<&WireLevel> = e.asks.iter().collect();
    asks.sort_by(|a, b| a.price().cmp(&b.price()));

    let mut rows = Vec::with_capacity(bids.len() + asks.len());
    for (rank, lvl) in bids.iter().enumerate() {
        rows.push(vec![
            (rank + 1).to_string(),
            "bid".to_string(),
            lvl.0.clone(),
            lvl.1.clone(),
            localtime.to_rfc3339(),
            e.last_update_id.to_string(),
        ]);
    }
    for (rank, lvl) in asks.iter().enumerate() {
        rows.push(vec![
            (rank + 1).to_string(),
            "ask".to_string(),
            lvl.0.clone(),
            lvl.1.clone(),
            localtime.to_rfc3339(),
            e.last_update_id.to_string(),
        ]);
    }
    rows
}

fn summary_row(s: &BookSummary) -> Vec<String> {
    vec![
        s.localtime.to_rfc3339(),
        s.symbol.clone(),
        opt_decimal(s.best_bid),
        opt_decimal(s.best_ask),
        opt_decimal(s.mid_price),
        opt_decimal(s.spread_bps),
        s.last_update_id.to_string(),
        s.update_count.to_string(),
        s.resync_count.to_string(),
        s.bids_count.to_string(),
        s.asks_count.to_string(),
        level_pairs_json(&s.top_bids),
        level_pairs_json(&s.top_asks),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::channel;
    use crate::model::AggTrade;
    use tempfile::tempdir;

    fn sample_trade() -> AggTrade {
        AggTrade {
            event_type: "aggTrade".to_string(),
            event_time: 1,
            symbol: "BTCUSDT".to_string(),
            agg_trade_id: 1,
            price: "10".to_string(),
            quantity: "1".to_string(),
            first_trade_id: 1,
            last_trade_id: 1,
            trade_time: 1,
            is_buyer_maker: false,
        }
    }

    #[tokio::test]
    async fn batch_flushes_at_configured_size() {
        let dir = tempdir().unwrap();
        let (tx, rx) = channel(16);
        let mut writer = CsvWriter::new(rx, dir.path(), 2, 3600);

        for _ in 0..2 {
            tx.send(Record::AggTrade {
                symbol: "BTCUSDT".to_string(),
                stream: "btcusdt@aggTrade".to_string(),
                localtime: Utc::now(),
                event: sample_trade(),
            })
            .await
            .unwrap();
        }
        drop(tx);
        writer.run().await.unwrap();

        let expected = dir.path().join("BTCUSDT").join(format!(
            "aggtrade_BTCUSDT_{}.csv",
            Utc::now().format("%Y%m%d")
        ));
        let contents = std::fs::read_to_string(expected).unwrap();
        assert_eq!(contents.lines().count(), 3, "header + 2 data rows");
        assert!(contents.lines().next().unwrap().starts_with("localtime,stream,"));
    }

    #[tokio::test]
    async fn reopening_an_existing_file_does_not_duplicate_the_header() {
        let dir = tempdir().unwrap();
        {
            let (tx, rx) = channel(16);
            let mut writer = CsvWriter::new(rx, dir.path(), 1, 3600);
            tx.send(Record::AggTrade {
                symbol: "BTCUSDT".to_string(),
                stream: "btcusdt@aggTrade".to_string(),
                localtime: Utc::now(),
                event: sample_trade(),
            })
            .await
            .unwrap();
            drop(tx);
            writer.run().await.unwrap();
        }
        {
            let (tx, rx) = channel(16);
            let mut writer = CsvWriter::new(rx, dir.path(), 1, 3600);
            tx.send(Record::AggTrade {
                symbol: "BTCUSDT".to_string(),
                stream: "btcusdt@aggTrade".to_string(),
                localtime: Utc::now(),
                event: sample_trade(),
            })
            .await
            .unwrap();
            drop(tx);
            writer.run().await.unwrap();
        }

        let expected = dir.path().join("BTCUSDT").join(format!(
            "aggtrade_BTCUSDT_{}.csv",
            Utc::now().format("%Y%m%d")
        ));
        let contents = std::fs::read_to_string(expected).unwrap();
        assert_eq!(contents.lines().count(), 3, "one header, two data rows across two writer instances");
    }

    #[tokio::test]
    async fn snapshot_kind_overwrites_instead_of_appending() {
        let dir = tempdir().unwrap();
        let (tx, rx) = channel(16);
        let mut writer = CsvWriter::new(rx, dir.path(), 100, 3600);

        let first = DepthSnapshot {
            last_update_id: 1,
            bids: vec![WireLevel("10".into(), "1".into())],
            asks: vec![WireLevel("11".into(), "1".into())],
            localtime: Utc::now(),
        };
        let second = DepthSnapshot {
            last_update_id: 2,
            bids: vec![WireLevel("10".into(), "1".into()), WireLevel("9".into(), "2".into())],
            asks: vec![WireLevel("11".into(), "1".into())],
            localtime: Utc::now(),
        };
        tx.send(Record::Snapshot { symbol: "BTCUSDT".to_string(), localtime: first.localtime, event: first })
            .await
            .unwrap();
        tx.send(Record::Snapshot { symbol: "BTCUSDT".to_string(), localtime: second.localtime, event: second })
            .await
            .unwrap();
        drop(tx);
        writer.run().await.unwrap();

        let expected = dir.path().join("BTCUSDT").join(format!(
            "BTCUSDT_depth_snapshot_{}.csv",
            Utc::now().format("%Y%m%d")
        ));
        let contents = std::fs::read_to_string(expected).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4, "header + 2 bids + 1 ask from the second snapshot only");
        assert_eq!(lines[0], "rank,type,price,quantity,localtime,lastUpdateId");
    }

    #[test]
    fn levels_json_encoding_round_trips_through_serde() {
        let levels = vec![
            crate::model::WireLevel("10".into(), "1".into()),
            crate::model::WireLevel("11".into(), "2".into()),
        ];
        let field = levels_to_json(&levels);
        let back: Vec<crate::model::WireLevel> = serde_json::from_str(&field).unwrap();
        assert_eq!(back, levels);
    }
}
