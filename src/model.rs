//! Wire-format types for the upstream exchange feed (§3, §6).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single (price, quantity) level as received on the wire. Kept as the
/// original strings alongside parsed decimals so the CSV writer can persist
/// the exchange's textual precision unchanged (§4.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireLevel(pub String, pub String);

impl WireLevel {
    pub fn price(&self) -> Option<Decimal> {
        self.0.parse().ok()
    }

    pub fn qty(&self) -> Option<Decimal> {
        self.1.parse().ok()
    }
}

/// Depth diff event, external wire form (§3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DepthDiff {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "T", default)]
    pub transaction_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: i64,
    #[serde(rename = "u")]
    pub final_update_id: i64,
    #[serde(rename = "pu")]
    pub prev_final_update_id: i64,
    #[serde(rename = "b")]
    pub bids: Vec<WireLevel>,
    #[serde(rename = "a")]
    pub asks: Vec<WireLevel>,
}

/// Depth snapshot, external wire form (§3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: i64,
    pub bids: Vec<WireLevel>,
    pub asks: Vec<WireLevel>,
    /// Local receive time; not part of the wire payload, stamped on arrival.
    #[serde(skip)]
    pub localtime: DateTime<Utc>,
}

/// Aggregated trade event, external wire form.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggTrade {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "a")]
    pub agg_trade_id: i64,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "f")]
    pub first_trade_id: i64,
    #[serde(rename = "l")]
    pub last_trade_id: i64,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

/// Kline/candlestick frame, external wire form.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Kline {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub k: KlineBar,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KlineBar {
    #[serde(rename = "t")]
    pub start_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "n")]
    pub num_trades: i64,
    #[serde(rename = "x")]
    pub is_closed: bool,
    #[serde(rename = "q")]
    pub quote_volume: String,
    #[serde(rename = "V")]
    pub taker_buy_base_volume: String,
    #[serde(rename = "Q")]
    pub taker_buy_quote_volume: String,
}

/// Classification of a combined-stream frame by substream suffix (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    AggTrade,
    Depth,
    Kline,
}

impl StreamKind {
    /// Classify a stream name such as "btcusdt@depth@0ms" by substring match
    /// on the known substream tokens. Returns `None` for unrecognized streams
    /// (dropped per §4.1).
    pub fn classify(stream: &str) -> Option<Self> {
        if stream.contains("aggTrade") {
            Some(Self::AggTrade)
        } else if stream.contains("depth") {
            Some(Self::Depth)
        } else if stream.contains("kline") {
            Some(Self::Kline)
        } else {
            None
        }
    }
}

/// Normalize a symbol to upper case, the canonical in-memory form (§3).
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recognizes_known_tokens() {
        assert_eq!(
            StreamKind::classify("btcusdt@aggTrade"),
            Some(StreamKind::AggTrade)
        );
        assert_eq!(
            StreamKind::classify("btcusdt@depth@0ms"),
            Some(StreamKind::Depth)
        );
        assert_eq!(
            StreamKind::classify("btcusdt@kline_1m"),
            Some(StreamKind::Kline)
        );
        assert_eq!(StreamKind::classify("btcusdt@markPrice"), None);
    }

    #[test]
    fn wire_level_preserves_string_precision() {
        let lvl = WireLevel("10.00000".to_string(), "1.500".to_string());
        assert_eq!(lvl.price().unwrap().to_string(), "10.00000");
        assert_eq!(lvl.qty().unwrap().to_string(), "1.500");
    }

    #[test]
    fn normalize_symbol_upper_cases() {
        assert_eq!(normalize_symbol(" btcusdt "), "BTCUSDT");
    }
}
