//! REST snapshot client (C4): one-shot depth snapshot fetch, no retained
//! state between calls (§4.1).
//!
//! Grounded on the teacher's `reqwest::Client` usage in
//! `collector::polymarket_orderbook_history` (shared client, JSON decode,
//! mapped error), adapted to Binance's `/fapi/v1/depth` contract.

use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::{IngestError, Result};
use crate::model::DepthSnapshot;

/// Fetches depth snapshots over REST. Holds only a shared HTTP client and
/// host/timeout config; carries no per-symbol state.
#[derive(Clone)]
pub struct SnapshotClient {
    http: reqwest::Client,
    rest_host: String,
}

impl SnapshotClient {
    pub fn new(network: &NetworkConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(network.timeout))
            .build()?;
        Ok(Self {
            http,
            rest_host: network.rest_host.clone(),
        })
    }

    /// Fetch a depth snapshot for `symbol` (uppercase), limit fixed at 1000
    /// levels per side per the exchange contract (§3).
    pub async fn fetch(&self, symbol: &str) -> Result<DepthSnapshot> {
        let url = format!(
            "https://{}/fapi/v1/depth?symbol={}&limit=1000",
            self.rest_host, symbol
        );

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(IngestError::SnapshotFetch(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let mut snapshot: DepthSnapshot = response.json().await?;
        snapshot.localtime = chrono::Utc::now();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_expected_url_shape() {
        let host = "fapi.binance.com";
        let symbol = "BTCUSDT";
        let url = format!("https://{}/fapi/v1/depth?symbol={}&limit=1000", host, symbol);
        assert_eq!(url, "https://fapi.binance.com/fapi/v1/depth?symbol=BTCUSDT&limit=1000");
    }

    #[tokio::test]
    async fn client_construction_respects_timeout_config() {
        let network = NetworkConfig {
            timeout: 5,
            ws_host: "fstream.binance.com".to_string(),
            rest_host: "fapi.binance.com".to_string(),
        };
        let client = SnapshotClient::new(&network);
        assert!(client.is_ok());
    }
}
