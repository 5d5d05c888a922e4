//! Live bar feeds
//!
//! `BinanceFeed` polls USDⓈ-M futures klines. Public market data, no API key.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::{Candle, Symbol};

/// Maximum klines per request on the futures API
const MAX_KLINES_PER_REQUEST: usize = 1500;

/// Source of recent closed bars for one symbol, oldest first
#[async_trait]
pub trait BarFeed: Send + Sync {
    async fn fetch_bars(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Candle>>;
}

#[derive(Debug, Clone)]
pub struct BinanceFeed {
    client: Client,
    base_url: String,
    interval: String,
}

impl BinanceFeed {
    pub fn new(base_url: impl Into<String>, interval: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(BinanceFeed {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            interval: interval.into(),
        })
    }
}

#[async_trait]
impl BarFeed for BinanceFeed {
    async fn fetch_bars(&self, symbol: &Symbol, limit: usize) -> Result<Vec<Candle>> {
        let url = format!("{}/fapi/v1/klines", self.base_url);
        // one extra for the bar still forming
        let limit = (limit + 1).clamp(1, MAX_KLINES_PER_REQUEST);

        debug!("Fetching klines: symbol={}, interval={}, limit={}", symbol, self.interval, limit);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.as_str().to_string()),
                ("interval", self.interval.clone()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("Failed to fetch klines for {}", symbol))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error {}: {}", status, body);
        }

        let raw: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .context("Failed to parse Binance klines")?;

        Ok(parse_klines(&raw, Utc::now()))
    }
}

/// Convert raw kline rows to candles stamped with their open time. Rows that
/// do not parse are dropped, as is a trailing bar that has not closed by `now`.
pub fn parse_klines(raw: &[Vec<serde_json::Value>], now: DateTime<Utc>) -> Vec<Candle> {
    let now_ms = now.timestamp_millis();
    let mut candles: Vec<Candle> = Vec::with_capacity(raw.len());

    for row in raw {
        let Some((candle, close_time)) = parse_row(row) else {
            continue;
        };
        if close_time > now_ms {
            continue;
        }
        candles.push(candle);
    }

    candles.sort_by_key(|c| c.datetime);
    candles.dedup_by_key(|c| c.datetime);
    candles
}

fn parse_row(row: &[serde_json::Value]) -> Option<(Candle, i64)> {
    if row.len() < 7 {
        return None;
    }
    let num = |v: &serde_json::Value| -> Option<f64> {
        match v {
            serde_json::Value::String(s) => s.parse().ok(),
            other => other.as_f64(),
        }
    };

    let open_time = DateTime::from_timestamp_millis(row[0].as_i64()?)?;
    let candle = Candle::new_unchecked(
        open_time,
        num(&row[1])?,
        num(&row[2])?,
        num(&row[3])?,
        num(&row[4])?,
        num(&row[5])?,
    );
    Some((candle, row[6].as_i64()?))
}
