use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use exchange_trait::{MarketReader, MarketSnapshot, TimeframeSeries};
use futures_util::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_INFO_URL: &str = "https://api.hyperliquid.xyz/info";

/// Candle intervals the info endpoint accepts, in minutes.
const SUPPORTED_INTERVALS: [(u32, &str); 11] = [
    (1, "1m"),
    (3, "3m"),
    (5, "5m"),
    (15, "15m"),
    (30, "30m"),
    (60, "1h"),
    (120, "2h"),
    (240, "4h"),
    (480, "8h"),
    (720, "12h"),
    (1440, "1d"),
];

/// Exchange symbol (`BTCUSDT`, `ETH-PERP`) to the coin name used by the endpoint.
pub fn coin_for(symbol: &str) -> String {
    let upper = symbol.trim().to_uppercase();
    let base = upper.strip_suffix("-PERP").unwrap_or(&upper);
    let base = base
        .strip_suffix("USDT")
        .or_else(|| base.strip_suffix("USDC"))
        .or_else(|| base.strip_suffix("USD"))
        .unwrap_or(base);
    base.to_string()
}

/// Largest supported interval not longer than `minutes`.
pub fn interval_label(minutes: u32) -> &'static str {
    SUPPORTED_INTERVALS
        .iter()
        .rev()
        .find(|(m, _)| *m <= minutes)
        .map_or("1m", |(_, label)| *label)
}

fn interval_minutes(label: &str) -> Option<u32> {
    SUPPORTED_INTERVALS
        .iter()
        .find(|(_, l)| *l == label)
        .map(|(m, _)| *m)
}

#[derive(Debug, Clone, Deserialize)]
struct RawCandle {
    /// Open time, epoch ms
    t: i64,
    c: String,
}

#[derive(Debug, Clone, Default)]
pub struct AssetContext {
    pub mark_price: Option<f64>,
    pub funding_rate: Option<f64>,
    pub open_interest: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Universe {
    universe: Vec<UniverseAsset>,
}

#[derive(Debug, Deserialize)]
struct UniverseAsset {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawAssetContext {
    #[serde(default)]
    funding: Option<String>,
    #[serde(default, rename = "openInterest")]
    open_interest: Option<String>,
    #[serde(default, rename = "markPx")]
    mark_px: Option<String>,
}

fn parse_num(value: Option<&String>) -> Option<f64> {
    value.and_then(|v| v.parse::<f64>().ok()).filter(|v| v.is_finite())
}

/// Close prices, oldest first.
fn parse_candles(body: &str) -> Result<Vec<f64>> {
    let mut candles: Vec<RawCandle> =
        serde_json::from_str(body).context("Failed to decode candle snapshot")?;
    candles.sort_by_key(|c| c.t);
    candles
        .iter()
        .map(|c| {
            c.c.parse::<f64>()
                .with_context(|| format!("Bad close price {:?}", c.c))
        })
        .collect()
}

/// Pick one coin out of a `metaAndAssetCtxs` reply (universe and contexts are index-aligned).
fn parse_asset_context(body: &str, coin: &str) -> Result<AssetContext> {
    let (meta, contexts): (Universe, Vec<RawAssetContext>) =
        serde_json::from_str(body).context("Failed to decode asset contexts")?;
    let index = meta
        .universe
        .iter()
        .position(|a| a.name.eq_ignore_ascii_case(coin))
        .ok_or_else(|| anyhow!("{} is not listed", coin))?;
    let ctx = contexts
        .get(index)
        .ok_or_else(|| anyhow!("No asset context for {}", coin))?;
    Ok(AssetContext {
        mark_price: parse_num(ctx.mark_px.as_ref()),
        funding_rate: parse_num(ctx.funding.as_ref()),
        open_interest: parse_num(ctx.open_interest.as_ref()),
    })
}

/// Public perpetuals info endpoint reader. No credentials required.
#[derive(Clone)]
pub struct HyperliquidReader {
    client: Client,
    info_url: String,
    /// Extra timeframes fetched alongside the scan interval
    timeframes: Vec<&'static str>,
    candle_count: i64,
}

impl HyperliquidReader {
    pub fn new(info_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            info_url: info_url.into(),
            timeframes: vec!["1h", "4h"],
            candle_count: 30,
        })
    }

    #[must_use]
    pub fn with_timeframes(mut self, timeframes: Vec<&'static str>) -> Self {
        self.timeframes = timeframes;
        self
    }

    /// POST to the info endpoint, waiting out 429s.
    async fn post_info(&self, body: serde_json::Value) -> Result<String> {
        for attempt in 1..=3u32 {
            let response = self
                .client
                .post(&self.info_url)
                .json(&body)
                .send()
                .await
                .context("Info request failed")?;

            let status = response.status();
            if status.as_u16() == 429 {
                let wait_secs = 2 * u64::from(attempt);
                tracing::warn!("Market data rate limited, waiting {}s before retry {}/3", wait_secs, attempt);
                tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                continue;
            }
            if !status.is_success() {
                bail!(
                    "HTTP {}: {}",
                    status,
                    response.text().await.unwrap_or_default()
                );
            }
            return response.text().await.context("Failed to read info response");
        }
        bail!("Rate limited by market data endpoint after 3 retries")
    }

    pub async fn closes(&self, coin: &str, interval: &str) -> Result<Vec<f64>> {
        let minutes = i64::from(interval_minutes(interval).unwrap_or(60));
        let end = Utc::now();
        let start = end - ChronoDuration::minutes(minutes * self.candle_count);
        let body = self
            .post_info(json!({
                "type": "candleSnapshot",
                "req": {
                    "coin": coin,
                    "interval": interval,
                    "startTime": start.timestamp_millis(),
                    "endTime": end.timestamp_millis(),
                }
            }))
            .await?;
        parse_candles(&body)
    }

    pub async fn asset_context(&self, coin: &str) -> Result<AssetContext> {
        let body = self.post_info(json!({ "type": "metaAndAssetCtxs" })).await?;
        parse_asset_context(&body, coin)
    }
}

#[async_trait]
impl MarketReader for HyperliquidReader {
    async fn get(&self, symbol: &str, interval_minutes: u32) -> Result<MarketSnapshot> {
        let coin = coin_for(symbol);
        let mut labels = vec![interval_label(interval_minutes)];
        for tf in &self.timeframes {
            if !labels.contains(tf) {
                labels.push(*tf);
            }
        }

        let series = join_all(labels.iter().map(|label| self.closes(&coin, label))).await;
        let mut timeframes = Vec::with_capacity(labels.len());
        for (label, closes) in labels.iter().zip(series) {
            match closes {
                Ok(closes) if !closes.is_empty() => timeframes.push(TimeframeSeries {
                    label: (*label).to_string(),
                    closes,
                }),
                Ok(_) => tracing::debug!("No {} candles for {}", label, symbol),
                Err(e) => tracing::warn!("{} candles for {} unavailable: {:#}", label, symbol, e),
            }
        }

        let ctx = match self.asset_context(&coin).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!("Funding/OI for {} unavailable: {:#}", symbol, e);
                AssetContext::default()
            }
        };

        let last_close = timeframes
            .first()
            .and_then(|tf| tf.closes.last().copied());
        let current_price = ctx
            .mark_price
            .or(last_close)
            .ok_or_else(|| anyhow!("No price available for {}", symbol))?;

        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            current_price,
            open_interest: ctx.open_interest,
            funding_rate: ctx.funding_rate,
            timeframes,
            fetched_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coin_for_strips_quote() {
        assert_eq!(coin_for("BTCUSDT"), "BTC");
        assert_eq!(coin_for("ethusdc"), "ETH");
        assert_eq!(coin_for("SOL-PERP"), "SOL");
        assert_eq!(coin_for("DOGE"), "DOGE");
    }

    #[test]
    fn test_interval_label_rounds_down() {
        assert_eq!(interval_label(3), "3m");
        assert_eq!(interval_label(4), "3m");
        assert_eq!(interval_label(90), "1h");
        assert_eq!(interval_label(0), "1m");
        assert_eq!(interval_label(10_000), "1d");
    }

    #[test]
    fn test_parse_candles_sorted_by_open_time() {
        let body = r#"[
            {"t": 2000, "T": 2999, "s": "BTC", "i": "1h", "o": "101", "c": "102.5", "h": "103", "l": "100", "v": "10", "n": 5},
            {"t": 1000, "T": 1999, "s": "BTC", "i": "1h", "o": "100", "c": "101", "h": "102", "l": "99", "v": "8", "n": 4}
        ]"#;
        assert_eq!(parse_candles(body).unwrap(), vec![101.0, 102.5]);
    }

    #[test]
    fn test_parse_asset_context_by_index() {
        let body = r#"[
            {"universe": [{"name": "BTC", "szDecimals": 5}, {"name": "ETH", "szDecimals": 4}]},
            [
                {"funding": "0.0000125", "openInterest": "25000.5", "markPx": "65000.0"},
                {"funding": "-0.00002", "openInterest": "410000", "markPx": "3100.5"}
            ]
        ]"#;
        let ctx = parse_asset_context(body, "ETH").unwrap();
        assert_eq!(ctx.mark_price, Some(3100.5));
        assert_eq!(ctx.funding_rate, Some(-0.00002));
        assert_eq!(ctx.open_interest, Some(410_000.0));

        assert!(parse_asset_context(body, "DOGE").is_err());
    }
}
