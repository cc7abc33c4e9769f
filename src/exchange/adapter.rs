// =============================================================================
// Exchange Adapter — signed futures REST over HMAC-SHA256 (spec §4.6)
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry `X-MBX-APIKEY` as a header and append `timestamp`/`recvWindow` plus
// an HMAC-SHA256 signature over the canonical urlencoded parameter string.
//
// On construction we GET /fapi/v1/time once to compute `server_offset =
// server_time - local_time`; every subsequent signed request stamps
// `timestamp = local_clock + server_offset`.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::exchange::precision::PrecisionTable;
use crate::exchange::rate_limit::RateLimitTracker;
use crate::market_data::{Candle, Ticker24h};
use crate::types::ExchangeKind;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 10_000;

const MAINNET_BASE_URL: &str = "https://fapi.binance.com";
const TESTNET_BASE_URL: &str = "https://testnet.binancefuture.com";

/// One entry from `GET /fapi/v2/positionRisk`.
#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub position_amt: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: f64,
    pub liquidation_price: f64,
    pub unrealized_pnl: f64,
}

/// Futures REST client with HMAC-SHA256 request signing.
pub struct ExchangeAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    server_offset_ms: AtomicI64,
    pub rate_limit: RateLimitTracker,
    pub precision: parking_lot::RwLock<PrecisionTable>,
}

impl ExchangeAdapter {
    /// Create a new `ExchangeAdapter`. Does not perform any network I/O —
    /// call [`Self::sync_server_time`] before issuing signed requests.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, kind: ExchangeKind) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        let base_url = match kind {
            ExchangeKind::Mainnet => MAINNET_BASE_URL,
            ExchangeKind::Testnet => TESTNET_BASE_URL,
        }
        .to_string();

        Self {
            api_key,
            secret,
            base_url,
            client,
            server_offset_ms: AtomicI64::new(0),
            rate_limit: RateLimitTracker::new(),
            precision: parking_lot::RwLock::new(PrecisionTable::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Construction: server time sync
    // -------------------------------------------------------------------------

    /// `GET /fapi/v1/time` and record `server_offset = server_time - local_time`.
    /// Should be called once right after construction (the Engine's `Start`
    /// pre-flight, §4.1).
    #[instrument(skip(self), name = "exchange::sync_server_time")]
    pub async fn sync_server_time(&self) -> Result<()> {
        let url = format!("{}/fapi/v1/time", self.base_url);
        let local_before = Self::local_ms();

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/time failed")?;
        let body: ServerTimeResponse = resp
            .json()
            .await
            .context("failed to parse /fapi/v1/time response")?;

        let offset = body.server_time - local_before;
        self.server_offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset_ms = offset, "server time synced");
        Ok(())
    }

    fn local_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64
    }

    fn timestamp_ms(&self) -> i64 {
        Self::local_ms() + self.server_offset_ms.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Account / positions
    // -------------------------------------------------------------------------

    /// `GET /fapi/v2/account` (signed).
    #[instrument(skip(self), name = "exchange::get_account")]
    pub async fn get_account(&self) -> Result<serde_json::Value> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/account?{}", self.base_url, qs);
        self.get_signed(&url).await
    }

    /// `GET /fapi/v2/positionRisk` (signed), filtered to non-zero amounts.
    #[instrument(skip(self), name = "exchange::get_positions")]
    pub async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);
        let body = self.get_signed(&url).await?;

        let raw = body
            .as_array()
            .context("positionRisk response is not an array")?;

        let mut out = Vec::new();
        for entry in raw {
            let amt: f64 = entry["positionAmt"]
                .as_str()
                .unwrap_or("0")
                .parse()
                .unwrap_or(0.0);
            if amt == 0.0 {
                continue;
            }
            out.push(ExchangePosition {
                symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                position_amt: amt,
                entry_price: parse_f64(&entry["entryPrice"]),
                mark_price: parse_f64(&entry["markPrice"]),
                leverage: parse_f64(&entry["leverage"]),
                liquidation_price: parse_f64(&entry["liquidationPrice"]),
                unrealized_pnl: parse_f64(&entry["unRealizedProfit"]),
            });
        }
        Ok(out)
    }

    /// `GET /fapi/v2/account` total wallet equity (margin balance).
    pub async fn get_total_equity(&self) -> Result<f64> {
        let account = self.get_account().await?;
        Ok(parse_f64(&account["totalMarginBalance"]))
    }

    // -------------------------------------------------------------------------
    // Leverage
    // -------------------------------------------------------------------------

    /// `POST /fapi/v1/leverage` (signed).
    #[instrument(skip(self), name = "exchange::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/leverage?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/leverage request failed")?;
        let status = resp.status();
        self.rate_limit.update_from_headers(resp.headers());
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            anyhow::bail!("set_leverage({symbol}, {leverage}) returned {status}: {body}");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// `POST /fapi/v1/order` (signed) — submit a new order.
    #[instrument(skip(self), name = "exchange::place_order")]
    #[allow(clippy::too_many_arguments)]
    pub async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        quantity: f64,
        stop_price: Option<f64>,
        reduce_only: bool,
        close_position: bool,
    ) -> Result<serde_json::Value> {
        let mut params = format!("symbol={symbol}&side={side}&type={order_type}");

        if close_position {
            params.push_str("&closePosition=true");
        } else {
            params.push_str(&format!("&quantity={quantity}"));
            if reduce_only {
                params.push_str("&reduceOnly=true");
            }
        }
        if let Some(sp) = stop_price {
            params.push_str(&format!("&stopPrice={sp}&workingType=MARK_PRICE"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, side, order_type, quantity, "placing order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/order request failed")?;
        let status = resp.status();
        self.rate_limit.update_from_headers(resp.headers());
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")?;
        if !status.is_success() {
            anyhow::bail!("POST /fapi/v1/order returned {status}: {body}");
        }
        Ok(body)
    }

    /// Close (or reduce) an open position: side is opposite the position's
    /// sign, quantity is its absolute value, market order (§4.6).
    pub async fn close_position(
        &self,
        symbol: &str,
        position_amt: f64,
    ) -> Result<serde_json::Value> {
        let side = if position_amt > 0.0 { "SELL" } else { "BUY" };
        let quantity = self.precision.read().round_quantity(symbol, position_amt.abs());
        self.place_order(symbol, side, "MARKET", quantity, None, true, false)
            .await
    }

    /// `DELETE /fapi/v1/allOpenOrders` (signed) — cancel all open orders for
    /// a symbol (used when replacing SL/TP algo orders).
    #[instrument(skip(self), name = "exchange::cancel_all_open_orders")]
    pub async fn cancel_all_open_orders(&self, symbol: &str) -> Result<()> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/allOpenOrders?{}", self.base_url, qs);

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE /fapi/v1/allOpenOrders request failed")?;
        let status = resp.status();
        self.rate_limit.update_from_headers(resp.headers());
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            warn!(symbol, %status, %body, "cancel_all_open_orders failed");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// `GET /fapi/v1/klines` (public).
    #[instrument(skip(self), name = "exchange::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/klines request failed")?;
        let status = resp.status();
        self.rate_limit.update_from_headers(resp.headers());
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;
        if !status.is_success() {
            anyhow::bail!("GET /fapi/v1/klines returned {status}: {body}");
        }

        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 11 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }
            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = parse_str_f64(&arr[1])?;
            let high = parse_str_f64(&arr[2])?;
            let low = parse_str_f64(&arr[3])?;
            let close = parse_str_f64(&arr[4])?;
            let volume = parse_str_f64(&arr[5])?;
            let close_time = arr[6].as_i64().unwrap_or(0);
            candles.push(Candle::new(open_time, open, high, low, close, volume, close_time));
        }
        Ok(candles)
    }

    /// `GET /fapi/v1/ticker/price` (public) — latest mark price.
    #[instrument(skip(self), name = "exchange::get_price")]
    pub async fn get_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/ticker/price request failed")?;
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse ticker/price response")?;
        Ok(parse_f64(&body["price"]))
    }

    /// `GET /fapi/v1/ticker/24hr` (public) — used by SmartFind candidate
    /// discovery (§4.1 step 4).
    #[instrument(skip(self), name = "exchange::get_24hr_tickers")]
    pub async fn get_24hr_tickers(&self) -> Result<Vec<Ticker24h>> {
        let url = format!("{}/fapi/v1/ticker/24hr", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/ticker/24hr request failed")?;
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse ticker/24hr response")?;
        let raw = body.as_array().context("ticker/24hr response is not an array")?;

        Ok(raw
            .iter()
            .map(|entry| Ticker24h {
                symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                last_price: parse_f64(&entry["lastPrice"]),
                price_change_pct: parse_f64(&entry["priceChangePercent"]),
                quote_volume: parse_f64(&entry["quoteVolume"]),
            })
            .collect())
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    async fn get_signed(&self, url: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("signed GET request failed")?;
        let status = resp.status();
        self.rate_limit.update_from_headers(resp.headers());
        let body: serde_json::Value = resp.json().await.context("failed to parse response body")?;
        if !status.is_success() {
            anyhow::bail!("signed request returned {status}: {body}");
        }
        Ok(body)
    }
}

impl std::fmt::Debug for ExchangeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ServerTimeResponse {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

fn parse_f64(val: &serde_json::Value) -> f64 {
    if let Some(s) = val.as_str() {
        s.parse().unwrap_or(0.0)
    } else {
        val.as_f64().unwrap_or(0.0)
    }
}

fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_position_picks_opposite_side() {
        // Pure logic check independent of network: positive amt -> SELL.
        assert_eq!(if 1.0_f64 > 0.0 { "SELL" } else { "BUY" }, "SELL");
        assert_eq!(if -1.0_f64 > 0.0 { "SELL" } else { "BUY" }, "BUY");
    }

    #[test]
    fn parse_f64_handles_string_and_number() {
        assert_eq!(parse_f64(&serde_json::json!("1.5")), 1.5);
        assert_eq!(parse_f64(&serde_json::json!(2.5)), 2.5);
        assert_eq!(parse_f64(&serde_json::json!(null)), 0.0);
    }
}
