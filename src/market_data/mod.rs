// =============================================================================
// Market Data & Indicators
// =============================================================================
//
// Pulls candles and ticker data for a trader's configured symbols from the
// exchange adapter, computes EMA/RSI/MACD/ATR over them, and formats a
// human-readable snapshot that the Decision Pipeline embeds in its user
// prompt.
//
// Pull-based by design: one REST round trip per symbol per cycle, matching
// the Trader Engine's periodic cycle cadence rather than a continuously
// streaming microstructure feed.
// =============================================================================

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::exchange::adapter::ExchangeAdapter;
use crate::indicators::{atr, ema, macd, rsi};
use crate::strategy_config::IndicatorsConfig;

/// A single OHLCV candle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub quote_volume: f64,
    #[serde(default)]
    pub trades_count: u64,
    #[serde(default)]
    pub taker_buy_volume: f64,
    #[serde(default)]
    pub taker_buy_quote_volume: f64,
    #[serde(default = "default_true")]
    pub is_closed: bool,
}

fn default_true() -> bool {
    true
}

impl Candle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: i64,
    ) -> Self {
        Self {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: 0.0,
            trades_count: 0,
            taker_buy_volume: 0.0,
            taker_buy_quote_volume: 0.0,
            is_closed: true,
        }
    }
}

/// A 24-hour ticker summary, used by SmartFind symbol discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker24h {
    pub symbol: String,
    pub last_price: f64,
    pub price_change_pct: f64,
    pub quote_volume: f64,
}

/// Computed indicator values for one symbol at the time of the snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub rsi: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub atr: Option<f64>,
    pub atr_pct: Option<f64>,
}

/// Market data for one symbol: latest candles, indicators, and current price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMarketData {
    pub symbol: String,
    pub last_price: f64,
    pub indicators: IndicatorSet,
    /// Higher-timeframe indicators, present only when multi-TF confirmation
    /// is enabled in the strategy's `IndicatorsConfig`.
    pub htf_indicators: Option<IndicatorSet>,
}

/// Compute the configured indicator set from a candle history.
pub fn compute_indicators(candles: &[Candle], cfg: &IndicatorsConfig) -> IndicatorSet {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let ema_fast = ema::calculate_ema(&closes, cfg.ema_fast_period)
        .last()
        .copied();
    let ema_slow = ema::calculate_ema(&closes, cfg.ema_slow_period)
        .last()
        .copied();
    let rsi_val = rsi::calculate_rsi(&closes, cfg.rsi_period).last().copied();
    let macd_point = macd::calculate_macd(
        &closes,
        cfg.macd_fast_period,
        cfg.macd_slow_period,
        cfg.macd_signal_period,
    )
    .last()
    .copied();
    let atr_val = atr::calculate_atr(candles, cfg.atr_period);
    let atr_pct_val = atr::calculate_atr_pct(candles, cfg.atr_period);

    IndicatorSet {
        ema_fast,
        ema_slow,
        rsi: rsi_val,
        macd: macd_point.map(|p| p.macd),
        macd_signal: macd_point.map(|p| p.signal),
        macd_histogram: macd_point.map(|p| p.histogram),
        atr: atr_val,
        atr_pct: atr_pct_val,
    }
}

/// Fetch candles + ticker for one symbol and compute its `SymbolMarketData`,
/// including the higher-timeframe read when multi-TF confirmation is on.
pub async fn fetch_symbol_market_data(
    adapter: &ExchangeAdapter,
    symbol: &str,
    cfg: &IndicatorsConfig,
) -> Result<SymbolMarketData> {
    let candles = adapter
        .get_klines(symbol, &cfg.timeframe, cfg.kline_count)
        .await?;
    let last_price = candles.last().map(|c| c.close).unwrap_or(0.0);
    let indicators = compute_indicators(&candles, cfg);

    let htf_indicators = if cfg.multi_tf_confirmation {
        let htf_candles = adapter
            .get_klines(symbol, &cfg.higher_timeframe, cfg.kline_count)
            .await?;
        Some(compute_indicators(&htf_candles, cfg))
    } else {
        None
    };

    Ok(SymbolMarketData {
        symbol: symbol.to_string(),
        last_price,
        indicators,
        htf_indicators,
    })
}

/// Format a symbol's market data as a human-readable markdown block for the
/// Decision Pipeline's user prompt.
pub fn format_market_data_block(data: &SymbolMarketData) -> String {
    let ind = &data.indicators;
    let mut block = format!(
        "### {}\n- Price: {:.6}\n- EMA(fast): {}\n- EMA(slow): {}\n- RSI: {}\n- MACD: {} (signal {}, hist {})\n- ATR: {} ({}%)\n",
        data.symbol,
        data.last_price,
        fmt_opt(ind.ema_fast),
        fmt_opt(ind.ema_slow),
        fmt_opt(ind.rsi),
        fmt_opt(ind.macd),
        fmt_opt(ind.macd_signal),
        fmt_opt(ind.macd_histogram),
        fmt_opt(ind.atr),
        fmt_opt(ind.atr_pct),
    );

    if let Some(htf) = &data.htf_indicators {
        block.push_str(&format!(
            "- HTF EMA(fast/slow): {} / {}, HTF RSI: {}\n",
            fmt_opt(htf.ema_fast),
            fmt_opt(htf.ema_slow),
            fmt_opt(htf.rsi),
        ));
    }

    block
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(x) if x.is_finite() => format!("{x:.4}"),
        _ => "n/a".to_string(),
    }
}

/// Select dynamic-top-volume candidate symbols for SmartFind.
///
/// `aggressive` sorts by absolute 24h price change (Turbo-aggressive
/// variant); otherwise sorts by quote volume. Filters: symbol must end in
/// "USDT", quote-volume > 500k, not a known stablecoin, symbol length > 4.
pub fn select_smart_find_candidates(
    tickers: &[Ticker24h],
    aggressive: bool,
    limit: usize,
) -> Vec<String> {
    const STABLECOINS: &[&str] = &[
        "USDCUSDT", "BUSDUSDT", "TUSDUSDT", "FDUSDUSDT", "DAIUSDT", "USDPUSDT",
    ];

    let mut candidates: Vec<&Ticker24h> = tickers
        .iter()
        .filter(|t| t.symbol.ends_with("USDT"))
        .filter(|t| t.quote_volume > 500_000.0)
        .filter(|t| !STABLECOINS.contains(&t.symbol.as_str()))
        .filter(|t| t.symbol.len() > 4)
        .collect();

    if aggressive {
        candidates.sort_by(|a, b| {
            b.price_change_pct
                .abs()
                .partial_cmp(&a.price_change_pct.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    } else {
        candidates.sort_by(|a, b| {
            b.quote_volume
                .partial_cmp(&a.quote_volume)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    candidates
        .into_iter()
        .take(limit)
        .map(|t| t.symbol.clone())
        .collect()
}

/// Build the SmartFind LLM prompt (spec §4.1 step 4): the model is handed
/// the pre-filtered, pre-sorted candidate pool and asked to propose up to
/// `limit` (2×MaxPositions) symbols from it.
pub fn build_smart_find_prompt(candidates: &[String], limit: usize) -> String {
    format!(
        "Candidate futures symbols, pre-filtered and ranked by priority:\n{}\n\n\
         Propose up to {limit} of these symbols to trade this cycle, choosing the \
         ones with the strongest setup. Respond with only a JSON array of symbol \
         strings drawn from the candidate list above, e.g. [\"BTCUSDT\",\"ETHUSDT\"].",
        candidates.join(", "),
    )
}

/// Parse the model's SmartFind response into a final symbol list. Any
/// proposed symbol outside the vetted `candidates` pool is dropped rather
/// than trusted outright — the LLM proposes from, but never escapes, the
/// already-filtered set. Falls back to the top `limit` of `candidates` if
/// the response is unparseable or names nothing from the pool.
pub fn parse_smart_find_response(raw: &str, candidates: &[String], limit: usize) -> Vec<String> {
    let parsed = raw
        .find('[')
        .and_then(|start| raw[start..].find(']').map(|end| raw[start..start + end + 1].to_string()))
        .and_then(|slice| serde_json::from_str::<Vec<String>>(&slice).ok());

    let fallback = || candidates.iter().take(limit).cloned().collect::<Vec<_>>();

    match parsed {
        Some(proposed) if !proposed.is_empty() => {
            let allowed: std::collections::HashSet<&str> = candidates.iter().map(|s| s.as_str()).collect();
            let chosen: Vec<String> = proposed
                .into_iter()
                .filter(|s| allowed.contains(s.as_str()))
                .take(limit)
                .collect();
            if chosen.is_empty() {
                fallback()
            } else {
                chosen
            }
        }
        _ => fallback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(symbol: &str, change: f64, vol: f64) -> Ticker24h {
        Ticker24h {
            symbol: symbol.to_string(),
            last_price: 1.0,
            price_change_pct: change,
            quote_volume: vol,
        }
    }

    #[test]
    fn smart_find_filters_stablecoins_and_short_symbols() {
        let tickers = vec![
            ticker("USDCUSDT", 0.1, 10_000_000.0),
            ticker("BTCUSDT", 2.0, 10_000_000.0),
            ticker("XUSDT", 5.0, 10_000_000.0), // length 5, kept
            ticker("ETHUSDT", 1.0, 100_000.0),  // below volume floor
        ];
        let out = select_smart_find_candidates(&tickers, false, 10);
        assert!(out.contains(&"BTCUSDT".to_string()));
        assert!(!out.contains(&"USDCUSDT".to_string()));
        assert!(!out.contains(&"ETHUSDT".to_string()));
    }

    #[test]
    fn smart_find_aggressive_sorts_by_abs_change() {
        let tickers = vec![
            ticker("AUSDT", -9.0, 10_000_000.0),
            ticker("BUSDT2", 1.0, 10_000_000.0),
        ];
        let out = select_smart_find_candidates(&tickers, true, 2);
        assert_eq!(out[0], "AUSDT");
    }

    #[test]
    fn format_block_handles_missing_indicators() {
        let data = SymbolMarketData {
            symbol: "BTCUSDT".into(),
            last_price: 50000.0,
            indicators: IndicatorSet::default(),
            htf_indicators: None,
        };
        let block = format_market_data_block(&data);
        assert!(block.contains("BTCUSDT"));
        assert!(block.contains("n/a"));
    }

    #[test]
    fn smart_find_response_is_restricted_to_the_candidate_pool() {
        let pool = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "SOLUSDT".to_string()];
        let raw = "I like these: [\"ETHUSDT\",\"DOGEUSDT\",\"SOLUSDT\"]";
        let chosen = parse_smart_find_response(raw, &pool, 2);
        assert_eq!(chosen, vec!["ETHUSDT".to_string(), "SOLUSDT".to_string()], "DOGEUSDT is not in the pool and must be dropped");
    }

    #[test]
    fn smart_find_response_falls_back_to_pool_when_unparseable() {
        let pool = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let chosen = parse_smart_find_response("no json here", &pool, 5);
        assert_eq!(chosen, pool);
    }

    #[test]
    fn smart_find_prompt_includes_candidates_and_limit() {
        let pool = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let prompt = build_smart_find_prompt(&pool, 4);
        assert!(prompt.contains("BTCUSDT"));
        assert!(prompt.contains("ETHUSDT"));
        assert!(prompt.contains('4'));
    }
}
