// =============================================================================
// Strategy & StrategyConfig — the deeply-nested config record (spec §3, §4.1)
// =============================================================================
//
// A Strategy's Config is shared-immutable by value during a cycle: an Engine
// clones its in-memory `Arc<StrategyConfig>` pointer at the top of every
// cycle (hot reload, §4.1) rather than observing a mutable object another
// task might be editing concurrently.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Where a trader's tradable symbol universe comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CoinSource {
    /// A fixed, operator-curated symbol list.
    Static { symbols: Vec<String> },
    /// Refreshed periodically from SmartFind 24h-ticker ranking (§4.1 step 4).
    DynamicTopVolume { symbols: Vec<String> },
}

impl CoinSource {
    pub fn symbols(&self) -> &[String] {
        match self {
            Self::Static { symbols } | Self::DynamicTopVolume { symbols } => symbols,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::DynamicTopVolume { .. })
    }
}

/// Indicator computation settings (spec §2 row A, §4.1 step 5).
///
/// Field names here are load-bearing: `market_data::fetch_symbol_market_data`
/// and `market_data::compute_indicators` read them directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorsConfig {
    pub timeframe: String,
    pub kline_count: u32,
    pub ema_fast_period: usize,
    pub ema_slow_period: usize,
    pub rsi_period: usize,
    pub macd_fast_period: usize,
    pub macd_slow_period: usize,
    pub macd_signal_period: usize,
    pub atr_period: usize,
    pub multi_tf_confirmation: bool,
    pub higher_timeframe: String,
}

impl Default for IndicatorsConfig {
    fn default() -> Self {
        Self {
            timeframe: "15m".to_string(),
            kline_count: 100,
            ema_fast_period: 9,
            ema_slow_period: 21,
            rsi_period: 14,
            macd_fast_period: 12,
            macd_slow_period: 26,
            macd_signal_period: 9,
            atr_period: 14,
            multi_tf_confirmation: false,
            higher_timeframe: "1h".to_string(),
        }
    }
}

/// Risk control thresholds (spec §4.1 step 6, §4.3). Two distinct layers:
/// account-level circuit breakers (daily loss, consecutive losses, drawdown,
/// trade count, emergency shutdown) and per-position overrides (trailing
/// stop, drawdown close, smart loss cut, max hold, noise zone, anti-hedge).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskControlConfig {
    // --- Account-level circuit breaker ---
    pub emergency_shutdown_enabled: bool,
    pub emergency_min_balance: f64,
    pub max_daily_loss_pct: f64,
    pub stop_trading_mins: u32,
    pub close_positions_on_daily_loss: bool,
    pub max_consecutive_losses: u32,
    pub max_drawdown_pct: f64,
    pub max_daily_trades: u32,

    // --- Per-position overrides ---
    pub trailing_stop_enabled: bool,
    pub trailing_stop_activate_pct: f64,
    pub trailing_stop_distance_pct: f64,

    pub drawdown_close_enabled: bool,
    pub min_profit_for_drawdown: f64,
    pub drawdown_close_threshold_pct: f64,

    pub smart_loss_cut_enabled: bool,
    pub smart_loss_cut_mins: u32,
    pub smart_loss_cut_pct: f64,

    pub max_hold_duration_mins: u32,

    pub noise_zone_lower_bound: f64,
    pub noise_zone_upper_bound: f64,
    pub high_confidence_close_threshold: f64,

    // --- Validator (§4.3) ---
    pub min_risk_reward: f64,
    pub max_positions: u32,
}

impl Default for RiskControlConfig {
    fn default() -> Self {
        Self {
            emergency_shutdown_enabled: true,
            emergency_min_balance: 50.0,
            max_daily_loss_pct: 5.0,
            stop_trading_mins: 60,
            close_positions_on_daily_loss: false,
            max_consecutive_losses: 3,
            max_drawdown_pct: 20.0,
            max_daily_trades: 20,

            trailing_stop_enabled: true,
            trailing_stop_activate_pct: 1.0,
            trailing_stop_distance_pct: 0.5,

            drawdown_close_enabled: true,
            min_profit_for_drawdown: 2.0,
            drawdown_close_threshold_pct: 30.0,

            smart_loss_cut_enabled: true,
            smart_loss_cut_mins: 60,
            smart_loss_cut_pct: -3.0,

            max_hold_duration_mins: 720,

            noise_zone_lower_bound: -0.5,
            noise_zone_upper_bound: 0.5,
            high_confidence_close_threshold: 80.0,

            min_risk_reward: 1.5,
            max_positions: 5,
        }
    }
}

/// AI/LLM behavior toggles (spec §3 Strategy.Config.AI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub reasoning_enabled: bool,
    pub reasoning_model: String,
    pub decision_model: String,
    pub language: PromptLanguage,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            reasoning_enabled: true,
            reasoning_model: "default-reasoning".to_string(),
            decision_model: "default-decision".to_string(),
            language: PromptLanguage::English,
        }
    }
}

/// Prompt assembly language (spec §4.2 "language-aware" prompts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptLanguage {
    English,
    Chinese,
}

/// SmartFind auto-refresh settings (spec §4.1 step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartFindConfig {
    pub auto_refresh_enabled: bool,
    pub refresh_mins: u32,
    pub aggressive: bool,
}

impl Default for SmartFindConfig {
    fn default() -> Self {
        Self {
            auto_refresh_enabled: false,
            refresh_mins: 60,
            aggressive: false,
        }
    }
}

/// The deeply-nested Strategy configuration record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub coin_source: CoinSource,
    pub indicators: IndicatorsConfig,
    pub risk: RiskControlConfig,
    pub ai: AiConfig,
    pub custom_prompt: Option<String>,
    pub trading_interval_minutes: u32,
    pub turbo_mode: bool,
    pub simple_mode: bool,
    pub smart_find: SmartFindConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            coin_source: CoinSource::Static {
                symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            },
            indicators: IndicatorsConfig::default(),
            risk: RiskControlConfig::default(),
            ai: AiConfig::default(),
            custom_prompt: None,
            trading_interval_minutes: 15,
            turbo_mode: false,
            simple_mode: false,
            smart_find: SmartFindConfig::default(),
        }
    }
}

/// A persisted Strategy: id, name, active flag, and its config (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: uuid::Uuid,
    pub name: String,
    pub active: bool,
    pub config: StrategyConfig,
}

impl Strategy {
    pub fn new(name: impl Into<String>, config: StrategyConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            name: name.into(),
            active: true,
            config,
        }
    }

    /// Returns `true` for BTC/ETH symbols, which carry looser leverage and
    /// position-size floors in the validator (§4.3).
    pub fn is_major_symbol(symbol: &str) -> bool {
        symbol.starts_with("BTC") || symbol.starts_with("ETH")
    }

    pub fn max_leverage_for(symbol: &str) -> f64 {
        if Self::is_major_symbol(symbol) {
            20.0
        } else {
            10.0
        }
    }

    pub fn min_position_size_for(symbol: &str) -> f64 {
        if Self::is_major_symbol(symbol) {
            60.0
        } else {
            12.0
        }
    }

    pub fn max_position_size_fraction_for(symbol: &str) -> f64 {
        if Self::is_major_symbol(symbol) {
            0.3
        } else {
            0.15
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_risk_bounds() {
        let cfg = StrategyConfig::default();
        assert!(cfg.risk.max_daily_loss_pct > 0.0);
        assert!(cfg.risk.trailing_stop_activate_pct > 0.0);
    }

    #[test]
    fn coin_source_exposes_symbols_for_either_variant() {
        let cs = CoinSource::Static {
            symbols: vec!["BTCUSDT".to_string()],
        };
        assert_eq!(cs.symbols(), &["BTCUSDT".to_string()]);
        assert!(!cs.is_dynamic());
    }

    #[test]
    fn major_symbol_thresholds_match_validator_rules() {
        assert_eq!(Strategy::max_leverage_for("BTCUSDT"), 20.0);
        assert_eq!(Strategy::max_leverage_for("DOGEUSDT"), 10.0);
        assert_eq!(Strategy::min_position_size_for("ETHUSDT"), 60.0);
        assert_eq!(Strategy::min_position_size_for("SOLUSDT"), 12.0);
    }
}
