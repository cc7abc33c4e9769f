// =============================================================================
// Prompt assembly — language-aware system + user prompts
// =============================================================================

use crate::market_data::{format_market_data_block, SymbolMarketData};
use crate::position::Position;
use crate::strategy_config::{PromptLanguage, StrategyConfig};

/// Everything the Decision Pipeline needs to assemble one cycle's prompt
/// pair, gathered by the Engine before calling `MakeDecision`.
pub struct PromptContext<'a> {
    pub cycle_index: u64,
    pub account_equity: f64,
    pub available_balance: f64,
    pub trading_stats_summary: Option<&'a str>,
    pub open_positions: &'a [Position],
    pub recent_closed_summary: &'a str,
    pub candidate_symbols: &'a [String],
    pub market_data: &'a [SymbolMarketData],
    pub max_positions: u32,
}

/// Build the system prompt: base trading instructions plus the strategy's
/// custom prompt addendum, if any.
pub fn build_system_prompt(strategy: &StrategyConfig) -> String {
    let base = match strategy.ai.language {
        PromptLanguage::English => {
            "You are a disciplined futures trading analyst. Respond only with \
             a <reasoning> block followed by a <decision> block containing a \
             JSON array of trade decisions. Never include markdown outside \
             the fenced JSON block inside <decision>."
        }
        PromptLanguage::Chinese => {
            "你是一名严谨的期货交易分析师。只输出一个<reasoning>块，随后紧跟一个\
             <decision>块，内容为交易决策的JSON数组。除<decision>内的JSON代码块外，\
             不要包含任何其他markdown。"
        }
    };

    match &strategy.custom_prompt {
        Some(custom) if !custom.is_empty() => format!("{base}\n\n{custom}"),
        _ => base.to_string(),
    }
}

/// Build the user prompt: a deterministic markdown serialization of the
/// cycle's context.
pub fn build_user_prompt(ctx: &PromptContext, language: PromptLanguage) -> String {
    let now = chrono::Utc::now().to_rfc3339();
    let mut out = String::new();

    match language {
        PromptLanguage::English => {
            out.push_str(&format!("## Cycle {}\n", ctx.cycle_index));
            out.push_str(&format!("- Current time: {now}\n"));
            out.push_str(&format!(
                "- Account equity: {:.2} (available {:.2})\n",
                ctx.account_equity, ctx.available_balance
            ));
            if let Some(stats) = ctx.trading_stats_summary {
                out.push_str(&format!("- Trading stats: {stats}\n"));
            }
            out.push_str(&format!("- Max positions: {}\n\n", ctx.max_positions));

            out.push_str("### Open Positions\n");
            if ctx.open_positions.is_empty() {
                out.push_str("(none)\n");
            } else {
                for p in ctx.open_positions {
                    out.push_str(&format!(
                        "- {} {} entry={:.4} qty={:.6} lev={:.0}x peakPnL%={:.2}\n",
                        p.symbol, p.side, p.entry_price, p.quantity, p.leverage, p.peak_raw_pnl_pct
                    ));
                }
            }

            out.push_str("\n### Recent Closed Trades\n");
            out.push_str(ctx.recent_closed_summary);

            out.push_str("\n\n### Candidate Symbols\n");
            out.push_str(&ctx.candidate_symbols.join(", "));

            out.push_str("\n\n### Market Data\n");
            for md in ctx.market_data {
                out.push_str(&format_market_data_block(md));
            }
        }
        PromptLanguage::Chinese => {
            out.push_str(&format!("## 第 {} 轮\n", ctx.cycle_index));
            out.push_str(&format!("- 当前时间: {now}\n"));
            out.push_str(&format!(
                "- 账户权益: {:.2}（可用 {:.2}）\n",
                ctx.account_equity, ctx.available_balance
            ));
            if let Some(stats) = ctx.trading_stats_summary {
                out.push_str(&format!("- 交易统计: {stats}\n"));
            }
            out.push_str(&format!("- 最大持仓数: {}\n\n", ctx.max_positions));

            out.push_str("### 当前持仓\n");
            if ctx.open_positions.is_empty() {
                out.push_str("(无)\n");
            } else {
                for p in ctx.open_positions {
                    out.push_str(&format!(
                        "- {} {} 开仓价={:.4} 数量={:.6} 杠杆={:.0}x 峰值盈亏%={:.2}\n",
                        p.symbol, p.side, p.entry_price, p.quantity, p.leverage, p.peak_raw_pnl_pct
                    ));
                }
            }

            out.push_str("\n### 近期平仓记录\n");
            out.push_str(ctx.recent_closed_summary);

            out.push_str("\n\n### 候选币种\n");
            out.push_str(&ctx.candidate_symbols.join(", "));

            out.push_str("\n\n### 市场数据\n");
            for md in ctx.market_data {
                out.push_str(&format_market_data_block(md));
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy_config::StrategyConfig;

    #[test]
    fn system_prompt_appends_custom_prompt() {
        let mut cfg = StrategyConfig::default();
        cfg.custom_prompt = Some("Favor mean-reversion setups.".to_string());
        let prompt = build_system_prompt(&cfg);
        assert!(prompt.contains("Favor mean-reversion setups."));
    }

    #[test]
    fn user_prompt_lists_open_positions() {
        let pos = Position::open(
            uuid::Uuid::new_v4(),
            "BTCUSDT",
            crate::types::Side::Long,
            50000.0,
            0.1,
            10.0,
            500.0,
            45000.0,
        );
        let ctx = PromptContext {
            cycle_index: 1,
            account_equity: 1000.0,
            available_balance: 800.0,
            trading_stats_summary: None,
            open_positions: std::slice::from_ref(&pos),
            recent_closed_summary: "(none)",
            candidate_symbols: &["BTCUSDT".to_string()],
            market_data: &[],
            max_positions: 5,
        };
        let prompt = build_user_prompt(&ctx, PromptLanguage::English);
        assert!(prompt.contains("BTCUSDT"));
        assert!(prompt.contains("Open Positions"));
    }
}
