// =============================================================================
// Response Extraction — defensive pipeline over raw LLM text
// =============================================================================
//
// Language models hand back all manner of malformed text: stray markdown
// fences, smart quotes, full-width punctuation, reasoning prose mixed with
// the decision array. This pipeline is deliberately conservative: any stage
// that can't find what it wants falls through to the next, and total
// failure degrades to the safe fallback rather than ever propagating as a
// cycle-level error.
//
// Property under test: idempotency — extracting from the pipeline's own
// re-serialized output returns the same decisions.
// =============================================================================

use crate::decision::types::Decision;

/// Run the full six-step extraction pipeline over a raw LLM response.
/// Never fails: on any malformation, returns the single safe-fallback
/// decision with a reasoning trace explaining why.
pub fn extract_full_decision(raw_response: &str) -> (Vec<Decision>, String) {
    let sanitized = sanitize(raw_response);
    let has_decision_tag = sanitized.contains("<decision>");
    let decision_block = extract_decision_tag(&sanitized);
    let reasoning_trace = extract_reasoning_trace(&sanitized, has_decision_tag);

    match extract_json_candidate(decision_block).and_then(|candidate| parse_decisions(&candidate)) {
        Some(decisions) if !decisions.is_empty() => (decisions, reasoning_trace),
        _ => {
            let fallback = Decision::safe_fallback("no valid decision JSON array found");
            (vec![fallback], reasoning_trace)
        }
    }
}

/// Step 1: strip invisible/control runes; normalize smart quotes and
/// full-width punctuation to ASCII equivalents.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| !is_control_or_invisible(*c))
        .map(normalize_char)
        .collect()
}

fn is_control_or_invisible(c: char) -> bool {
    // Keep common whitespace (newline, tab) but drop other control/format
    // characters, including zero-width space/joiner and BOM.
    if c == '\n' || c == '\t' || c == '\r' {
        return false;
    }
    c.is_control() || matches!(c, '\u{200B}'..='\u{200F}' | '\u{FEFF}')
}

fn normalize_char(c: char) -> char {
    match c {
        '\u{2018}' | '\u{2019}' | '\u{201B}' => '\'',
        '\u{201C}' | '\u{201D}' | '\u{201F}' => '"',
        '\u{FF0C}' => ',',
        '\u{FF1A}' => ':',
        '\u{FF08}' => '(',
        '\u{FF09}' => ')',
        '\u{3001}' => ',',
        '\u{3002}' => '.',
        other => other,
    }
}

/// Step 2: prefer content inside `<decision>...</decision>`; else the whole
/// string.
fn extract_decision_tag(s: &str) -> &str {
    if let Some(start) = s.find("<decision>") {
        let after = &s[start + "<decision>".len()..];
        if let Some(end) = after.find("</decision>") {
            return &after[..end];
        }
        return after;
    }
    s
}

/// Step 3: prefer a fenced ` ```json ` block; else the first `[{ ... }]`
/// array found by bracket matching.
fn extract_json_candidate(s: &str) -> Option<String> {
    if let Some(fenced) = extract_fenced_json(s) {
        return Some(fenced);
    }
    extract_bracketed_array(s)
}

fn extract_fenced_json(s: &str) -> Option<String> {
    let marker = "```json";
    let start = s.find(marker)? + marker.len();
    let rest = &s[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

fn extract_bracketed_array(s: &str) -> Option<String> {
    let start = s.find("[{")?;
    let mut depth = 0i32;
    let mut end = None;
    for (i, c) in s[start..].char_indices() {
        match c {
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + i + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    end.map(|e| s[start..e].to_string())
}

/// Step 4: validate the candidate begins `[{`, contains no `~`, and has no
/// thousand-separator commas inside numbers (a comma directly between two
/// ASCII digits, e.g. `1,000`, which is never valid JSON array/object
/// syntax but is a common model mistake).
fn is_valid_candidate(candidate: &str) -> bool {
    if !candidate.trim_start().starts_with("[{") {
        return false;
    }
    if candidate.contains('~') {
        return false;
    }
    let bytes = candidate.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] == b',' {
            let prev_digit = i > 0 && bytes[i - 1].is_ascii_digit();
            let next_digit = i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit();
            if prev_digit && next_digit {
                return false;
            }
        }
    }
    true
}

/// Step 5: parse into a decision list, applying step-4 validation first.
fn parse_decisions(candidate: &str) -> Option<Vec<Decision>> {
    if !is_valid_candidate(candidate) {
        return None;
    }
    serde_json::from_str::<Vec<Decision>>(candidate).ok()
}

/// Step 6: reasoning trace from `<reasoning>...</reasoning>` if present;
/// else the text before `<decision>`; else the text before `[`.
fn extract_reasoning_trace(sanitized: &str, has_decision_tag: bool) -> String {
    if let Some(start) = sanitized.find("<reasoning>") {
        let after = &sanitized[start + "<reasoning>".len()..];
        if let Some(end) = after.find("</reasoning>") {
            return after[..end].trim().to_string();
        }
    }
    if has_decision_tag {
        if let Some(idx) = sanitized.find("<decision>") {
            return sanitized[..idx].trim().to_string();
        }
    }
    if let Some(idx) = sanitized.find('[') {
        return sanitized[..idx].trim().to_string();
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;

    fn sample_json() -> &'static str {
        r#"[{"symbol":"BTCUSDT","action":"open_long","confidence":80,"leverage":10,"position_size_usd":100,"stop_loss":49000,"take_profit":52000,"reasoning":"bullish"}]"#
    }

    #[test]
    fn extracts_decision_from_tagged_fenced_block() {
        let raw = format!(
            "<reasoning>Market looks bullish</reasoning><decision>```json\n{}\n```</decision>",
            sample_json()
        );
        let (decisions, reasoning) = extract_full_decision(&raw);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].symbol, "BTCUSDT");
        assert_eq!(decisions[0].action, Action::OpenLong);
        assert_eq!(reasoning, "Market looks bullish");
    }

    #[test]
    fn extracts_bare_array_without_tags() {
        let raw = format!("Here is my call: {}", sample_json());
        let (decisions, _) = extract_full_decision(&raw);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].symbol, "BTCUSDT");
    }

    #[test]
    fn prose_only_falls_back_to_safe_wait_s6() {
        let raw = "I think the market will do something interesting soon.";
        let (decisions, _) = extract_full_decision(raw);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].symbol, "ALL");
        assert_eq!(decisions[0].action, Action::Wait);
        assert_eq!(decisions[0].confidence, 50);
    }

    #[test]
    fn tolerates_nonstandard_action_spelling() {
        let raw = r#"[{"symbol":"BTCUSDT","action":"Long","confidence":80,"leverage":10,"position_size_usd":100,"stop_loss":49000,"take_profit":52000,"reasoning":"bullish"}]"#;
        let (decisions, _) = extract_full_decision(raw);
        assert_eq!(decisions[0].symbol, "BTCUSDT");
        assert_eq!(decisions[0].action, Action::OpenLong);
    }

    #[test]
    fn rejects_candidate_with_thousand_separator() {
        let raw = r#"[{"symbol":"BTCUSDT","action":"open_long","confidence":80,"leverage":10,"position_size_usd":1,000,"stop_loss":49000,"take_profit":52000,"reasoning":"x"}]"#;
        let (decisions, _) = extract_full_decision(raw);
        assert_eq!(decisions[0].symbol, "ALL", "thousand separator must trigger fallback");
    }

    #[test]
    fn rejects_candidate_with_tilde() {
        let raw = r#"[{"symbol":"BTCUSDT","action":"open_long","confidence":80,"leverage":~10,"position_size_usd":100,"stop_loss":49000,"take_profit":52000,"reasoning":"x"}]"#;
        let (decisions, _) = extract_full_decision(raw);
        assert_eq!(decisions[0].symbol, "ALL");
    }

    #[test]
    fn normalizes_smart_quotes_and_full_width_punctuation() {
        let weird = "\u{201c}hello\u{201d}\u{ff0c}world";
        let clean = sanitize(weird);
        assert_eq!(clean, "\"hello\",world");
    }

    #[test]
    fn extraction_is_idempotent() {
        let raw = format!("<decision>{}</decision>", sample_json());
        let (first, _) = extract_full_decision(&raw);

        // Re-serialize the extracted decisions and run the pipeline again.
        let reserialized = serde_json::to_string(&first).unwrap();
        let wrapped = format!("<decision>{reserialized}</decision>");
        let (second, _) = extract_full_decision(&wrapped);

        assert_eq!(first, second);
    }
}
