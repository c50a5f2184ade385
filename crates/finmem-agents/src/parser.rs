use std::collections::BTreeMap;

use finmem_models::{MemoryIndex, RunMode, Tier, TradeAction};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::assembler::CitationTable;
use crate::error::AgentError;

/// A decision response that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDecision {
    /// `None` in warmup mode, where the action comes from the realised move.
    pub action: Option<TradeAction>,
    pub rationale: String,
    pub citations: BTreeMap<Tier, Vec<MemoryIndex>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictTestResponse {
    investment_decision: TradeAction,
    summary_reason: String,
    #[serde(default)]
    short_memory_ids: Vec<MemoryIndex>,
    #[serde(default)]
    mid_memory_ids: Vec<MemoryIndex>,
    #[serde(default)]
    long_memory_ids: Vec<MemoryIndex>,
    #[serde(default)]
    reflection_memory_ids: Vec<MemoryIndex>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictWarmupResponse {
    summary_reason: String,
    #[serde(default)]
    short_memory_ids: Vec<MemoryIndex>,
    #[serde(default)]
    mid_memory_ids: Vec<MemoryIndex>,
    #[serde(default)]
    long_memory_ids: Vec<MemoryIndex>,
}

/// Extract the first JSON object from a string that may contain surrounding text.
///
/// Handles common model response formats:
/// - Clean JSON: `{"key": "value"}`
/// - Markdown-wrapped: ```json\n{"key": "value"}\n```
/// - Prefix text: `Here is my decision:\n{"key": "value"}`
pub fn extract_json(text: &str) -> Result<String, AgentError> {
    let trimmed = text.trim();

    if trimmed.starts_with('{') && serde_json::from_str::<Value>(trimmed).is_ok() {
        return Ok(trimmed.to_string());
    }

    if let Some(json_str) = extract_from_markdown_block(trimmed) {
        if serde_json::from_str::<Value>(&json_str).is_ok() {
            return Ok(json_str);
        }
    }

    if let Some(json_str) = extract_first_object(trimmed) {
        if serde_json::from_str::<Value>(&json_str).is_ok() {
            return Ok(json_str);
        }
    }

    Err(AgentError::Parse(format!(
        "No valid JSON object found in response (length={})",
        text.len()
    )))
}

/// Extract JSON from a markdown code block (```json ... ``` or ``` ... ```)
fn extract_from_markdown_block(text: &str) -> Option<String> {
    let start_markers = ["```json\n", "```json\r\n", "```\n", "```\r\n"];

    for marker in &start_markers {
        if let Some(start) = text.find(marker) {
            let json_start = start + marker.len();
            if let Some(end) = text[json_start..].find("```") {
                let extracted = text[json_start..json_start + end].trim();
                return Some(extracted.to_string());
            }
        }
    }

    None
}

/// Find the first balanced { ... } in the text.
fn extract_first_object(text: &str) -> Option<String> {
    let mut depth = 0;
    let mut start = None;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if in_string => {
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
            }
            '{' if !in_string => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            // Prose can hold a stray closing brace before the object opens.
            '}' if !in_string && depth == 0 => {}
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        return Some(text[s..=i].to_string());
                    }
                }
            }
            _ => {}
        }
    }

    None
}

/// Parse a response that must already be exactly the expected object.
pub fn parse_strict(
    raw: &str,
    mode: RunMode,
    offered: &CitationTable,
) -> Result<ParsedDecision, AgentError> {
    let parsed = match mode {
        RunMode::Test => {
            let r: StrictTestResponse = serde_json::from_str(raw.trim())
                .map_err(|e| AgentError::Parse(format!("strict decision parse: {e}")))?;
            ParsedDecision {
                action: Some(r.investment_decision),
                rationale: r.summary_reason,
                citations: citation_map([
                    (Tier::Short, r.short_memory_ids),
                    (Tier::Mid, r.mid_memory_ids),
                    (Tier::Long, r.long_memory_ids),
                    (Tier::Reflection, r.reflection_memory_ids),
                ]),
            }
        }
        RunMode::Warmup => {
            let r: StrictWarmupResponse = serde_json::from_str(raw.trim())
                .map_err(|e| AgentError::Parse(format!("strict warmup parse: {e}")))?;
            ParsedDecision {
                action: None,
                rationale: r.summary_reason,
                citations: citation_map([
                    (Tier::Short, r.short_memory_ids),
                    (Tier::Mid, r.mid_memory_ids),
                    (Tier::Long, r.long_memory_ids),
                ]),
            }
        }
    };

    if parsed.rationale.trim().is_empty() {
        return Err(AgentError::Parse("summary_reason is empty".to_string()));
    }
    for (tier, indices) in &parsed.citations {
        let mut seen = Vec::with_capacity(indices.len());
        for index in indices {
            if !offered.is_offered(*tier, *index) {
                return Err(AgentError::Parse(format!(
                    "{} cites {index}, which was not offered",
                    tier.citation_field()
                )));
            }
            if seen.contains(index) {
                return Err(AgentError::Parse(format!(
                    "{} cites {index} twice",
                    tier.citation_field()
                )));
            }
            seen.push(*index);
        }
    }
    Ok(parsed)
}

fn citation_map<const N: usize>(
    fields: [(Tier, Vec<MemoryIndex>); N],
) -> BTreeMap<Tier, Vec<MemoryIndex>> {
    fields
        .into_iter()
        .filter(|(_, ids)| !ids.is_empty())
        .collect()
}

/// Best-effort structural repair of a response that failed strict parsing.
///
/// Pulls the first JSON object out of surrounding prose, maps near-miss
/// field names onto the expected ones, normalises the action, accepts ids
/// as numbers, numeric strings or `{"memory_index": n}` objects, and drops
/// duplicate or never-offered ids. Fails when the action (test mode) or the
/// rationale cannot be recovered.
pub fn repair(
    raw: &str,
    mode: RunMode,
    offered: &CitationTable,
) -> Result<ParsedDecision, AgentError> {
    let json_str = extract_json(raw)?;
    let value: Value = serde_json::from_str(&json_str)?;
    let Value::Object(object) = value else {
        return Err(AgentError::Parse("response is not a JSON object".to_string()));
    };
    let fields = canonical_fields(object);

    let rationale = fields
        .get("summary_reason")
        .and_then(text_of)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AgentError::Parse("no usable summary_reason".to_string()))?;

    let action = match mode {
        RunMode::Warmup => None,
        RunMode::Test => {
            let raw_action = fields
                .get("investment_decision")
                .and_then(text_of)
                .ok_or_else(|| AgentError::Parse("no investment_decision".to_string()))?;
            Some(parse_action(&raw_action)?)
        }
    };

    let tiers: &[Tier] = match mode {
        RunMode::Warmup => &Tier::LADDER,
        RunMode::Test => &Tier::ALL,
    };
    let mut citations = BTreeMap::new();
    for tier in tiers {
        let Some(value) = fields.get(tier.citation_field()) else {
            continue;
        };
        let mut indices: Vec<MemoryIndex> = Vec::new();
        for index in index_values(value) {
            if !offered.is_offered(*tier, index) {
                debug!(%tier, index, "Dropping citation that was never offered");
                continue;
            }
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        if !indices.is_empty() {
            citations.insert(*tier, indices);
        }
    }

    Ok(ParsedDecision {
        action,
        rationale,
        citations,
    })
}

/// Map response keys onto canonical field names. Exact names win over
/// aliases; unrecognised keys are dropped.
fn canonical_fields(object: Map<String, Value>) -> BTreeMap<&'static str, Value> {
    let mut exact = BTreeMap::new();
    let mut aliased = BTreeMap::new();
    for (key, value) in object {
        let normalized = key.trim().to_lowercase().replace(&['-', ' '][..], "_");
        let Some(canonical) = canonical_name(&normalized) else {
            debug!(field = %key, "Dropping unrecognised response field");
            continue;
        };
        if normalized == canonical {
            exact.insert(canonical, value);
        } else {
            aliased.entry(canonical).or_insert(value);
        }
    }
    for (name, value) in aliased {
        exact.entry(name).or_insert(value);
    }
    exact
}

fn canonical_name(key: &str) -> Option<&'static str> {
    match key {
        "summary_reason" | "summary" | "reason" | "reasoning" | "rationale"
        | "trade_reason" | "explanation" => return Some("summary_reason"),
        "investment_decision" | "decision" | "action" => return Some("investment_decision"),
        _ => {}
    }
    Tier::ALL.into_iter().find_map(|tier| {
        let prefix = tier.as_str();
        let is_id_field = key.starts_with(prefix)
            && (key.contains("id") || key.contains("memor") || key.contains("index"));
        is_id_field.then(|| tier.citation_field())
    })
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        _ => None,
    }
}

fn parse_action(raw: &str) -> Result<TradeAction, AgentError> {
    match raw.trim().to_lowercase().as_str() {
        "buy" => Ok(TradeAction::Buy),
        "sell" => Ok(TradeAction::Sell),
        "hold" => Ok(TradeAction::Hold),
        other => Err(AgentError::Parse(format!("unknown investment_decision {other:?}"))),
    }
}

/// Indices from an id field, accepting a single value or a list of numbers,
/// numeric strings or `{"memory_index": n}` objects.
fn index_values(value: &Value) -> Vec<MemoryIndex> {
    match value {
        Value::Array(items) => items.iter().filter_map(index_value).collect(),
        other => index_value(other).into_iter().collect(),
    }
}

fn index_value(value: &Value) -> Option<MemoryIndex> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => map.get("memory_index").and_then(index_value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finmem_models::MemoryId;

    fn offered() -> CitationTable {
        let mut table = CitationTable::new();
        table.push(Tier::Short, MemoryId(10)); // 0
        table.push(Tier::Short, MemoryId(11)); // 1
        table.push(Tier::Mid, MemoryId(4)); // 2
        table.push(Tier::Reflection, MemoryId(1)); // 3
        table
    }

    #[test]
    fn extract_clean_json() {
        let input = r#"{"summary_reason": "test"}"#;
        assert_eq!(extract_json(input).unwrap(), input);
    }

    #[test]
    fn extract_from_markdown() {
        let input = "Here is my decision:\n```json\n{\"investment_decision\": \"buy\"}\n```\nDone.";
        assert_eq!(
            extract_json(input).unwrap(),
            r#"{"investment_decision": "buy"}"#
        );
    }

    #[test]
    fn extract_with_escaped_braces_in_strings() {
        let input = r#"{"summary_reason": "price went from {low} to {high}", "x": 1}"#;
        let result = extract_json(input).unwrap();
        let parsed: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(parsed["x"], 1);
    }

    #[test]
    fn extract_no_json() {
        assert!(extract_json("plain text").is_err());
    }

    #[test]
    fn extract_skips_stray_closing_brace_in_prose() {
        let input = "Note: ignore the } above.\n{\"investment_decision\": \"buy\", \"summary_reason\": \"x\"}";
        let parsed = repair(input, RunMode::Test, &offered()).unwrap();
        assert_eq!(parsed.action, Some(TradeAction::Buy));
        assert_eq!(parsed.rationale, "x");

        let nested = "}} {\"a\": {\"b\": 1}} trailing }";
        assert_eq!(extract_json(nested).unwrap(), r#"{"a": {"b": 1}}"#);
    }

    #[test]
    fn strict_accepts_exact_shape() {
        let raw = r#"{
            "investment_decision": "buy",
            "summary_reason": "Deliveries beat and momentum is positive.",
            "short_memory_ids": [0, 1],
            "reflection_memory_ids": [3]
        }"#;
        let parsed = parse_strict(raw, RunMode::Test, &offered()).unwrap();
        assert_eq!(parsed.action, Some(TradeAction::Buy));
        assert_eq!(parsed.citations[&Tier::Short], vec![0, 1]);
        assert_eq!(parsed.citations[&Tier::Reflection], vec![3]);
        assert!(!parsed.citations.contains_key(&Tier::Mid));
    }

    #[test]
    fn strict_rejects_unknown_fields_and_foreign_ids() {
        let extra = r#"{"investment_decision": "hold", "summary_reason": "x", "confidence": 0.4}"#;
        assert!(parse_strict(extra, RunMode::Test, &offered()).is_err());

        // Index 2 belongs to the mid tier.
        let foreign = r#"{"investment_decision": "hold", "summary_reason": "x", "short_memory_ids": [2]}"#;
        assert!(parse_strict(foreign, RunMode::Test, &offered()).is_err());

        let empty = r#"{"investment_decision": "hold", "summary_reason": "  "}"#;
        assert!(parse_strict(empty, RunMode::Test, &offered()).is_err());

        let upper = r#"{"investment_decision": "BUY", "summary_reason": "x"}"#;
        assert!(parse_strict(upper, RunMode::Test, &offered()).is_err());
    }

    #[test]
    fn strict_warmup_has_no_action() {
        let raw = r#"{"summary_reason": "Price rose on earnings.", "mid_memory_ids": [2]}"#;
        let parsed = parse_strict(raw, RunMode::Warmup, &offered()).unwrap();
        assert_eq!(parsed.action, None);
        assert_eq!(parsed.citations[&Tier::Mid], vec![2]);

        let with_action = r#"{"investment_decision": "buy", "summary_reason": "x"}"#;
        assert!(parse_strict(with_action, RunMode::Warmup, &offered()).is_err());
    }

    #[test]
    fn repair_maps_aliases_and_normalizes() {
        let raw = "Sure! Here you go:\n```json\n{\n  \"Decision\": \" BUY \",\n  \"summary\": \"Strong quarter\",\n  \"short_ids\": [\"1\", {\"memory_index\": 0}, 1, 9],\n  \"mid_memory_ids\": 2,\n  \"confidence\": 0.8\n}\n```";
        let parsed = repair(raw, RunMode::Test, &offered()).unwrap();
        assert_eq!(parsed.action, Some(TradeAction::Buy));
        assert_eq!(parsed.rationale, "Strong quarter");
        assert_eq!(parsed.citations[&Tier::Short], vec![1, 0]);
        assert_eq!(parsed.citations[&Tier::Mid], vec![2]);
    }

    #[test]
    fn repair_prefers_exact_field_over_alias() {
        let raw = r#"{"summary_reason": "exact", "reason": "alias", "investment_decision": "sell"}"#;
        let parsed = repair(raw, RunMode::Test, &offered()).unwrap();
        assert_eq!(parsed.rationale, "exact");
        assert_eq!(parsed.action, Some(TradeAction::Sell));
    }

    #[test]
    fn repair_fails_without_action_or_rationale() {
        let no_action = r#"{"summary_reason": "x"}"#;
        assert!(repair(no_action, RunMode::Test, &offered()).is_err());

        let bad_action = r#"{"summary_reason": "x", "decision": "strong buy"}"#;
        assert!(repair(bad_action, RunMode::Test, &offered()).is_err());

        let no_reason = r#"{"investment_decision": "hold"}"#;
        assert!(repair(no_reason, RunMode::Test, &offered()).is_err());

        assert!(repair("no json here", RunMode::Test, &offered()).is_err());
    }

    #[test]
    fn repair_warmup_accepts_trade_reason() {
        let raw = r#"{"trade_reason": "Earnings beat drove the move", "short_memory_ids": [0], "reflection_memory_ids": [3]}"#;
        let parsed = repair(raw, RunMode::Warmup, &offered()).unwrap();
        assert_eq!(parsed.action, None);
        assert_eq!(parsed.citations[&Tier::Short], vec![0]);
        assert!(!parsed.citations.contains_key(&Tier::Reflection));
    }
}
