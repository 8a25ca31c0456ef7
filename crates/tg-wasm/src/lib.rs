//! WebAssembly bindings for ThreatGuard
//!
//! Exposes the synchronous pieces of the engine to the extension's service
//! worker, so URL keys, rule ids and rule JSON are computed by the same code
//! the native engine uses.

use wasm_bindgen::prelude::*;

use tg_core::rules::assemble_rule_set;
use tg_core::types::{AnalysisStats, RulePurpose};
use tg_core::url;

#[wasm_bindgen]
pub fn normalize_url(url: &str) -> String {
    url::normalize_url(url)
}

/// Rule id for `purpose` ("block" or "allow") and an already normalized URL.
#[wasm_bindgen]
pub fn rule_id(purpose: &str, normalized_url: &str) -> Result<u32, JsValue> {
    Ok(tg_core::hash::rule_id(parse_purpose(purpose)?, normalized_url))
}

/// Full dynamic rule set for the given blocked and allowed URL arrays, as a
/// JS array in declarative rule shape.
#[wasm_bindgen]
pub fn build_rules(blocked: JsValue, allowed: JsValue) -> Result<JsValue, JsValue> {
    let blocked = string_array(&blocked, "blocked")?;
    let allowed = string_array(&allowed, "allowed")?;

    let set = assemble_rule_set(
        blocked.iter().map(String::as_str),
        allowed.iter().map(String::as_str),
    );
    if set.collisions > 0 {
        web_sys::console::warn_1(&JsValue::from_str(&format!(
            "ThreatGuard: {} rule id collision(s) resolved",
            set.collisions
        )));
    }

    let json = serde_json::to_string(&set.rules)
        .map_err(|e| JsValue::from_str(&format!("Failed to serialize rules: {}", e)))?;
    js_sys::JSON::parse(&json)
}

/// Map a reputation report's `last_analysis_stats` object to a 0-100 score.
#[wasm_bindgen]
pub fn score_from_stats(stats: JsValue) -> u8 {
    let count = |name: &str| -> u64 {
        js_sys::Reflect::get(&stats, &name.into())
            .ok()
            .and_then(|value| value.as_f64())
            .filter(|n| n.is_finite() && *n > 0.0)
            .map(|n| n as u64)
            .unwrap_or(0)
    };
    AnalysisStats {
        malicious: count("malicious"),
        suspicious: count("suspicious"),
        harmless: count("harmless"),
        undetected: count("undetected"),
    }
    .threat_score()
}

#[wasm_bindgen]
pub fn build_warning_url(extension_base: &str, url: &str, score: u8) -> String {
    url::build_warning_url(extension_base, url, score)
}

#[wasm_bindgen]
pub fn is_restricted_url(url: &str) -> bool {
    url::is_restricted_url(url)
}

/// Whether a top-level navigation should be recorded for a decision.
#[wasm_bindgen]
pub fn should_intercept(url: &str, extension_base: &str) -> bool {
    url::should_intercept(url, extension_base)
}

fn parse_purpose(purpose: &str) -> Result<RulePurpose, JsValue> {
    match purpose {
        "block" => Ok(RulePurpose::Block),
        "allow" => Ok(RulePurpose::Allow),
        other => Err(JsValue::from_str(&format!("Unknown rule purpose '{}'", other))),
    }
}

fn string_array(value: &JsValue, name: &str) -> Result<Vec<String>, JsValue> {
    if value.is_undefined() || value.is_null() {
        return Ok(Vec::new());
    }
    if !js_sys::Array::is_array(value) {
        return Err(JsValue::from_str(&format!("{} must be an array", name)));
    }
    js_sys::Array::from(value)
        .iter()
        .map(|item| {
            item.as_string()
                .ok_or_else(|| JsValue::from_str(&format!("{} entries must be strings", name)))
        })
        .collect()
}
