//! Conversion between in-memory collections and their stored JSON layout.
//!
//! Decoding is lenient: malformed entries are skipped one by one so a single
//! bad record never costs the rest of a collection.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::types::{AllowEntry, ScoreEntry, ScoreMode, TabId, Timestamp};

pub fn decode_blocked(value: &Value) -> Vec<String> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect()
}

pub fn encode_blocked(blocked: &BTreeSet<String>) -> Value {
    json!(blocked.iter().collect::<Vec<_>>())
}

/// Allow entries still live at `now`.
pub fn decode_allows(value: &Value, now: Timestamp) -> Vec<(String, Timestamp)> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| serde_json::from_value::<AllowEntry>(item.clone()).ok())
        .filter(|entry| entry.expires_at > now)
        .map(|entry| (entry.url, entry.expires_at))
        .collect()
}

pub fn encode_allows(allowed: &BTreeMap<String, Timestamp>) -> Value {
    let entries: Vec<AllowEntry> = allowed
        .iter()
        .map(|(url, expires_at)| AllowEntry {
            url: url.clone(),
            expires_at: *expires_at,
        })
        .collect();
    json!(entries)
}

fn as_score(value: &Value) -> Option<u8> {
    let n = value.as_f64()?;
    if !(0.0..=100.0).contains(&n) {
        return None;
    }
    Some(n.round() as u8)
}

/// Score cache entries. Entries written before scores were mode-qualified
/// (`{url, score}`) load as demo scores.
pub fn decode_scores(value: &Value) -> Vec<(String, u8)> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let score = as_score(item.get("score")?)?;
            if let Some(key) = item.get("key").and_then(Value::as_str) {
                return Some((key.to_string(), score));
            }
            let url = item.get("url").and_then(Value::as_str)?;
            Some((ScoreMode::Demo.cache_key(url), score))
        })
        .collect()
}

pub fn encode_scores(scores: &BTreeMap<String, u8>) -> Value {
    let entries: Vec<ScoreEntry> = scores
        .iter()
        .map(|(key, score)| ScoreEntry {
            key: key.clone(),
            score: *score,
        })
        .collect();
    json!(entries)
}

/// Per-tab session map stored as `{ "<tabId>": entry }`.
pub fn decode_tab_map<T: DeserializeOwned>(value: &Value) -> Vec<(TabId, T)> {
    let Some(map) = value.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(key, entry)| {
            let tab_id = key.parse::<TabId>().ok()?;
            match serde_json::from_value::<T>(entry.clone()) {
                Ok(decoded) => Some((tab_id, decoded)),
                Err(e) => {
                    debug!("Skipping stored entry for tab {}: {}", tab_id, e);
                    None
                }
            }
        })
        .collect()
}

pub fn encode_tab_map<T: Serialize>(entries: &BTreeMap<TabId, T>) -> Value {
    let mut map = Map::new();
    for (tab_id, entry) in entries {
        if let Ok(value) = serde_json::to_value(entry) {
            map.insert(tab_id.to_string(), value);
        }
    }
    Value::Object(map)
}
