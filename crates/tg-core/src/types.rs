//! Core type definitions for ThreatGuard
//!
//! Rule types serialize to the platform's declarative rule JSON shape and
//! the record types serialize to the layout kept in extension storage, so
//! the extension's JavaScript can read both without translation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Browser tab identifier.
pub type TabId = i32;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

// =============================================================================
// Score Mode
// =============================================================================

/// Which score provider is in effect.
///
/// The mode is part of every score cache key so switching providers never
/// reuses scores computed by the other one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreMode {
    /// Synthetic random scores
    #[default]
    Demo,
    /// Remote reputation lookup
    #[serde(alias = "gti")]
    Remote,
}

impl ScoreMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Demo => "demo",
            Self::Remote => "remote",
        }
    }

    /// Score cache key for a normalized URL under this mode.
    pub fn cache_key(&self, normalized_url: &str) -> String {
        format!("{}::{}", self.as_str(), normalized_url)
    }
}

impl fmt::Display for ScoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "demo" => Ok(Self::Demo),
            "remote" | "gti" => Ok(Self::Remote),
            other => Err(format!("unknown score mode '{}'", other)),
        }
    }
}

// =============================================================================
// Rules (declarative rule table entries)
// =============================================================================

/// Why a per-URL rule exists. Feeds the rule id hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RulePurpose {
    Block,
    Allow,
}

impl RulePurpose {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Allow => "allow",
        }
    }
}

/// Request types a rule condition applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MainFrame,
}

/// Redirect target inside the extension package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectTarget {
    pub extension_path: String,
}

/// Action taken when a rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleAction {
    /// Send the navigation to an extension page
    Redirect { redirect: RedirectTarget },
    /// Let the navigation through, overriding lower priority rules
    Allow,
}

/// Match condition of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    pub regex_filter: String,
    pub resource_types: Vec<ResourceType>,
}

/// One entry of the dynamic rule table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: u32,
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

impl Rule {
    pub fn is_redirect(&self) -> bool {
        matches!(self.action, RuleAction::Redirect { .. })
    }
}

// =============================================================================
// Per-tab Records (session storage)
// =============================================================================

/// Latest top-level navigation seen for a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingNavigation {
    /// Restored from the map key, not stored in the entry.
    #[serde(skip)]
    pub tab_id: TabId,
    pub url: String,
    #[serde(default)]
    pub timestamp: Timestamp,
}

/// What the interstitial shows for a tab that was sent to the block page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedInfo {
    /// Restored from the map key, not stored in the entry.
    #[serde(skip)]
    pub tab_id: TabId,
    pub url: String,
    pub score: u8,
    #[serde(default)]
    pub timestamp: Timestamp,
}

// =============================================================================
// Durable Records
// =============================================================================

/// Stored form of a time-limited allow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowEntry {
    pub url: String,
    pub expires_at: Timestamp,
}

/// Stored form of a score cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub key: String,
    pub score: u8,
}

/// Aggregate latency of remote score lookups.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTiming {
    #[serde(default)]
    pub total_ms: f64,
    #[serde(default)]
    pub count: u64,
}

impl RemoteTiming {
    pub fn record(&mut self, duration_ms: f64) {
        self.total_ms += duration_ms;
        self.count += 1;
    }

    /// Mean latency, or `None` before the first lookup.
    pub fn average_ms(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.total_ms / self.count as f64)
        }
    }
}

// =============================================================================
// Reputation Statistics
// =============================================================================

/// Engine verdict counts from a reputation lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalysisStats {
    #[serde(default)]
    pub malicious: u64,
    #[serde(default)]
    pub suspicious: u64,
    #[serde(default)]
    pub harmless: u64,
    #[serde(default)]
    pub undetected: u64,
}

impl AnalysisStats {
    /// Share of flagging engines as a 0-100 score. Zero when nothing ran.
    pub fn threat_score(&self) -> u8 {
        let flagged = self.malicious + self.suspicious;
        let total = flagged + self.harmless + self.undetected;
        if total == 0 {
            return 0;
        }
        let score = (flagged as f64 * 100.0 / total as f64).round();
        score.clamp(0.0, 100.0) as u8
    }
}
