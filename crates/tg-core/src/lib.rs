//! ThreatGuard Core Library
//!
//! This crate provides the navigation interception and policy engine for the
//! ThreatGuard browser extension. Every top-level navigation is routed
//! through a checking page, scored, and then allowed, warned or blocked by
//! installing declarative redirect rules.
//!
//! # Architecture
//!
//! The browser surfaces (storage, the declarative rule table, tab
//! navigation, the clock) are traits, so the engine runs the same against
//! the real extension APIs, the CLI's file-backed host and in-memory test
//! doubles. All policy state lives in one [`PolicyStore`]; the rule table is
//! always rebuilt from it with a single replace.
//!
//! # Modules
//!
//! - `url`: URL normalization, filters and the warning page URL
//! - `hash`: FNV-1a rule id derivation
//! - `rules`: Declarative rule construction with collision-free ids
//! - `types`: Shared type definitions
//! - `config`: Thresholds, TTLs and endpoints
//! - `storage`: Key-value persistence trait and in-memory store
//! - `table`: Dynamic rule table trait and in-memory table
//! - `ports`: Clock and tab navigation
//! - `score`: Threat score providers
//! - `store`: Policy state, persistence and rule sync
//! - `engine`: Per-navigation decisions and allow cleanup
//! - `watcher`: Navigation and rule-match listeners
//! - `message`: Request/response protocol for extension pages
//!
//! The pure modules (`url`, `hash`, `rules`, `types`, `config`) build without
//! the `engine` feature, which is how the wasm bindings use them.

pub mod config;
pub mod hash;
pub mod rules;
pub mod types;
pub mod url;

#[cfg(feature = "engine")]
pub mod engine;
#[cfg(feature = "engine")]
pub mod message;
#[cfg(feature = "engine")]
pub mod ports;
#[cfg(feature = "engine")]
pub mod score;
#[cfg(feature = "engine")]
pub mod storage;
#[cfg(feature = "engine")]
pub mod store;
#[cfg(feature = "engine")]
pub mod table;
#[cfg(feature = "engine")]
pub mod watcher;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use hash::rule_id;
pub use rules::{assemble_rule_set, build_rule_set, RuleSet};
pub use types::{Rule, RulePurpose, ScoreMode, TabId, Timestamp};
pub use url::normalize_url;

#[cfg(feature = "engine")]
pub use engine::{spawn_prune_task, DecisionEngine, EngineError, Verdict};
#[cfg(feature = "engine")]
pub use message::handle_message;
#[cfg(feature = "engine")]
pub use score::{ScoreProvider, ScoreProviders};
#[cfg(feature = "engine")]
pub use store::{PolicyStats, PolicyStore};
#[cfg(feature = "engine")]
pub use watcher::NavigationWatcher;
