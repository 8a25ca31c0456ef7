//! Navigation Watcher
//!
//! Listens to the two signals that announce a top-level navigation: the
//! browser's before-navigate event and the catch-all rule matching. Both
//! record the URL as the tab's pending navigation so the checking page can
//! ask for a decision on it.

use std::sync::Arc;

use log::debug;
use serde::Deserialize;

use crate::config::EngineConfig;
use crate::engine::DecisionEngine;
use crate::hash::CATCH_ALL_RULE_ID;
use crate::store::PolicyStore;
use crate::types::TabId;
use crate::url::{is_extension_url, is_restricted_url, normalize_url, should_intercept};

/// Top-level frame id.
pub const MAIN_FRAME_ID: i32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationEvent {
    pub tab_id: TabId,
    pub frame_id: i32,
    pub url: String,
}

/// A rule in the dynamic table matched a request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    pub rule_id: u32,
    pub tab_id: TabId,
    pub url: String,
}

pub struct NavigationWatcher {
    store: Arc<PolicyStore>,
    config: EngineConfig,
}

impl NavigationWatcher {
    pub fn new(store: Arc<PolicyStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn for_engine(engine: &DecisionEngine) -> Self {
        Self::new(engine.store().clone(), engine.config().clone())
    }

    fn is_skipped(&self, url: &str) -> bool {
        is_extension_url(url, &self.config.extension_base_url) || is_restricted_url(url)
    }

    /// Record a top-level web navigation as pending. If the URL is already
    /// blocked, also stage the interstitial's info. Returns whether the event
    /// was recorded.
    pub async fn on_before_navigate(&self, event: &NavigationEvent) -> bool {
        if event.frame_id != MAIN_FRAME_ID {
            return false;
        }
        if !should_intercept(&event.url, &self.config.extension_base_url) {
            return false;
        }

        self.store.ensure_loaded().await;
        self.store.set_pending(event.tab_id, &event.url).await.into_value();

        let normalized = normalize_url(&event.url);
        if self.store.is_blocked(&normalized) {
            let key = self.store.score_mode().cache_key(&normalized);
            let score = self
                .store
                .cached_score(&key)
                .unwrap_or(self.config.block_threshold);
            debug!("Tab {} heading to blocked {}", event.tab_id, normalized);
            self.store
                .set_blocked_info(event.tab_id, &event.url, score)
                .await
                .into_value();
        }
        true
    }

    /// Record a navigation caught by the catch-all rule and count it as a
    /// page load. Matches of any other rule are ignored.
    pub async fn on_rule_matched(&self, matched: &RuleMatch) -> bool {
        if matched.rule_id != CATCH_ALL_RULE_ID {
            return false;
        }
        if matched.url.is_empty() || self.is_skipped(&matched.url) {
            return false;
        }

        self.store.ensure_loaded().await;
        self.store.set_pending(matched.tab_id, &matched.url).await.into_value();
        let count = self.store.increment_daily_page_load().await.into_value();
        debug!("Page load {} today (tab {})", count, matched.tab_id);
        true
    }
}
