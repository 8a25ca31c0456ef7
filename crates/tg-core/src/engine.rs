//! Decision Engine
//!
//! Runs the per-navigation state machine: filter, block check, allow check,
//! per-tab dedup, cached-or-computed score, then the threshold ladder.
//!
//! ```text
//!   url ──► ignored? ──► blocked? ──► allowed? ──► duplicate? ──► score
//!                           │            │                          │
//!                     AlreadyBlocked  AllowListed        ┌──────────┼──────────┐
//!                                                     >= block   >= warn     below
//!                                                     Blocked    Warned     Allowed
//! ```
//!
//! Concurrent decisions that need the same uncached score share a single
//! provider call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::ports::TabNavigator;
use crate::score::{ScoreError, ScoreProviders, ScoreRequest};
use crate::store::{PolicyStore, SyncError};
use crate::types::{ScoreMode, TabId, Timestamp};
use crate::url::{build_warning_url, is_extension_url, is_restricted_url, normalize_url};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Score computation failed: {0}")]
    Score(#[from] ScoreError),
    #[error("Rule sync failed: {0}")]
    Sync(#[from] SyncError),
}

/// Outcome of one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Empty, restricted or extension URL
    Ignored,
    /// URL was already in the block set; tab sent to the interstitial
    AlreadyBlocked { score: u8 },
    /// A live allow entry covers the URL
    AllowListed { expires_at: Timestamp },
    /// Same URL as the tab's previous decision
    Duplicate,
    Blocked { score: u8 },
    Warned { score: u8 },
    Allowed { score: u8, expires_at: Timestamp },
}

impl Verdict {
    /// Whether the tab was sent to the interstitial.
    pub fn redirects(&self) -> bool {
        matches!(
            self,
            Self::AlreadyBlocked { .. } | Self::Blocked { .. } | Self::Warned { .. }
        )
    }

    pub fn score(&self) -> Option<u8> {
        match self {
            Self::AlreadyBlocked { score }
            | Self::Blocked { score }
            | Self::Warned { score }
            | Self::Allowed { score, .. } => Some(*score),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ignored => write!(f, "ignored"),
            Self::AlreadyBlocked { score } => write!(f, "already blocked (score {})", score),
            Self::AllowListed { expires_at } => write!(f, "allow-listed until {}", expires_at),
            Self::Duplicate => write!(f, "duplicate"),
            Self::Blocked { score } => write!(f, "blocked (score {})", score),
            Self::Warned { score } => write!(f, "warned (score {})", score),
            Self::Allowed { score, expires_at } => {
                write!(f, "allowed (score {}) until {}", score, expires_at)
            }
        }
    }
}

type InflightScores = HashMap<String, Arc<OnceCell<u8>>>;

pub struct DecisionEngine {
    store: Arc<PolicyStore>,
    providers: ScoreProviders,
    navigator: Arc<dyn TabNavigator>,
    config: EngineConfig,
    /// Raw URL of the last decision that reached scoring, per tab.
    last_scored: Mutex<HashMap<TabId, String>>,
    inflight: Mutex<InflightScores>,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<PolicyStore>,
        providers: ScoreProviders,
        navigator: Arc<dyn TabNavigator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            providers,
            navigator,
            config,
            last_scored: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// URLs the engine never intercepts.
    pub fn is_ignored(&self, url: &str) -> bool {
        url.is_empty()
            || is_restricted_url(url)
            || is_extension_url(url, &self.config.extension_base_url)
    }

    /// Cached score under the current mode, else the block threshold.
    pub fn display_score(&self, normalized_url: &str) -> u8 {
        let key = self.store.score_mode().cache_key(normalized_url);
        self.store
            .cached_score(&key)
            .unwrap_or(self.config.block_threshold)
    }

    /// Decide what happens to `tab_id` navigating to `url`.
    pub async fn decide(&self, tab_id: TabId, url: &str) -> Result<Verdict, EngineError> {
        if self.is_ignored(url) {
            return Ok(Verdict::Ignored);
        }

        self.store.ensure_loaded().await;
        let normalized = normalize_url(url);

        if self.store.is_blocked(&normalized) {
            let score = self.display_score(&normalized);
            info!("Tab {} navigating to blocked {} (score {})", tab_id, normalized, score);
            self.store.set_blocked_info(tab_id, url, score).await.into_value();
            self.redirect_to_warning(tab_id, url, score).await;
            return Ok(Verdict::AlreadyBlocked { score });
        }

        if let Some(expires_at) = self.store.live_allow(&normalized) {
            debug!("{} allowed until {}", normalized, expires_at);
            return Ok(Verdict::AllowListed { expires_at });
        }

        if !self.mark_scored(tab_id, url) {
            debug!("Tab {} already decided {}", tab_id, url);
            return Ok(Verdict::Duplicate);
        }

        let mode = self.store.score_mode();
        let score = match self.score(mode, &normalized, url).await {
            Ok(score) => score,
            Err(e) => {
                // Let a retry from the same tab go through.
                self.last_scored.lock().remove(&tab_id);
                warn!("Failed to score {}: {}", url, e);
                return Err(e.into());
            }
        };

        if score >= self.config.block_threshold {
            info!("Blocking {} (score {})", normalized, score);
            self.store.add_blocked(&normalized).await.into_value();
            let _ = self.store.sync_rules().await;
            self.store.set_blocked_info(tab_id, url, score).await.into_value();
            self.redirect_to_warning(tab_id, url, score).await;
            return Ok(Verdict::Blocked { score });
        }

        if score >= self.config.warn_threshold {
            info!("Warning on {} (score {})", normalized, score);
            self.redirect_to_warning(tab_id, url, score).await;
            return Ok(Verdict::Warned { score });
        }

        let expires_at = self.store.now_ms() + self.config.allow_ttl_ms;
        info!("Allowing {} (score {}) until {}", normalized, score, expires_at);
        self.store.set_allow(&normalized, expires_at).await.into_value();
        let _ = self.store.sync_rules().await;
        self.navigate(tab_id, url).await;
        Ok(Verdict::Allowed { score, expires_at })
    }

    /// Install a fresh allow entry for `url` and resync. Returns the expiry.
    pub async fn allow_once(&self, url: &str) -> Result<Timestamp, EngineError> {
        self.store.ensure_loaded().await;
        let normalized = normalize_url(url);
        let expires_at = self.store.now_ms() + self.config.allow_ttl_ms;
        info!("Allow once: {} until {}", normalized, expires_at);
        self.store.set_allow(&normalized, expires_at).await.into_value();
        self.store.sync_rules().await?;
        Ok(expires_at)
    }

    /// Record `url` as the tab's latest scored URL. False if it already was.
    fn mark_scored(&self, tab_id: TabId, url: &str) -> bool {
        let mut last = self.last_scored.lock();
        if last.get(&tab_id).is_some_and(|prev| prev == url) {
            return false;
        }
        last.insert(tab_id, url.to_string());
        true
    }

    // =========================================================================
    // Scoring
    // =========================================================================

    /// Cached score for the URL under `mode`, computing it at most once at a
    /// time per cache key.
    async fn score(&self, mode: ScoreMode, normalized: &str, url: &str) -> Result<u8, ScoreError> {
        let cache_key = mode.cache_key(normalized);
        if let Some(score) = self.store.cached_score(&cache_key) {
            debug!("Score cache hit for {}: {}", cache_key, score);
            return Ok(score);
        }

        let cell = self
            .inflight
            .lock()
            .entry(cache_key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        // A failed init leaves the cell empty and the next waiter computes.
        let result = cell
            .get_or_try_init(|| self.compute(mode, &cache_key, url))
            .await
            .copied();

        // Waiters hold their own handle, so the entry can go either way.
        let mut inflight = self.inflight.lock();
        if inflight
            .get(&cache_key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            inflight.remove(&cache_key);
        }
        result
    }

    async fn compute(&self, mode: ScoreMode, cache_key: &str, url: &str) -> Result<u8, ScoreError> {
        // Another caller may have finished between the cache miss and here.
        if let Some(score) = self.store.cached_score(cache_key) {
            return Ok(score);
        }

        let settings = self.store.settings();
        let provider = self.providers.for_mode(mode);
        let started = Instant::now();
        let score = provider
            .score(ScoreRequest::new(url).with_credential(&settings.api_key))
            .await?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!("{} score for {}: {} ({:.2} ms)", mode, url, score, elapsed_ms);

        if mode == ScoreMode::Remote {
            self.store.record_remote_timing(elapsed_ms).await.into_value();
        }
        self.store.set_score(cache_key, score).await.into_value();
        Ok(score)
    }

    // =========================================================================
    // Tab Navigation
    // =========================================================================

    async fn redirect_to_warning(&self, tab_id: TabId, url: &str, score: u8) {
        let target = build_warning_url(&self.config.extension_base_url, url, score);
        self.navigate(tab_id, &target).await;
    }

    async fn navigate(&self, tab_id: TabId, url: &str) {
        if let Err(e) = self.navigator.navigate(tab_id, url).await {
            warn!("{}", e);
        }
    }
}

/// Prune expired allow entries every `period`, starting one period from now.
pub fn spawn_prune_task(engine: Arc<DecisionEngine>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            ticker.tick().await;
            let pruned = engine.store.prune_expired_allows().await;
            if pruned.value > 0 {
                info!("Allow cleanup removed {} entries", pruned.value);
            }
        }
    })
}
