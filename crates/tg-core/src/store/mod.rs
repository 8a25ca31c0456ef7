//! Policy Store
//!
//! Owns the three durable collections (blocked URLs, time-limited allows,
//! score cache), the per-tab session maps (pending navigation, blocked info)
//! and the runtime settings. It is the only writer of both storage areas and
//! of the rule table.
//!
//! # Persistence
//!
//! Every mutation changes memory first, then writes the whole affected
//! collection back. A failed write is logged and reported in the returned
//! [`Mutation`]; memory stays authoritative for the rest of the process.
//!
//! # Loading
//!
//! The first [`PolicyStore::ensure_loaded`] call performs the load; callers
//! arriving while it runs wait on the same load. A rule resync follows so
//! the rule table reflects restored state.

mod codec;
mod stats;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{Mutex as AsyncMutex, OnceCell};

use crate::ports::Clock;
use crate::rules::build_rule_set;
use crate::storage::{entry, keys, KeyValueStore, StorageError, StorageMap};
use crate::table::{RuleTable, RuleTableError};
use crate::types::{
    BlockedInfo, PendingNavigation, RemoteTiming, Rule, ScoreMode, TabId, Timestamp,
};

pub use stats::PolicyStats;

const DURABLE_KEYS: [&str; 8] = [
    keys::BLOCKED_URLS,
    keys::ALLOW_URLS,
    keys::CACHED_SCORES,
    keys::SCORE_MODE,
    keys::API_KEY,
    keys::DAILY_PAGE_LOAD_DATE,
    keys::DAILY_PAGE_LOAD_COUNT,
    keys::REMOTE_TIMING,
];

const SESSION_KEYS: [&str; 2] = [keys::PENDING_URLS, keys::BLOCKED_INFO];

/// Settings edited from the extension's options UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub score_mode: ScoreMode,
    pub api_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Rule table rejected the update: {0}")]
    Table(#[from] RuleTableError),
}

/// Outcome of a store mutation.
///
/// The in-memory change has been applied either way; `persist` says whether
/// storage caught up.
#[must_use = "persistence failures are reported through `persist`"]
#[derive(Debug)]
pub struct Mutation<T = ()> {
    pub value: T,
    pub persist: Result<(), StorageError>,
}

impl<T> Mutation<T> {
    pub fn is_persisted(&self) -> bool {
        self.persist.is_ok()
    }

    /// Drop the persistence outcome (already logged by the store).
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn into_result(self) -> Result<T, StorageError> {
        self.persist.map(|()| self.value)
    }
}

#[derive(Debug, Default)]
struct PolicyState {
    blocked: BTreeSet<String>,
    allowed: BTreeMap<String, Timestamp>,
    scores: BTreeMap<String, u8>,
    pending: BTreeMap<TabId, PendingNavigation>,
    blocked_info: BTreeMap<TabId, BlockedInfo>,
    settings: Settings,
    daily_date: String,
    daily_count: u64,
    timing: RemoteTiming,
}

pub struct PolicyStore {
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    rule_table: Arc<dyn RuleTable>,
    clock: Arc<dyn Clock>,
    state: Mutex<PolicyState>,
    loaded: OnceCell<()>,
    // Snapshot-and-write sections, so an older snapshot never lands after a
    // newer one.
    durable_writes: AsyncMutex<()>,
    session_writes: AsyncMutex<()>,
    // Read-then-replace of the rule table.
    sync_lock: AsyncMutex<()>,
}

impl PolicyStore {
    pub fn new(
        durable: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        rule_table: Arc<dyn RuleTable>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            durable,
            session,
            rule_table,
            clock,
            state: Mutex::new(PolicyState::default()),
            loaded: OnceCell::new(),
            durable_writes: AsyncMutex::new(()),
            session_writes: AsyncMutex::new(()),
            sync_lock: AsyncMutex::new(()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_ms(&self) -> Timestamp {
        self.clock.now_ms()
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Load persisted state once. Concurrent callers share the same load.
    pub async fn ensure_loaded(&self) {
        self.loaded.get_or_init(|| self.load()).await;
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    async fn load(&self) {
        match self.durable.get(&DURABLE_KEYS).await {
            Ok(data) => self.merge_durable(&data),
            Err(e) => warn!("Failed to load durable policy state: {}", e),
        }
        match self.session.get(&SESSION_KEYS).await {
            Ok(data) => self.merge_session(&data),
            Err(e) => warn!("Failed to load pending navigations: {}", e),
        }
        {
            let state = self.state.lock();
            info!(
                "Policy state loaded: {} blocked, {} allowed, {} cached scores, mode {}",
                state.blocked.len(),
                state.allowed.len(),
                state.scores.len(),
                state.settings.score_mode
            );
        }
        // Failure is logged inside; the next mutation retries.
        let _ = self.sync_loaded().await;
    }

    fn merge_durable(&self, data: &StorageMap) {
        let now = self.now_ms();
        let mut state = self.state.lock();

        if let Some(value) = data.get(keys::BLOCKED_URLS) {
            state.blocked.extend(codec::decode_blocked(value));
        }
        // Entries written before the load finished are newer than storage.
        if let Some(value) = data.get(keys::ALLOW_URLS) {
            for (url, expires_at) in codec::decode_allows(value, now) {
                state.allowed.entry(url).or_insert(expires_at);
            }
        }
        if let Some(value) = data.get(keys::CACHED_SCORES) {
            for (key, score) in codec::decode_scores(value) {
                state.scores.entry(key).or_insert(score);
            }
        }
        if let Some(mode) = data
            .get(keys::SCORE_MODE)
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<ScoreMode>().ok())
        {
            state.settings.score_mode = mode;
        }
        if let Some(key) = data.get(keys::API_KEY).and_then(Value::as_str) {
            state.settings.api_key = key.to_string();
        }
        if let Some(date) = data.get(keys::DAILY_PAGE_LOAD_DATE).and_then(Value::as_str) {
            state.daily_date = date.to_string();
        }
        if let Some(count) = data.get(keys::DAILY_PAGE_LOAD_COUNT).and_then(Value::as_u64) {
            state.daily_count = count;
        }
        if let Some(timing) = data
            .get(keys::REMOTE_TIMING)
            .and_then(|v| serde_json::from_value::<RemoteTiming>(v.clone()).ok())
        {
            state.timing = timing;
        }
    }

    fn merge_session(&self, data: &StorageMap) {
        let mut state = self.state.lock();
        if let Some(value) = data.get(keys::PENDING_URLS) {
            for (tab_id, mut pending) in codec::decode_tab_map::<PendingNavigation>(value) {
                pending.tab_id = tab_id;
                state.pending.entry(tab_id).or_insert(pending);
            }
        }
        if let Some(value) = data.get(keys::BLOCKED_INFO) {
            for (tab_id, mut info) in codec::decode_tab_map::<BlockedInfo>(value) {
                info.tab_id = tab_id;
                state.blocked_info.entry(tab_id).or_insert(info);
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn is_blocked(&self, normalized_url: &str) -> bool {
        self.state.lock().blocked.contains(normalized_url)
    }

    /// Expiry of a live allow entry for the URL.
    pub fn live_allow(&self, normalized_url: &str) -> Option<Timestamp> {
        let now = self.now_ms();
        self.state
            .lock()
            .allowed
            .get(normalized_url)
            .copied()
            .filter(|expires_at| *expires_at > now)
    }

    pub fn cached_score(&self, cache_key: &str) -> Option<u8> {
        self.state.lock().scores.get(cache_key).copied()
    }

    pub fn pending(&self, tab_id: TabId) -> Option<PendingNavigation> {
        self.state.lock().pending.get(&tab_id).cloned()
    }

    pub fn blocked_info(&self, tab_id: TabId) -> Option<BlockedInfo> {
        self.state.lock().blocked_info.get(&tab_id).cloned()
    }

    pub fn settings(&self) -> Settings {
        self.state.lock().settings.clone()
    }

    pub fn score_mode(&self) -> ScoreMode {
        self.state.lock().settings.score_mode
    }

    pub fn blocked_urls(&self) -> Vec<String> {
        self.state.lock().blocked.iter().cloned().collect()
    }

    /// All allow entries, live or not yet pruned.
    pub fn allow_entries(&self) -> Vec<(String, Timestamp)> {
        self.state
            .lock()
            .allowed
            .iter()
            .map(|(url, expires_at)| (url.clone(), *expires_at))
            .collect()
    }

    pub fn cached_scores(&self) -> Vec<(String, u8)> {
        self.state
            .lock()
            .scores
            .iter()
            .map(|(key, score)| (key.clone(), *score))
            .collect()
    }

    pub fn remote_timing(&self) -> RemoteTiming {
        self.state.lock().timing
    }

    pub fn stats(&self) -> PolicyStats {
        let now = self.now_ms();
        let today = self.clock.today();
        let state = self.state.lock();
        PolicyStats {
            cached_scores: state.scores.len(),
            blocked_urls: state.blocked.len(),
            live_allows: state.allowed.values().filter(|e| **e > now).count(),
            daily_page_loads: if state.daily_date == today {
                state.daily_count
            } else {
                0
            },
            remote_avg_ms: state.timing.average_ms(),
            score_mode: state.settings.score_mode,
        }
    }

    // =========================================================================
    // Durable Mutations
    // =========================================================================

    /// Add a URL to the block set. The value is `true` if it was new.
    pub async fn add_blocked(&self, normalized_url: &str) -> Mutation<bool> {
        self.ensure_loaded().await;
        let added = self.state.lock().blocked.insert(normalized_url.to_string());
        let persist = self
            .write_durable("blocked URLs", |state| {
                entry(keys::BLOCKED_URLS, codec::encode_blocked(&state.blocked))
            })
            .await;
        Mutation { value: added, persist }
    }

    /// Install or refresh an allow entry.
    pub async fn set_allow(&self, normalized_url: &str, expires_at: Timestamp) -> Mutation {
        self.ensure_loaded().await;
        self.state
            .lock()
            .allowed
            .insert(normalized_url.to_string(), expires_at);
        let persist = self
            .write_durable("allow URLs", |state| {
                entry(keys::ALLOW_URLS, codec::encode_allows(&state.allowed))
            })
            .await;
        Mutation { value: (), persist }
    }

    pub async fn set_score(&self, cache_key: &str, score: u8) -> Mutation {
        self.ensure_loaded().await;
        self.state.lock().scores.insert(cache_key.to_string(), score);
        let persist = self
            .write_durable("cached scores", |state| {
                entry(keys::CACHED_SCORES, codec::encode_scores(&state.scores))
            })
            .await;
        Mutation { value: (), persist }
    }

    /// Remove allow entries whose expiry has passed. When anything was
    /// removed, persists the allow set and resyncs the rule table. The value
    /// is the number of entries removed.
    pub async fn prune_expired_allows(&self) -> Mutation<usize> {
        self.ensure_loaded().await;
        let now = self.now_ms();
        let removed = {
            let mut state = self.state.lock();
            let before = state.allowed.len();
            state.allowed.retain(|_, expires_at| *expires_at > now);
            before - state.allowed.len()
        };
        if removed == 0 {
            return Mutation {
                value: 0,
                persist: Ok(()),
            };
        }

        debug!("Pruned {} expired allow entries", removed);
        let persist = self
            .write_durable("allow URLs", |state| {
                entry(keys::ALLOW_URLS, codec::encode_allows(&state.allowed))
            })
            .await;
        let _ = self.sync_rules().await;
        Mutation {
            value: removed,
            persist,
        }
    }

    pub async fn set_score_mode(&self, mode: ScoreMode) -> Mutation {
        self.ensure_loaded().await;
        self.state.lock().settings.score_mode = mode;
        let persist = self
            .write_durable("score mode", |state| {
                entry(keys::SCORE_MODE, json!(state.settings.score_mode))
            })
            .await;
        Mutation { value: (), persist }
    }

    pub async fn set_api_key(&self, api_key: &str) -> Mutation {
        self.ensure_loaded().await;
        self.state.lock().settings.api_key = api_key.to_string();
        let persist = self
            .write_durable("API key", |state| {
                entry(keys::API_KEY, json!(state.settings.api_key))
            })
            .await;
        Mutation { value: (), persist }
    }

    /// Count a page load against today's local date, restarting the count
    /// when the date changed. The value is the new count.
    pub async fn increment_daily_page_load(&self) -> Mutation<u64> {
        self.ensure_loaded().await;
        let today = self.clock.today();
        let count = {
            let mut state = self.state.lock();
            if state.daily_date == today {
                state.daily_count += 1;
            } else {
                state.daily_date = today;
                state.daily_count = 1;
            }
            state.daily_count
        };
        let persist = self
            .write_durable("daily page loads", |state| {
                let mut map = entry(keys::DAILY_PAGE_LOAD_DATE, json!(state.daily_date));
                map.insert(keys::DAILY_PAGE_LOAD_COUNT.to_string(), json!(state.daily_count));
                map
            })
            .await;
        Mutation { value: count, persist }
    }

    pub async fn record_remote_timing(&self, duration_ms: f64) -> Mutation<RemoteTiming> {
        self.ensure_loaded().await;
        let timing = {
            let mut state = self.state.lock();
            state.timing.record(duration_ms);
            state.timing
        };
        let persist = self
            .write_durable("remote timing", |state| {
                entry(keys::REMOTE_TIMING, json!(state.timing))
            })
            .await;
        Mutation {
            value: timing,
            persist,
        }
    }

    /// Mirror a settings change made by another extension page. Keys the
    /// store does not track are ignored. Returns whether anything changed.
    pub async fn apply_storage_change(&self, key: &str, new_value: Option<&Value>) -> bool {
        self.ensure_loaded().await;
        let mut state = self.state.lock();
        match key {
            keys::SCORE_MODE => {
                let Some(mode) = new_value
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<ScoreMode>().ok())
                else {
                    return false;
                };
                state.settings.score_mode = mode;
                true
            }
            keys::API_KEY => {
                state.settings.api_key = new_value
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                true
            }
            _ => false,
        }
    }

    // =========================================================================
    // Session Mutations
    // =========================================================================

    pub async fn set_pending(&self, tab_id: TabId, url: &str) -> Mutation {
        self.ensure_loaded().await;
        let timestamp = self.now_ms();
        self.state.lock().pending.insert(
            tab_id,
            PendingNavigation {
                tab_id,
                url: url.to_string(),
                timestamp,
            },
        );
        let persist = self
            .write_session("pending URLs", |state| {
                entry(keys::PENDING_URLS, codec::encode_tab_map(&state.pending))
            })
            .await;
        Mutation { value: (), persist }
    }

    pub async fn set_blocked_info(&self, tab_id: TabId, url: &str, score: u8) -> Mutation {
        self.ensure_loaded().await;
        let timestamp = self.now_ms();
        self.state.lock().blocked_info.insert(
            tab_id,
            BlockedInfo {
                tab_id,
                url: url.to_string(),
                score,
                timestamp,
            },
        );
        let persist = self
            .write_session("blocked info", |state| {
                entry(keys::BLOCKED_INFO, codec::encode_tab_map(&state.blocked_info))
            })
            .await;
        Mutation { value: (), persist }
    }

    // =========================================================================
    // Rule Synchronization
    // =========================================================================

    /// Replace the whole dynamic rule table with the rules derived from
    /// current state: catch-all, one block rule per blocked URL, one allow
    /// rule per live allow entry. Returns the number of rules installed.
    ///
    /// Failures are logged; the next resync starts from scratch again.
    pub async fn sync_rules(&self) -> Result<usize, SyncError> {
        self.ensure_loaded().await;
        self.sync_loaded().await
    }

    /// Resync without waiting for the load; the load itself ends with this.
    async fn sync_loaded(&self) -> Result<usize, SyncError> {
        let _guard = self.sync_lock.lock().await;

        let desired = {
            let now = self.now_ms();
            let state = self.state.lock();
            build_rule_set(
                state.blocked.iter().map(String::as_str),
                state
                    .allowed
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(url, _)| url.as_str()),
            )
        };
        let count = desired.len();

        match self.replace_rules(desired).await {
            Ok(()) => {
                debug!("Rule table synced: {} rules", count);
                Ok(count)
            }
            Err(e) => {
                warn!("Failed to sync dynamic rules: {}", e);
                Err(e.into())
            }
        }
    }

    async fn replace_rules(&self, desired: Vec<Rule>) -> Result<(), RuleTableError> {
        let existing = self.rule_table.get_dynamic_rules().await?;
        let remove: Vec<u32> = existing.iter().map(|rule| rule.id).collect();
        self.rule_table.update_dynamic_rules(&remove, desired).await
    }

    // =========================================================================
    // Writers
    // =========================================================================

    async fn write_durable<F>(&self, what: &str, build: F) -> Result<(), StorageError>
    where
        F: FnOnce(&PolicyState) -> StorageMap,
    {
        let _guard = self.durable_writes.lock().await;
        let payload = build(&*self.state.lock());
        Self::log_write(what, self.durable.set(payload).await)
    }

    async fn write_session<F>(&self, what: &str, build: F) -> Result<(), StorageError>
    where
        F: FnOnce(&PolicyState) -> StorageMap,
    {
        let _guard = self.session_writes.lock().await;
        let payload = build(&*self.state.lock());
        Self::log_write(what, self.session.set(payload).await)
    }

    fn log_write(what: &str, result: Result<(), StorageError>) -> Result<(), StorageError> {
        if let Err(e) = &result {
            warn!("Failed to persist {}: {}", what, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use crate::storage::MemoryStore;
    use crate::table::MemoryRuleTable;

    struct Fixture {
        durable: Arc<MemoryStore>,
        session: Arc<MemoryStore>,
        table: Arc<MemoryRuleTable>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                durable: Arc::new(MemoryStore::new()),
                session: Arc::new(MemoryStore::new()),
                table: Arc::new(MemoryRuleTable::new()),
                clock: Arc::new(ManualClock::new(1_000_000)),
            }
        }

        fn store(&self) -> PolicyStore {
            PolicyStore::new(
                self.durable.clone(),
                self.session.clone(),
                self.table.clone(),
                self.clock.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_cold_load_installs_catch_all() {
        let fx = Fixture::new();
        let store = fx.store();
        store.ensure_loaded().await;
        assert!(store.is_loaded());
        assert_eq!(fx.table.rules().len(), 1);
        assert_eq!(fx.table.rules()[0].id, 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_coalesce() {
        let fx = Fixture::new();
        let store = fx.store();
        tokio::join!(store.ensure_loaded(), store.ensure_loaded(), store.ensure_loaded());
        assert_eq!(fx.durable.read_count(), 1);
        assert_eq!(fx.session.read_count(), 1);
        assert_eq!(fx.table.update_count(), 1);
    }

    #[tokio::test]
    async fn test_round_trip_excludes_expired_allows() {
        let fx = Fixture::new();
        let store = fx.store();
        store.ensure_loaded().await;

        let now = fx.clock.now_ms();
        assert!(store.add_blocked("https://bad/").await.is_persisted());
        store.set_allow("https://live/", now + 60_000).await.into_value();
        store.set_allow("https://soon/", now + 10).await.into_value();
        store.set_score("demo::https://bad/", 90).await.into_value();
        store.set_pending(3, "https://bad/#frag").await.into_value();
        store.set_blocked_info(3, "https://bad/#frag", 90).await.into_value();

        fx.clock.advance(100);
        let reloaded = fx.store();
        reloaded.ensure_loaded().await;

        assert_eq!(reloaded.blocked_urls(), store.blocked_urls());
        assert_eq!(reloaded.cached_scores(), store.cached_scores());
        assert_eq!(
            reloaded.allow_entries(),
            vec![("https://live/".to_string(), now + 60_000)]
        );
        assert_eq!(reloaded.pending(3).unwrap().url, "https://bad/#frag");
        assert_eq!(reloaded.pending(3).unwrap().tab_id, 3);
        assert_eq!(reloaded.blocked_info(3).unwrap().score, 90);
    }

    #[tokio::test]
    async fn test_load_syncs_restored_rules() {
        let fx = Fixture::new();
        let mut seed = StorageMap::new();
        seed.insert(keys::BLOCKED_URLS.into(), json!(["https://bad/"]));
        seed.insert(
            keys::ALLOW_URLS.into(),
            json!([{ "url": "https://ok/", "expiresAt": 2_000_000 }]),
        );
        let durable = Arc::new(MemoryStore::with_entries(seed));
        let store = PolicyStore::new(
            durable,
            fx.session.clone(),
            fx.table.clone(),
            fx.clock.clone(),
        );
        store.ensure_loaded().await;

        let rules = fx.table.rules();
        assert_eq!(rules.len(), 3);
        assert_eq!(fx.table.match_main_frame("https://bad/").unwrap().priority, 3);
        assert_eq!(fx.table.match_main_frame("https://ok/").unwrap().priority, 2);
    }

    #[tokio::test]
    async fn test_load_reads_settings_and_counters() {
        let fx = Fixture::new();
        let mut seed = StorageMap::new();
        seed.insert(keys::SCORE_MODE.into(), json!("gti"));
        seed.insert(keys::API_KEY.into(), json!("k"));
        seed.insert(keys::REMOTE_TIMING.into(), json!({ "totalMs": 30.0, "count": 3 }));
        let store = PolicyStore::new(
            Arc::new(MemoryStore::with_entries(seed)),
            fx.session.clone(),
            fx.table.clone(),
            fx.clock.clone(),
        );
        store.ensure_loaded().await;

        assert_eq!(
            store.settings(),
            Settings {
                score_mode: ScoreMode::Remote,
                api_key: "k".to_string()
            }
        );
        assert_eq!(store.stats().remote_avg_ms, Some(10.0));
    }

    #[tokio::test]
    async fn test_load_failure_keeps_defaults() {
        let fx = Fixture::new();
        fx.durable.set_fail_reads(true);
        fx.session.set_fail_reads(true);
        let store = fx.store();
        store.ensure_loaded().await;
        assert!(store.is_loaded());
        assert_eq!(store.score_mode(), ScoreMode::Demo);
        assert_eq!(fx.table.rules().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory() {
        let fx = Fixture::new();
        let store = fx.store();
        store.ensure_loaded().await;
        fx.durable.set_fail_writes(true);

        let mutation = store.add_blocked("https://bad/").await;
        assert!(!mutation.is_persisted());
        assert!(mutation.value);
        assert!(store.is_blocked("https://bad/"));
        assert_eq!(fx.durable.value(keys::BLOCKED_URLS), None);
    }

    #[tokio::test]
    async fn test_prune_removes_expired_and_resyncs_once() {
        let fx = Fixture::new();
        let store = fx.store();
        store.ensure_loaded().await;

        let expires_at = fx.clock.now_ms() + 60_000;
        store.set_allow("https://a/", expires_at).await.into_value();
        store.sync_rules().await.unwrap();
        let updates_before = fx.table.update_count();

        fx.clock.set(expires_at + 1);
        let pruned = store.prune_expired_allows().await;
        assert_eq!(pruned.value, 1);
        assert!(store.allow_entries().is_empty());
        assert_eq!(fx.table.update_count(), updates_before + 1);
        assert_eq!(fx.table.rules().len(), 1);

        // Idempotent: nothing left to prune, no resync.
        assert_eq!(store.prune_expired_allows().await.value, 0);
        assert_eq!(fx.table.update_count(), updates_before + 1);
    }

    #[tokio::test]
    async fn test_prune_at_exact_expiry() {
        let fx = Fixture::new();
        let store = fx.store();
        store.ensure_loaded().await;
        let expires_at = fx.clock.now_ms() + 5;
        store.set_allow("https://a/", expires_at).await.into_value();
        fx.clock.set(expires_at);
        assert_eq!(store.live_allow("https://a/"), None);
        assert_eq!(store.prune_expired_allows().await.value, 1);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let fx = Fixture::new();
        let store = fx.store();
        store.ensure_loaded().await;
        store.add_blocked("https://bad/").await.into_value();
        store
            .set_allow("https://ok/", fx.clock.now_ms() + 1_000)
            .await
            .into_value();

        store.sync_rules().await.unwrap();
        let once = fx.table.rules();
        store.sync_rules().await.unwrap();
        assert_eq!(fx.table.rules(), once);
    }

    #[tokio::test]
    async fn test_sync_failure_reported() {
        let fx = Fixture::new();
        let store = fx.store();
        store.ensure_loaded().await;
        fx.table.set_fail_updates(true);
        assert!(store.sync_rules().await.is_err());
        fx.table.set_fail_updates(false);
        assert_eq!(store.sync_rules().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_daily_counter_rolls_over() {
        let fx = Fixture::new();
        fx.clock.set_today("2026-03-01");
        let store = fx.store();
        store.ensure_loaded().await;

        assert_eq!(store.increment_daily_page_load().await.value, 1);
        assert_eq!(store.increment_daily_page_load().await.value, 2);
        assert_eq!(store.stats().daily_page_loads, 2);
        assert_eq!(fx.durable.value(keys::DAILY_PAGE_LOAD_COUNT), Some(json!(2)));

        fx.clock.set_today("2026-03-02");
        assert_eq!(store.stats().daily_page_loads, 0);
        assert_eq!(store.increment_daily_page_load().await.value, 1);
        assert_eq!(
            fx.durable.value(keys::DAILY_PAGE_LOAD_DATE),
            Some(json!("2026-03-02"))
        );
    }

    #[tokio::test]
    async fn test_remote_timing_persisted() {
        let fx = Fixture::new();
        let store = fx.store();
        store.ensure_loaded().await;
        store.record_remote_timing(12.0).await.into_value();
        let timing = store.record_remote_timing(18.0).await.value;
        assert_eq!(timing.count, 2);
        assert_eq!(
            fx.durable.value(keys::REMOTE_TIMING),
            Some(json!({ "totalMs": 30.0, "count": 2 }))
        );
    }

    #[tokio::test]
    async fn test_apply_storage_change() {
        let fx = Fixture::new();
        let store = fx.store();
        assert!(
            store
                .apply_storage_change(keys::SCORE_MODE, Some(&json!("remote")))
                .await
        );
        assert_eq!(store.score_mode(), ScoreMode::Remote);
        assert!(
            !store
                .apply_storage_change(keys::SCORE_MODE, Some(&json!("bogus")))
                .await
        );
        assert_eq!(store.score_mode(), ScoreMode::Remote);

        assert!(store.apply_storage_change(keys::API_KEY, Some(&json!("abc"))).await);
        assert_eq!(store.settings().api_key, "abc");
        assert!(store.apply_storage_change(keys::API_KEY, None).await);
        assert_eq!(store.settings().api_key, "");

        assert!(!store.apply_storage_change("unrelated", Some(&json!(1))).await);
    }

    #[tokio::test]
    async fn test_storage_change_before_load_wins() {
        let mut seed = StorageMap::new();
        seed.insert(keys::SCORE_MODE.into(), json!("demo"));
        let fx = Fixture::new();
        let store = PolicyStore::new(
            Arc::new(MemoryStore::with_entries(seed)),
            fx.session.clone(),
            fx.table.clone(),
            fx.clock.clone(),
        );

        assert!(
            store
                .apply_storage_change(keys::SCORE_MODE, Some(&json!("remote")))
                .await
        );
        assert!(store.is_loaded());
        assert_eq!(store.score_mode(), ScoreMode::Remote);
    }

    #[tokio::test]
    async fn test_mutation_before_load_keeps_stored_state() {
        let mut seed = StorageMap::new();
        seed.insert(keys::BLOCKED_URLS.into(), json!(["https://old-bad/"]));
        seed.insert(
            keys::CACHED_SCORES.into(),
            json!([{ "key": "demo::https://old-bad/", "score": 77 }]),
        );
        let durable = Arc::new(MemoryStore::with_entries(seed));
        let fx = Fixture::new();
        let open = || {
            PolicyStore::new(
                durable.clone(),
                fx.session.clone(),
                fx.table.clone(),
                fx.clock.clone(),
            )
        };

        let store = open();
        assert!(store.add_blocked("https://new-bad/").await.is_persisted());
        store.set_score("demo::https://new-bad/", 95).await.into_value();
        store.set_pending(1, "https://new-bad/").await.into_value();
        assert!(store.is_blocked("https://old-bad/"));
        assert_eq!(
            durable.value(keys::BLOCKED_URLS),
            Some(json!(["https://new-bad/", "https://old-bad/"]))
        );

        let reloaded = open();
        reloaded.ensure_loaded().await;
        assert!(reloaded.is_blocked("https://old-bad/"));
        assert!(reloaded.is_blocked("https://new-bad/"));
        assert_eq!(reloaded.cached_score("demo::https://old-bad/"), Some(77));
        assert_eq!(reloaded.cached_score("demo::https://new-bad/"), Some(95));
        assert_eq!(
            fx.table.match_main_frame("https://old-bad/").unwrap().priority,
            3
        );
    }

    #[tokio::test]
    async fn test_sync_before_load_uses_stored_state() {
        let mut seed = StorageMap::new();
        seed.insert(keys::BLOCKED_URLS.into(), json!(["https://bad/"]));
        let fx = Fixture::new();
        let store = PolicyStore::new(
            Arc::new(MemoryStore::with_entries(seed)),
            fx.session.clone(),
            fx.table.clone(),
            fx.clock.clone(),
        );
        assert_eq!(store.sync_rules().await.unwrap(), 2);
        assert!(store.is_loaded());
    }

    #[tokio::test]
    async fn test_settings_persisted() {
        let fx = Fixture::new();
        let store = fx.store();
        store.set_score_mode(ScoreMode::Remote).await.into_value();
        store.set_api_key("secret").await.into_value();
        assert_eq!(fx.durable.value(keys::SCORE_MODE), Some(json!("remote")));
        assert_eq!(fx.durable.value(keys::API_KEY), Some(json!("secret")));
    }
}
