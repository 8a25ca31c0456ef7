//! File-backed host for running the engine outside a browser.
//!
//! A state directory stands in for extension storage and the rule table:
//!
//! - `durable.json`: durable storage area
//! - `session.json`: session storage area
//! - `rules.json`: dynamic rule table, restored on open and written back on
//!   [`Host::save_rules`]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use tg_core::config::EngineConfig;
use tg_core::engine::DecisionEngine;
use tg_core::ports::{RecordingNavigator, SystemClock};
use tg_core::score::{FixedScorer, ScoreProviders};
use tg_core::storage::{KeyValueStore, StorageError, StorageMap};
use tg_core::store::PolicyStore;
use tg_core::table::{MemoryRuleTable, RuleTable};
use tg_core::types::Rule;
use tg_core::watcher::NavigationWatcher;

pub const DURABLE_FILE: &str = "durable.json";
pub const SESSION_FILE: &str = "session.json";
pub const RULES_FILE: &str = "rules.json";

// =============================================================================
// JSON File Store
// =============================================================================

/// Storage area kept as one JSON object on disk.
pub struct JsonFileStore {
    path: PathBuf,
    writes: AsyncMutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writes: AsyncMutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<StorageMap, StorageError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StorageMap::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(StorageMap::new());
        }
        match serde_json::from_str::<Value>(&text)? {
            Value::Object(map) => Ok(map),
            _ => Err(StorageError::Unavailable(format!(
                "'{}' does not hold a JSON object",
                self.path.display()
            ))),
        }
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, keys: &[&str]) -> Result<StorageMap, StorageError> {
        let mut all = self.read_all().await?;
        Ok(keys
            .iter()
            .filter_map(|k| all.remove(*k).map(|v| (k.to_string(), v)))
            .collect())
    }

    async fn set(&self, entries: StorageMap) -> Result<(), StorageError> {
        let _guard = self.writes.lock().await;
        let mut all = self.read_all().await?;
        all.extend(entries);
        let text = serde_json::to_string_pretty(&Value::Object(all))?;

        // Write then rename so a crash never leaves a half-written file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

// =============================================================================
// Host
// =============================================================================

pub struct HostOptions {
    pub state_dir: PathBuf,
    pub config: EngineConfig,
    /// Score every URL with this value instead of the configured providers.
    pub fixed_score: Option<u8>,
}

pub struct Host {
    pub engine: Arc<DecisionEngine>,
    pub watcher: NavigationWatcher,
    pub table: Arc<MemoryRuleTable>,
    pub navigator: Arc<RecordingNavigator>,
    rules_path: PathBuf,
}

impl Host {
    pub async fn open(opts: HostOptions) -> Result<Self, String> {
        fs::create_dir_all(&opts.state_dir).map_err(|e| {
            format!(
                "Failed to create state dir '{}': {}",
                opts.state_dir.display(),
                e
            )
        })?;

        let rules_path = opts.state_dir.join(RULES_FILE);
        let table = Arc::new(MemoryRuleTable::new());
        let installed = read_rules(&rules_path)?;
        if !installed.is_empty() {
            table
                .update_dynamic_rules(&[], installed)
                .await
                .map_err(|e| format!("Invalid rules in '{}': {}", rules_path.display(), e))?;
        }

        let providers = match opts.fixed_score {
            Some(score) => ScoreProviders::single(Arc::new(FixedScorer::new(score))),
            None => ScoreProviders::standard(&opts.config)
                .map_err(|e| format!("Failed to set up score providers: {}", e))?,
        };

        let store = Arc::new(PolicyStore::new(
            Arc::new(JsonFileStore::new(opts.state_dir.join(DURABLE_FILE))),
            Arc::new(JsonFileStore::new(opts.state_dir.join(SESSION_FILE))),
            table.clone(),
            Arc::new(SystemClock),
        ));
        let navigator = Arc::new(RecordingNavigator::new());
        let engine = Arc::new(DecisionEngine::new(
            store,
            providers,
            navigator.clone(),
            opts.config,
        ));
        let watcher = NavigationWatcher::for_engine(&engine);
        engine.store().ensure_loaded().await;

        Ok(Self {
            engine,
            watcher,
            table,
            navigator,
            rules_path,
        })
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        self.engine.store()
    }

    /// Mirror the rule table to `rules.json`.
    pub fn save_rules(&self) -> Result<(), String> {
        write_rules(&self.rules_path, &self.table.rules())
    }
}

pub fn read_rules(path: &Path) -> Result<Vec<Rule>, String> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| format!("Failed to parse '{}': {}", path.display(), e))
}

pub fn write_rules(path: &Path, rules: &[Rule]) -> Result<(), String> {
    let text = serde_json::to_string_pretty(rules)
        .map_err(|e| format!("Failed to serialize rules: {}", e))?;
    fs::write(path, text).map_err(|e| format!("Failed to write '{}': {}", path.display(), e))
}
