//! Host-side capabilities the engine calls out to: wall-clock time and tab
//! navigation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{Local, TimeZone};
use parking_lot::Mutex;

use crate::types::{TabId, Timestamp};

// =============================================================================
// Clock
// =============================================================================

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> Timestamp;

    /// Local calendar date as `YYYY-MM-DD`.
    fn today(&self) -> String {
        local_date_key(self.now_ms())
    }
}

/// Format an epoch-millisecond instant as a local `YYYY-MM-DD` key.
pub fn local_date_key(now_ms: Timestamp) -> String {
    Local
        .timestamp_millis_opt(now_ms as i64)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
    today: Mutex<Option<String>>,
}

impl ManualClock {
    pub fn new(now_ms: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
            today: Mutex::new(None),
        }
    }

    pub fn set(&self, now_ms: Timestamp) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Pin the calendar date, independent of the host time zone.
    pub fn set_today(&self, date: &str) {
        *self.today.lock() = Some(date.to_string());
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }

    fn today(&self) -> String {
        match self.today.lock().as_ref() {
            Some(date) => date.clone(),
            None => local_date_key(self.now_ms()),
        }
    }
}

// =============================================================================
// Tab Navigation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to navigate tab {tab_id}: {reason}")]
pub struct NavigateError {
    pub tab_id: TabId,
    pub reason: String,
}

#[async_trait]
pub trait TabNavigator: Send + Sync {
    /// Point `tab_id` at `url`.
    async fn navigate(&self, tab_id: TabId, url: &str) -> Result<(), NavigateError>;
}

/// Navigator that records every request instead of acting on it.
#[derive(Debug, Default)]
pub struct RecordingNavigator {
    log: Mutex<Vec<(TabId, String)>>,
    fail: AtomicBool,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn navigations(&self) -> Vec<(TabId, String)> {
        self.log.lock().clone()
    }

    pub fn last_for(&self, tab_id: TabId) -> Option<String> {
        self.log
            .lock()
            .iter()
            .rev()
            .find(|(tab, _)| *tab == tab_id)
            .map(|(_, url)| url.clone())
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TabNavigator for RecordingNavigator {
    async fn navigate(&self, tab_id: TabId, url: &str) -> Result<(), NavigateError> {
        self.log.lock().push((tab_id, url.to_string()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(NavigateError {
                tab_id,
                reason: "tab closed".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_pinned_date() {
        let clock = ManualClock::new(0);
        clock.set_today("2026-01-02");
        assert_eq!(clock.today(), "2026-01-02");
    }

    #[test]
    fn test_local_date_key_shape() {
        let key = local_date_key(1_700_000_000_000);
        assert_eq!(key.len(), 10);
        assert_eq!(&key[4..5], "-");
    }

    #[tokio::test]
    async fn test_recording_navigator() {
        let nav = RecordingNavigator::new();
        nav.navigate(1, "https://a/").await.unwrap();
        nav.navigate(2, "https://b/").await.unwrap();
        nav.navigate(1, "https://c/").await.unwrap();
        assert_eq!(nav.last_for(1).as_deref(), Some("https://c/"));
        assert_eq!(nav.navigations().len(), 3);

        nav.set_fail(true);
        assert!(nav.navigate(1, "https://d/").await.is_err());
    }
}
