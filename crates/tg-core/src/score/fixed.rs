use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ScoreError, ScoreProvider, ScoreRequest};

/// Provider answering from a fixed table.
///
/// Counts calls, and can be made to fail or to take a while, which is what
/// deterministic simulations and tests of the decision path need.
#[derive(Debug, Default)]
pub struct FixedScorer {
    default_score: u8,
    scores: Mutex<HashMap<String, u8>>,
    delay: Mutex<Option<Duration>>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FixedScorer {
    pub fn new(default_score: u8) -> Self {
        Self {
            default_score: default_score.min(100),
            ..Self::default()
        }
    }

    /// Score returned for `url` (matched as given to the provider).
    pub fn with_score(self, url: &str, score: u8) -> Self {
        self.scores.lock().insert(url.to_string(), score.min(100));
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScoreProvider for FixedScorer {
    async fn score(&self, request: ScoreRequest<'_>) -> Result<u8, ScoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ScoreError::Provider {
                status: 500,
                body: "scorer failure".to_string(),
            });
        }
        let score = self.scores.lock().get(request.url).copied();
        Ok(score.unwrap_or(self.default_score))
    }
}
