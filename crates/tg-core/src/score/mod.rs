//! Threat score providers
//!
//! A provider turns a URL into a 0-100 score. The engine picks the provider
//! for the score mode in effect at the time of each decision.

mod fixed;
mod remote;
mod synthetic;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::types::ScoreMode;

pub use fixed::FixedScorer;
pub use remote::{parse_report, RemoteReputationScorer, UrlReport};
pub use synthetic::SyntheticScorer;

#[derive(Debug, thiserror::Error)]
pub enum ScoreError {
    /// The provider answered with a non-success status other than 404.
    #[error("Reputation lookup failed ({status}): {body}")]
    Provider { status: u16, body: String },
    #[error("Reputation request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Reputation response is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Input to a single score computation.
#[derive(Debug, Clone, Copy)]
pub struct ScoreRequest<'a> {
    /// URL as navigated (not normalized).
    pub url: &'a str,
    /// Credential for providers that need one. Empty when unset.
    pub credential: &'a str,
}

impl<'a> ScoreRequest<'a> {
    pub fn new(url: &'a str) -> Self {
        Self { url, credential: "" }
    }

    pub fn with_credential(mut self, credential: &'a str) -> Self {
        self.credential = credential;
        self
    }
}

#[async_trait]
pub trait ScoreProvider: Send + Sync {
    async fn score(&self, request: ScoreRequest<'_>) -> Result<u8, ScoreError>;
}

/// One provider per score mode.
#[derive(Clone)]
pub struct ScoreProviders {
    demo: Arc<dyn ScoreProvider>,
    remote: Arc<dyn ScoreProvider>,
}

impl ScoreProviders {
    pub fn new(demo: Arc<dyn ScoreProvider>, remote: Arc<dyn ScoreProvider>) -> Self {
        Self { demo, remote }
    }

    /// Random demo scores and the HTTP reputation client.
    pub fn standard(config: &EngineConfig) -> Result<Self, ScoreError> {
        Ok(Self::new(
            Arc::new(SyntheticScorer::new()),
            Arc::new(RemoteReputationScorer::new(&config.remote_endpoint)?),
        ))
    }

    /// Use `provider` for both modes.
    pub fn single(provider: Arc<dyn ScoreProvider>) -> Self {
        Self::new(provider.clone(), provider)
    }

    pub fn for_mode(&self, mode: ScoreMode) -> &Arc<dyn ScoreProvider> {
        match mode {
            ScoreMode::Demo => &self.demo,
            ScoreMode::Remote => &self.remote,
        }
    }
}
