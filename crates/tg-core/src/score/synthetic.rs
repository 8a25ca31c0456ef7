use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{ScoreError, ScoreProvider, ScoreRequest};

/// Uniform random scores in `0..=100`. No I/O.
pub struct SyntheticScorer {
    rng: Mutex<StdRng>,
}

impl SyntheticScorer {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible sequence for demos and tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn next_score(&self) -> u8 {
        self.rng.lock().gen_range(0..=100)
    }
}

impl Default for SyntheticScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScoreProvider for SyntheticScorer {
    async fn score(&self, request: ScoreRequest<'_>) -> Result<u8, ScoreError> {
        let score = self.next_score();
        info!("Synthetic threat score for {}: {}/100", request.url, score);
        Ok(score)
    }
}
