use serde::Serialize;

use crate::types::ScoreMode;

/// Point-in-time counters for the popup and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStats {
    pub cached_scores: usize,
    pub blocked_urls: usize,
    pub live_allows: usize,
    /// Page loads counted today; 0 once the date rolls over.
    pub daily_page_loads: u64,
    pub remote_avg_ms: Option<f64>,
    pub score_mode: ScoreMode,
}

impl PolicyStats {
    /// Average remote latency rounded to whole milliseconds.
    pub fn remote_avg_display(&self) -> String {
        match self.remote_avg_ms {
            Some(ms) => format!("{:.0} ms", ms),
            None => "n/a".to_string(),
        }
    }
}
