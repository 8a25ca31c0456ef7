use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tg_core::config::EngineConfig;
use tg_core::engine::{DecisionEngine, Verdict};
use tg_core::ports::{RecordingNavigator, SystemClock};
use tg_core::score::{FixedScorer, ScoreProvider, ScoreProviders, SyntheticScorer};
use tg_core::storage::MemoryStore;
use tg_core::store::PolicyStore;
use tg_core::table::MemoryRuleTable;
use tg_core::watcher::{NavigationEvent, NavigationWatcher, RuleMatch, MAIN_FRAME_ID};

pub const DEFAULT_SEED: u32 = 0x7467_0001;

pub struct SimulateOptions {
    pub navigations: usize,
    pub tabs: usize,
    pub seed: u32,
    /// Artificial provider latency, to make concurrent tabs overlap.
    pub provider_delay_ms: u64,
    pub config: EngineConfig,
}

#[derive(Clone)]
struct SimNavigation {
    tab_id: i32,
    url: String,
}

struct SimResult {
    op_count: usize,
    total_ms: f64,
    avg_us: f64,
    p50_us: f64,
    p95_us: f64,
    p99_us: f64,
    verdicts: BTreeMap<&'static str, usize>,
    failures: usize,
}

/// Run a synthetic browsing workload against an in-memory engine.
///
/// Each navigation goes through the same path the extension takes: the
/// before-navigate and catch-all events, then a decision on the pending URL.
/// Tabs run concurrently.
pub async fn run_simulation(opts: SimulateOptions) -> Result<(), String> {
    if opts.tabs == 0 {
        return Err("--tabs must be at least 1".to_string());
    }

    println!("============================================================");
    println!("ThreatGuard Simulation");
    println!("============================================================");

    let table = Arc::new(MemoryRuleTable::new());
    let store = Arc::new(PolicyStore::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
        table.clone(),
        Arc::new(SystemClock),
    ));
    let scorer: Arc<dyn ScoreProvider> = if opts.provider_delay_ms > 0 {
        Arc::new(
            FixedScorer::new(10).with_delay(Duration::from_millis(opts.provider_delay_ms)),
        )
    } else {
        Arc::new(SyntheticScorer::seeded(opts.seed as u64))
    };
    let engine = Arc::new(DecisionEngine::new(
        store,
        ScoreProviders::single(scorer),
        Arc::new(RecordingNavigator::new()),
        opts.config,
    ));
    let watcher = Arc::new(NavigationWatcher::for_engine(&engine));

    let workload = generate_workload(opts.navigations, opts.tabs, opts.seed);
    println!(
        "Workload: {} navigations across {} tabs (seed {:#x})",
        workload.len(),
        opts.tabs,
        opts.seed
    );

    let result = run_workload(&engine, &watcher, &workload, opts.tabs).await;
    println!("{}", format_result(&result));

    let stats = engine.store().stats();
    println!("------------------------------------------------------------");
    println!("Final state:");
    println!("  Blocked URLs:   {}", stats.blocked_urls);
    println!("  Live allows:    {}", stats.live_allows);
    println!("  Cached scores:  {}", stats.cached_scores);
    println!("  Page loads:     {}", stats.daily_page_loads);
    println!("  Installed rules: {}", table.rules().len());
    Ok(())
}

async fn run_workload(
    engine: &Arc<DecisionEngine>,
    watcher: &Arc<NavigationWatcher>,
    workload: &[SimNavigation],
    tabs: usize,
) -> SimResult {
    let start = Instant::now();
    let mut handles = Vec::with_capacity(tabs);

    for tab in 0..tabs {
        let tab_id = tab as i32 + 1;
        let mine: Vec<SimNavigation> = workload
            .iter()
            .filter(|nav| nav.tab_id == tab_id)
            .cloned()
            .collect();
        let engine = engine.clone();
        let watcher = watcher.clone();

        handles.push(tokio::spawn(async move {
            let mut samples = Vec::with_capacity(mine.len());
            for nav in mine {
                let op_start = Instant::now();
                let outcome = navigate(&engine, &watcher, &nav).await;
                samples.push((op_start.elapsed().as_secs_f64() * 1_000_000.0, outcome));
            }
            samples
        }));
    }

    let mut latencies = Vec::with_capacity(workload.len());
    let mut verdicts = BTreeMap::new();
    let mut failures = 0usize;
    for handle in handles {
        let Ok(samples) = handle.await else {
            failures += 1;
            continue;
        };
        for (us, outcome) in samples {
            latencies.push(us);
            match outcome {
                Some(verdict) => *verdicts.entry(verdict_label(&verdict)).or_insert(0) += 1,
                None => failures += 1,
            }
        }
    }

    let total_ms = start.elapsed().as_secs_f64() * 1000.0;
    latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let avg_us = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<f64>() / latencies.len() as f64
    };

    SimResult {
        op_count: latencies.len(),
        total_ms,
        avg_us,
        p50_us: percentile(&latencies, 0.50),
        p95_us: percentile(&latencies, 0.95),
        p99_us: percentile(&latencies, 0.99),
        verdicts,
        failures,
    }
}

async fn navigate(
    engine: &DecisionEngine,
    watcher: &NavigationWatcher,
    nav: &SimNavigation,
) -> Option<Verdict> {
    watcher
        .on_before_navigate(&NavigationEvent {
            tab_id: nav.tab_id,
            frame_id: MAIN_FRAME_ID,
            url: nav.url.clone(),
        })
        .await;
    watcher
        .on_rule_matched(&RuleMatch {
            rule_id: tg_core::hash::CATCH_ALL_RULE_ID,
            tab_id: nav.tab_id,
            url: nav.url.clone(),
        })
        .await;

    // What CHECK_URL does, keeping the verdict.
    let pending = engine.store().pending(nav.tab_id)?;
    engine.decide(nav.tab_id, &pending.url).await.ok()
}

fn verdict_label(verdict: &Verdict) -> &'static str {
    match verdict {
        Verdict::Ignored => "ignored",
        Verdict::AlreadyBlocked { .. } => "already_blocked",
        Verdict::AllowListed { .. } => "allow_listed",
        Verdict::Duplicate => "duplicate",
        Verdict::Blocked { .. } => "blocked",
        Verdict::Warned { .. } => "warned",
        Verdict::Allowed { .. } => "allowed",
    }
}

fn format_result(result: &SimResult) -> String {
    let mut out = format!(
        "Decisions:\n  Ops: {}\n  Total: {:.2} ms\n  Avg: {:.2} us\n  P50: {:.2} us\n  P95: {:.2} us\n  P99: {:.2} us\n  Failures: {}",
        result.op_count,
        result.total_ms,
        result.avg_us,
        result.p50_us,
        result.p95_us,
        result.p99_us,
        result.failures,
    );
    out.push_str("\nVerdicts:");
    for (label, count) in &result.verdicts {
        out.push_str(&format!("\n  {:<16} {}", label, count));
    }
    out
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let idx = ((values.len() as f64) * p).ceil() as usize;
    let idx = idx.saturating_sub(1).min(values.len() - 1);
    values[idx]
}

fn create_rng(seed: u32) -> impl FnMut() -> f64 {
    let mut state = seed;
    move || {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        (state as f64) / (u32::MAX as f64)
    }
}

fn pick<T: Clone>(items: &[T], rand: &mut impl FnMut() -> f64) -> T {
    let idx = (rand() * items.len() as f64).floor() as usize;
    items[idx.min(items.len() - 1)].clone()
}

fn generate_workload(count: usize, tabs: usize, seed: u32) -> Vec<SimNavigation> {
    const SITES: &[&str] = &[
        "example.com",
        "github.com",
        "wikipedia.org",
        "news.example.org",
        "shop.example.net",
        "login-verify.example.xyz",
        "free-prizes.example.top",
        "cdn.example.io",
    ];
    const PATHS: &[&str] = &[
        "/",
        "/index.html",
        "/search?q=rust",
        "/account/login",
        "/article/42#comments",
        "/download?file=setup.exe",
    ];

    let mut rng = create_rng(seed);
    let mut workload = Vec::with_capacity(count);
    for _ in 0..count {
        let tab_id = (rng() * tabs as f64).floor() as usize % tabs.max(1) + 1;
        let scheme = if rng() < 0.9 { "https" } else { "http" };
        workload.push(SimNavigation {
            tab_id: tab_id as i32,
            url: format!("{}://{}{}", scheme, pick(SITES, &mut rng), pick(PATHS, &mut rng)),
        });
    }
    workload
}
