//! ThreatGuard CLI
//!
//! Operate and inspect the ThreatGuard engine outside a browser. State lives
//! in a directory of JSON files (see `host`).

mod host;
mod simulate;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use tg_core::config::EngineConfig;
use tg_core::engine::spawn_prune_task;
use tg_core::hash::rule_id;
use tg_core::message::handle_message;
use tg_core::storage::StorageChange;
use tg_core::types::{RuleAction, RulePurpose, ScoreMode};
use tg_core::url::normalize_url;
use tg_core::watcher::{NavigationEvent, RuleMatch, MAIN_FRAME_ID};

use host::{Host, HostOptions};
use simulate::{run_simulation, SimulateOptions, DEFAULT_SEED};

#[derive(Parser)]
#[command(name = "tg-cli")]
#[command(about = "ThreatGuard navigation policy engine tools")]
struct Cli {
    /// Directory holding durable.json, session.json and rules.json
    #[arg(long, global = true, default_value = ".threatguard")]
    state_dir: PathBuf,

    /// JSON engine config (thresholds, TTL, endpoints)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Score every URL with this value instead of the configured provider
    #[arg(long, global = true, value_parser = clap::value_parser!(u8).range(0..=100))]
    score: Option<u8>,

    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum PurposeArg {
    Block,
    Allow,
}

impl From<PurposeArg> for RulePurpose {
    fn from(arg: PurposeArg) -> Self {
        match arg {
            PurposeArg::Block => RulePurpose::Block,
            PurposeArg::Allow => RulePurpose::Allow,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum ModeArg {
    Demo,
    Remote,
}

impl From<ModeArg> for ScoreMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Demo => ScoreMode::Demo,
            ModeArg::Remote => ScoreMode::Remote,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the normalized form of a URL
    Normalize { url: String },

    /// Print the rule id derived for a URL
    RuleId {
        #[arg(value_enum)]
        purpose: PurposeArg,
        url: String,
    },

    /// Simulate a top-level navigation and decide it
    Navigate {
        #[arg(long)]
        tab: i32,
        #[arg(long)]
        url: String,
    },

    /// Allow a URL for one allow period
    AllowOnce { url: String },

    /// Show what the interstitial would display for a tab
    BlockInfo {
        #[arg(long)]
        tab: i32,
    },

    /// Remove expired allow entries
    Prune,

    /// Print the installed rule table as JSON
    Rules,

    /// Show which installed rule wins for a top-level navigation
    Match { url: String },

    /// Show policy counters
    Stats,

    /// Select the score provider
    SetMode {
        #[arg(value_enum)]
        mode: ModeArg,
    },

    /// Store the reputation API key
    SetApiKey { key: String },

    /// Answer one raw protocol message (JSON)
    Message { json: String },

    /// Serve JSON lines from stdin until EOF: protocol messages, navigation
    /// events ({tabId, frameId, url}), rule matches ({ruleId, tabId, url})
    /// and settings changes ({key, newValue})
    Run,

    /// Run a synthetic multi-tab workload in memory
    Simulate {
        #[arg(long, default_value_t = 1000)]
        navigations: usize,
        #[arg(long, default_value_t = 8)]
        tabs: usize,
        #[arg(long, default_value_t = DEFAULT_SEED)]
        seed: u32,
        /// Provider latency in ms (uses a fixed low score)
        #[arg(long, default_value_t = 0)]
        provider_delay_ms: u64,
    },
}

fn init_logging(verbose: u8) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        tracing_subscriber::EnvFilter::new(level)
    });

    // Also routes `log` records from tg-core.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig, String> {
    let config = match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
            EngineConfig::from_json(&text)
                .map_err(|e| format!("Invalid config '{}': {}", path.display(), e))?
        }
        None => EngineConfig::default(),
    };
    config
        .validate()
        .map_err(|e| format!("Invalid config: {}", e))?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = load_config(cli.config.as_ref())?;

    // Commands that need no state.
    match &cli.command {
        Commands::Normalize { url } => {
            println!("{}", normalize_url(url));
            return Ok(());
        }
        Commands::RuleId { purpose, url } => {
            println!("{}", rule_id((*purpose).into(), &normalize_url(url)));
            return Ok(());
        }
        Commands::Simulate {
            navigations,
            tabs,
            seed,
            provider_delay_ms,
        } => {
            return run_simulation(SimulateOptions {
                navigations: *navigations,
                tabs: *tabs,
                seed: *seed,
                provider_delay_ms: *provider_delay_ms,
                config,
            })
            .await;
        }
        _ => {}
    }

    let host = Host::open(HostOptions {
        state_dir: cli.state_dir.clone(),
        config,
        fixed_score: cli.score,
    })
    .await?;

    let result = match cli.command {
        Commands::Navigate { tab, url } => cmd_navigate(&host, tab, &url).await,
        Commands::AllowOnce { url } => cmd_allow_once(&host, &url).await,
        Commands::BlockInfo { tab } => {
            let message = json!({ "type": "GET_BLOCK_INFO", "tabId": tab });
            print_json(&handle_message(&host.engine, message).await)
        }
        Commands::Prune => {
            let pruned = host.store().prune_expired_allows().await;
            println!("Pruned {} expired allow entries", pruned.value);
            pruned.persist.map_err(|e| e.to_string())
        }
        Commands::Rules => print_json(&host.table.rules()),
        Commands::Match { url } => cmd_match(&host, &url),
        Commands::Stats => cmd_stats(&host),
        Commands::SetMode { mode } => {
            let mode = ScoreMode::from(mode);
            host.store()
                .set_score_mode(mode)
                .await
                .into_result()
                .map_err(|e| format!("Failed to save score mode: {}", e))?;
            println!("Score mode: {}", mode);
            Ok(())
        }
        Commands::SetApiKey { key } => {
            host.store()
                .set_api_key(&key)
                .await
                .into_result()
                .map_err(|e| format!("Failed to save API key: {}", e))?;
            println!("API key saved ({} chars)", key.len());
            Ok(())
        }
        Commands::Message { json } => {
            let message: Value =
                serde_json::from_str(&json).map_err(|e| format!("Invalid message JSON: {}", e))?;
            print_json(&handle_message(&host.engine, message).await)
        }
        Commands::Run => cmd_run(&host).await,
        Commands::Normalize { .. } | Commands::RuleId { .. } | Commands::Simulate { .. } => Ok(()),
    };

    host.save_rules()?;
    result
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| format!("Failed to serialize: {}", e))?;
    println!("{}", text);
    Ok(())
}

async fn cmd_navigate(host: &Host, tab: i32, url: &str) -> Result<(), String> {
    let recorded = host
        .watcher
        .on_before_navigate(&NavigationEvent {
            tab_id: tab,
            frame_id: MAIN_FRAME_ID,
            url: url.to_string(),
        })
        .await;
    if !recorded {
        println!("Not intercepted: {}", url);
        return Ok(());
    }

    // The browser applies the rule table before the checking page runs.
    let Some(rule) = host.table.match_main_frame(url) else {
        println!("No rule matched: {}", url);
        return Ok(());
    };
    host.watcher
        .on_rule_matched(&RuleMatch {
            rule_id: rule.id,
            tab_id: tab,
            url: url.to_string(),
        })
        .await;

    match &rule.action {
        RuleAction::Allow => println!("Allowed by rule {}", rule.id),
        RuleAction::Redirect { redirect } if rule.id != tg_core::hash::CATCH_ALL_RULE_ID => {
            println!("Redirected to {} by rule {}", redirect.extension_path, rule.id);
        }
        RuleAction::Redirect { .. } => {
            let Some(pending) = host.store().pending(tab) else {
                return Err(format!("No pending navigation for tab {}", tab));
            };
            let verdict = host
                .engine
                .decide(tab, &pending.url)
                .await
                .map_err(|e| e.to_string())?;
            println!("Verdict: {}", verdict);
        }
    }

    for (tab_id, target) in host.navigator.navigations() {
        println!("  tab {} -> {}", tab_id, target);
    }
    Ok(())
}

async fn cmd_allow_once(host: &Host, url: &str) -> Result<(), String> {
    let expires_at = host
        .engine
        .allow_once(url)
        .await
        .map_err(|e| e.to_string())?;
    println!("Allowed {} until {}", normalize_url(url), expires_at);
    Ok(())
}

fn cmd_match(host: &Host, url: &str) -> Result<(), String> {
    match host.table.match_main_frame(url) {
        Some(rule) => {
            let kind = match &rule.action {
                RuleAction::Allow => "allow".to_string(),
                RuleAction::Redirect { redirect } => format!("redirect {}", redirect.extension_path),
            };
            println!("Rule {} (priority {}): {}", rule.id, rule.priority, kind);
        }
        None => println!("No rule matches {}", url),
    }
    Ok(())
}

fn cmd_stats(host: &Host) -> Result<(), String> {
    let stats = host.store().stats();
    println!("Policy state:");
    println!("  Score mode:       {}", stats.score_mode);
    println!("  Blocked URLs:     {}", stats.blocked_urls);
    println!("  Live allows:      {}", stats.live_allows);
    println!("  Cached scores:    {}", stats.cached_scores);
    println!("  Page loads today: {}", stats.daily_page_loads);
    println!("  Remote avg:       {}", stats.remote_avg_display());
    println!("  Installed rules:  {}", host.table.rules().len());
    Ok(())
}

async fn cmd_run(host: &Host) -> Result<(), String> {
    let period = Duration::from_secs(host.engine.config().prune_interval_secs);
    let prune = spawn_prune_task(host.engine.clone(), period);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(format!("Failed to read stdin: {}", e)),
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = serve_line(host, &line).await;
        println!("{}", reply);
        host.save_rules()?;
    };

    prune.abort();
    result
}

async fn serve_line(host: &Host, line: &str) -> Value {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return json!({ "ok": false }),
    };

    if value.get("type").is_some() {
        return handle_message(&host.engine, value).await;
    }
    if value.get("key").is_some() {
        return match serde_json::from_value::<StorageChange>(value) {
            Ok(change) => {
                let changed = host
                    .store()
                    .apply_storage_change(&change.key, change.new_value.as_ref())
                    .await;
                json!({ "ok": changed })
            }
            Err(_) => json!({ "ok": false }),
        };
    }
    if value.get("ruleId").is_some() {
        return match serde_json::from_value::<RuleMatch>(value) {
            Ok(matched) => json!({ "ok": host.watcher.on_rule_matched(&matched).await }),
            Err(_) => json!({ "ok": false }),
        };
    }
    match serde_json::from_value::<NavigationEvent>(value) {
        Ok(event) => json!({ "ok": host.watcher.on_before_navigate(&event).await }),
        Err(_) => json!({ "ok": false }),
    }
}
