//! Dynamic rule table
//!
//! The platform's request filtering engine, seen as a table of rules that is
//! read in full and replaced with a single remove-then-add call.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;

use crate::hash::RULE_ID_MASK;
use crate::types::Rule;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleTableError {
    #[error("Invalid rule id: {0}")]
    InvalidId(u32),
    #[error("Duplicate rule id: {0}")]
    DuplicateId(u32),
    #[error("Rule {id} has an invalid regex filter: {reason}")]
    InvalidRegex { id: u32, reason: String },
    #[error("Rule table unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RuleTable: Send + Sync {
    /// All dynamic rules currently installed.
    async fn get_dynamic_rules(&self) -> Result<Vec<Rule>, RuleTableError>;

    /// Remove `remove_rule_ids`, then add `add_rules`, as one atomic update.
    async fn update_dynamic_rules(
        &self,
        remove_rule_ids: &[u32],
        add_rules: Vec<Rule>,
    ) -> Result<(), RuleTableError>;
}

// =============================================================================
// In-memory Rule Table
// =============================================================================

struct CompiledRule {
    rule: Rule,
    regex: Regex,
}

/// Rule table held in process memory.
///
/// Validates updates the way the browser does (positive 31-bit ids, unique
/// ids, compilable regex) and rejects the whole update on the first problem.
#[derive(Default)]
pub struct MemoryRuleTable {
    rules: Mutex<Vec<CompiledRule>>,
    fail_updates: AtomicBool,
    updates: AtomicUsize,
}

impl MemoryRuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installed rules, in insertion order.
    pub fn rules(&self) -> Vec<Rule> {
        self.rules.lock().iter().map(|c| c.rule.clone()).collect()
    }

    /// Number of successful updates.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Highest priority rule matching a top-level navigation to `url`.
    pub fn match_main_frame(&self, url: &str) -> Option<Rule> {
        let rules = self.rules.lock();
        let mut best: Option<&CompiledRule> = None;
        for compiled in rules.iter() {
            if !compiled.regex.is_match(url) {
                continue;
            }
            let better = match best {
                Some(current) => compiled.rule.priority > current.rule.priority,
                None => true,
            };
            if better {
                best = Some(compiled);
            }
        }
        best.map(|c| c.rule.clone())
    }

    fn compile(rule: Rule) -> Result<CompiledRule, RuleTableError> {
        if rule.id == 0 || rule.id > RULE_ID_MASK {
            return Err(RuleTableError::InvalidId(rule.id));
        }
        let regex = Regex::new(&rule.condition.regex_filter).map_err(|e| {
            RuleTableError::InvalidRegex {
                id: rule.id,
                reason: e.to_string(),
            }
        })?;
        Ok(CompiledRule { rule, regex })
    }
}

#[async_trait]
impl RuleTable for MemoryRuleTable {
    async fn get_dynamic_rules(&self) -> Result<Vec<Rule>, RuleTableError> {
        Ok(self.rules())
    }

    async fn update_dynamic_rules(
        &self,
        remove_rule_ids: &[u32],
        add_rules: Vec<Rule>,
    ) -> Result<(), RuleTableError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(RuleTableError::Unavailable("updates disabled".to_string()));
        }

        let mut rules = self.rules.lock();
        let remove: HashSet<u32> = remove_rule_ids.iter().copied().collect();
        let mut ids: HashSet<u32> = rules
            .iter()
            .map(|c| c.rule.id)
            .filter(|id| !remove.contains(id))
            .collect();

        let mut compiled = Vec::with_capacity(add_rules.len());
        for rule in add_rules {
            if !ids.insert(rule.id) {
                return Err(RuleTableError::DuplicateId(rule.id));
            }
            compiled.push(Self::compile(rule)?);
        }

        rules.retain(|c| !remove.contains(&c.rule.id));
        rules.extend(compiled);
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
