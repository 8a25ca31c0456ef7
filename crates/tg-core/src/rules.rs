//! Declarative rule construction
//!
//! The rule table is always rebuilt from scratch: one catch-all redirect,
//! one block rule per blocked URL and one allow rule per live allow entry.
//! Priorities keep block > allow > catch-all so a URL that is blocked and
//! (stale) allowed is still blocked.

use std::collections::HashMap;

use log::warn;

use crate::hash::{probe_rule_id, rule_id, CATCH_ALL_RULE_ID};
use crate::types::{RedirectTarget, ResourceType, Rule, RuleAction, RuleCondition, RulePurpose};
use crate::url::exact_match_regex;

pub const CATCH_ALL_PRIORITY: u32 = 1;
pub const ALLOW_PRIORITY: u32 = 2;
pub const BLOCK_PRIORITY: u32 = 3;

/// Entry page that runs the decision for unclassified navigations.
pub const CHECKING_PAGE: &str = "/checking.html";
/// Interstitial for blocked and warned URLs.
pub const WARNING_PAGE: &str = "/warning.html";

pub const CATCH_ALL_REGEX: &str = "^https?://.*";

fn main_frame(regex_filter: String) -> RuleCondition {
    RuleCondition {
        regex_filter,
        resource_types: vec![ResourceType::MainFrame],
    }
}

fn redirect_to(path: &str) -> RuleAction {
    RuleAction::Redirect {
        redirect: RedirectTarget {
            extension_path: path.to_string(),
        },
    }
}

/// Lowest priority rule sending every top-level http(s) navigation to the
/// checking page.
pub fn catch_all_rule() -> Rule {
    Rule {
        id: CATCH_ALL_RULE_ID,
        priority: CATCH_ALL_PRIORITY,
        action: redirect_to(CHECKING_PAGE),
        condition: main_frame(CATCH_ALL_REGEX.to_string()),
    }
}

pub fn block_rule(id: u32, normalized_url: &str) -> Rule {
    Rule {
        id,
        priority: BLOCK_PRIORITY,
        action: redirect_to(WARNING_PAGE),
        condition: main_frame(exact_match_regex(normalized_url)),
    }
}

pub fn allow_rule(id: u32, normalized_url: &str) -> Rule {
    Rule {
        id,
        priority: ALLOW_PRIORITY,
        action: RuleAction::Allow,
        condition: main_frame(exact_match_regex(normalized_url)),
    }
}

// =============================================================================
// Rule Set Builder
// =============================================================================

/// Assembles a rule set with unique ids.
///
/// Each URL first takes its hashed id. If that id is already used by another
/// rule in the set, salted secondary hashes are probed until a free one is
/// found.
pub struct RuleSetBuilder {
    owners: HashMap<u32, (RulePurpose, String)>,
    rules: Vec<Rule>,
    collisions: usize,
}

impl RuleSetBuilder {
    pub fn new() -> Self {
        let catch_all = catch_all_rule();
        let mut owners = HashMap::new();
        owners.insert(catch_all.id, (RulePurpose::Allow, String::new()));
        Self {
            owners,
            rules: vec![catch_all],
            collisions: 0,
        }
    }

    fn assign_id(&mut self, purpose: RulePurpose, url: &str) -> u32 {
        let mut id = rule_id(purpose, url);
        let mut attempt = 0u32;
        while self.owners.contains_key(&id) {
            attempt += 1;
            id = probe_rule_id(purpose, url, attempt);
        }
        if attempt > 0 {
            self.collisions += 1;
            warn!(
                "Rule id collision for {} rule on {}, resolved after {} probe(s)",
                purpose.as_str(),
                url,
                attempt
            );
        }
        self.owners.insert(id, (purpose, url.to_string()));
        id
    }

    pub fn add_block(&mut self, normalized_url: &str) -> &mut Self {
        let id = self.assign_id(RulePurpose::Block, normalized_url);
        self.rules.push(block_rule(id, normalized_url));
        self
    }

    pub fn add_allow(&mut self, normalized_url: &str) -> &mut Self {
        let id = self.assign_id(RulePurpose::Allow, normalized_url);
        self.rules.push(allow_rule(id, normalized_url));
        self
    }

    /// Number of ids that needed a secondary hash.
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    /// Id map of the set built so far: rule id -> (purpose, url).
    pub fn owner(&self, id: u32) -> Option<(RulePurpose, &str)> {
        self.owners
            .get(&id)
            .map(|(purpose, url)| (*purpose, url.as_str()))
    }

    pub fn build(self) -> Vec<Rule> {
        self.rules
    }
}

impl Default for RuleSetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A built rule set and how many ids needed a secondary hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub collisions: usize,
}

/// Build the complete desired rule set.
///
/// URLs are sorted (and deduplicated) before ids are assigned, so the same
/// state always produces the same table.
pub fn assemble_rule_set<'a, B, A>(blocked: B, allowed: A) -> RuleSet
where
    B: IntoIterator<Item = &'a str>,
    A: IntoIterator<Item = &'a str>,
{
    let mut blocked: Vec<&str> = blocked.into_iter().collect();
    blocked.sort_unstable();
    blocked.dedup();

    let mut allowed: Vec<&str> = allowed.into_iter().collect();
    allowed.sort_unstable();
    allowed.dedup();

    let mut builder = RuleSetBuilder::new();
    for url in blocked {
        builder.add_block(url);
    }
    for url in allowed {
        builder.add_allow(url);
    }
    RuleSet {
        collisions: builder.collisions(),
        rules: builder.build(),
    }
}

/// Rules of [`assemble_rule_set`], without the collision count.
pub fn build_rule_set<'a, B, A>(blocked: B, allowed: A) -> Vec<Rule>
where
    B: IntoIterator<Item = &'a str>,
    A: IntoIterator<Item = &'a str>,
{
    assemble_rule_set(blocked, allowed).rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_empty_state_has_only_catch_all() {
        let rules = build_rule_set(Vec::<&str>::new(), Vec::<&str>::new());
        assert_eq!(rules, vec![catch_all_rule()]);
        assert_eq!(rules[0].id, 1);
        assert_eq!(rules[0].priority, 1);
    }

    #[test]
    fn test_rule_set_contents() {
        let rules = build_rule_set(
            ["https://bad.example/"],
            ["https://good.example/a", "https://good.example/b"],
        );
        assert_eq!(rules.len(), 4);

        let block = &rules[1];
        assert_eq!(block.priority, BLOCK_PRIORITY);
        assert_eq!(block.id, rule_id(RulePurpose::Block, "https://bad.example/"));
        assert_eq!(block.condition.regex_filter, "^https://bad\\.example/$");
        assert!(block.is_redirect());

        assert!(rules[2..].iter().all(|r| r.priority == ALLOW_PRIORITY));
        assert!(rules[2..].iter().all(|r| r.action == RuleAction::Allow));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(BLOCK_PRIORITY > ALLOW_PRIORITY);
        assert!(ALLOW_PRIORITY > CATCH_ALL_PRIORITY);
    }

    #[test]
    fn test_deterministic_regardless_of_input_order() {
        let a = build_rule_set(["https://b/", "https://a/"], ["https://c/"]);
        let b = build_rule_set(["https://a/", "https://b/"], ["https://c/"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_duplicate_urls_collapse() {
        let rules = build_rule_set(["https://a/", "https://a/"], Vec::<&str>::new());
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn test_assemble_reports_collisions() {
        let set = assemble_rule_set(
            ["https://b/", "https://a/", "https://b/"],
            ["https://c/"],
        );
        assert_eq!(set.collisions, 0);
        assert_eq!(set.rules.len(), 4);
        assert_eq!(
            set.rules,
            build_rule_set(["https://a/", "https://b/"], ["https://c/"])
        );
    }

    #[test]
    fn test_ids_unique_for_many_urls() {
        let urls: Vec<String> = (0..5000)
            .map(|i| format!("https://site{}.example/path", i))
            .collect();
        let rules = build_rule_set(
            urls.iter().map(String::as_str),
            urls.iter().map(String::as_str),
        );
        let ids: HashSet<u32> = rules.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), rules.len());
        assert!(rules.iter().skip(1).all(|r| r.id >= 2));
    }

    #[test]
    fn test_builder_resolves_collision() {
        let mut builder = RuleSetBuilder::new();
        builder.add_block("https://a.example/");
        // Same URL and purpose hash to the same primary id.
        builder.add_block("https://a.example/");
        assert_eq!(builder.collisions(), 1);

        let rules = builder.build();
        assert_ne!(rules[1].id, rules[2].id);
        assert_eq!(
            rules[2].id,
            probe_rule_id(RulePurpose::Block, "https://a.example/", 1)
        );
    }

    #[test]
    fn test_builder_owner_lookup() {
        let mut builder = RuleSetBuilder::new();
        builder.add_allow("https://a.example/");
        let id = rule_id(RulePurpose::Allow, "https://a.example/");
        assert_eq!(builder.owner(id), Some((RulePurpose::Allow, "https://a.example/")));
    }
}
