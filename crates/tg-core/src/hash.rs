//! Rule id hashing for ThreatGuard
//!
//! Dynamic rules are addressed by positive 31-bit integers. Ids are derived
//! from `purpose:url` with 32-bit FNV-1a so that the same URL always maps to
//! the same rule across calls and restarts.
//!
//! # Reserved Ids
//!
//! Id 0 is invalid in the rule engine and id 1 belongs to the catch-all
//! redirect rule. Both are remapped to 2.

use crate::types::RulePurpose;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Mask keeping ids in the positive 31-bit space.
pub const RULE_ID_MASK: u32 = 0x7fff_ffff;

/// Id of the catch-all redirect rule.
pub const CATCH_ALL_RULE_ID: u32 = 1;

/// First id available to derived rules.
pub const MIN_DERIVED_RULE_ID: u32 = 2;

/// 32-bit FNV-1a over UTF-16 code units.
///
/// Hashing code units rather than bytes keeps ids identical to the ones the
/// extension's JavaScript side derives for the same string.
#[inline]
pub fn fnv1a_utf16(input: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for unit in input.encode_utf16() {
        hash ^= unit as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Fold a raw hash into the derived rule id space.
#[inline]
pub const fn to_rule_id(hash: u32) -> u32 {
    let id = hash & RULE_ID_MASK;
    if id < MIN_DERIVED_RULE_ID {
        MIN_DERIVED_RULE_ID
    } else {
        id
    }
}

/// Derive the rule id for a (purpose, url) pair.
#[inline]
pub fn rule_id(purpose: RulePurpose, url: &str) -> u32 {
    to_rule_id(fnv1a_utf16(&format!("{}:{}", purpose.as_str(), url)))
}

/// Secondary id used when the primary id of a URL is already taken.
///
/// `attempt` starts at 1; each attempt salts the input differently.
#[inline]
pub fn probe_rule_id(purpose: RulePurpose, url: &str, attempt: u32) -> u32 {
    to_rule_id(fnv1a_utf16(&format!("{}#{}:{}", purpose.as_str(), attempt, url)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vectors() {
        // Reference values for 32-bit FNV-1a over ASCII input.
        assert_eq!(fnv1a_utf16(""), 0x811c9dc5);
        assert_eq!(fnv1a_utf16("a"), 0xe40c292c);
        assert_eq!(fnv1a_utf16("foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_rule_id_deterministic() {
        let a = rule_id(RulePurpose::Block, "https://example.com/a");
        let b = rule_id(RulePurpose::Block, "https://example.com/a");
        assert_eq!(a, b);
    }

    #[test]
    fn test_rule_id_depends_on_purpose() {
        let block = rule_id(RulePurpose::Block, "https://example.com/a");
        let allow = rule_id(RulePurpose::Allow, "https://example.com/a");
        assert_ne!(block, allow);
    }

    #[test]
    fn test_reserved_ids_remapped() {
        assert_eq!(to_rule_id(0), 2);
        assert_eq!(to_rule_id(1), 2);
        assert_eq!(to_rule_id(0x8000_0000), 2);
        assert_eq!(to_rule_id(0x8000_0001), 2);
        assert_eq!(to_rule_id(2), 2);
        assert_eq!(to_rule_id(0xffff_ffff), 0x7fff_ffff);
    }

    #[test]
    fn test_rule_id_never_reserved() {
        let urls = [
            "",
            "https://example.com/",
            "http://example.com/a?b=c",
            "https://例え.jp/パス",
            "https://very-long-domain-name.example.com/some/deep/path?with=query",
        ];
        for url in urls {
            for purpose in [RulePurpose::Block, RulePurpose::Allow] {
                let id = rule_id(purpose, url);
                assert!(id >= MIN_DERIVED_RULE_ID, "rule_id({url:?}) = {id}");
                assert!(id <= RULE_ID_MASK);
            }
        }
    }

    #[test]
    fn test_probe_differs_from_primary() {
        let url = "https://example.com/";
        let primary = rule_id(RulePurpose::Block, url);
        let probe = probe_rule_id(RulePurpose::Block, url, 1);
        assert_ne!(primary, probe);
        assert_ne!(probe, probe_rule_id(RulePurpose::Block, url, 2));
    }
}
