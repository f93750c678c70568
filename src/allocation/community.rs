//! Community inference for inbound leads.
//!
//! Precedence: an explicit `[COMMUNITY:x]` tag in the remark, then the
//! highest-priority keyword rule matching any free-text field, then the
//! first community in the domain. Inference itself never fails; only a
//! storage error aborts resolution.

use diesel::prelude::*;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::allocation::types::{CommunityKeywordRule, LeadInput};
use crate::shared::schema::{communities, community_keywords};

static COMMUNITY_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[COMMUNITY:([^\]]+)\]").expect("valid community tag pattern"));

pub fn extract_tagged_community(remark: &str) -> Option<String> {
    COMMUNITY_TAG
        .captures(remark)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Highest-priority keyword rule any of whose keywords occurs as a
/// case-insensitive substring of any input field. Ties break by priority
/// descending, then rule id ascending.
pub fn match_keyword_rules(rules: &[CommunityKeywordRule], fields: &[&str]) -> Option<String> {
    let lowered: Vec<String> = fields.iter().map(|f| f.to_lowercase()).collect();
    let mut ranked: Vec<&CommunityKeywordRule> = rules.iter().collect();
    ranked.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    for rule in ranked {
        let hit = rule.keywords.iter().any(|kw| {
            let kw = kw.to_lowercase();
            !kw.is_empty() && lowered.iter().any(|f| f.contains(&kw))
        });
        if hit {
            return Some(rule.community.clone());
        }
    }
    None
}

pub fn resolve_from_parts(
    remark: Option<&str>,
    campaignname: Option<&str>,
    unitname: Option<&str>,
    known: &[String],
    keyword_rules: &[CommunityKeywordRule],
) -> String {
    if let Some(tag) = remark.and_then(extract_tagged_community) {
        if known.iter().any(|c| c == &tag) {
            return tag;
        }
        log::warn!("remark carries unknown community tag {:?}, ignoring", tag);
    }

    let fields: Vec<&str> = [remark, campaignname, unitname]
        .into_iter()
        .flatten()
        .collect();
    if let Some(community) = match_keyword_rules(keyword_rules, &fields) {
        return community;
    }

    match known.first() {
        Some(default) => default.clone(),
        None => {
            log::error!("community domain is empty, falling back to 'unknown'");
            "unknown".to_string()
        }
    }
}

pub fn load_community_domain(conn: &mut PgConnection) -> QueryResult<Vec<String>> {
    communities::table
        .order((communities::sort_order.asc(), communities::id.asc()))
        .select(communities::name)
        .load(conn)
}

pub fn resolve_community(conn: &mut PgConnection, input: &LeadInput) -> QueryResult<String> {
    let known = load_community_domain(conn)?;
    let keyword_rules: Vec<CommunityKeywordRule> = community_keywords::table.load(conn)?;
    Ok(resolve_from_parts(
        input.remark.as_deref(),
        input.campaignname.as_deref(),
        input.unitname.as_deref(),
        &known,
        &keyword_rules,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(id: i64, keywords: &[&str], community: &str, priority: i32) -> CommunityKeywordRule {
        CommunityKeywordRule {
            id,
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            community: community.to_string(),
            priority,
        }
    }

    fn domain() -> Vec<String> {
        vec![
            "riverside".to_string(),
            "parkside".to_string(),
            "central".to_string(),
        ]
    }

    #[test]
    fn explicit_tag_beats_keyword_match() {
        let rules = vec![kw(1, &["parkside"], "parkside", 10)];
        let resolved = resolve_from_parts(
            Some("[COMMUNITY:central] ad mentions parkside towers"),
            None,
            None,
            &domain(),
            &rules,
        );
        assert_eq!(resolved, "central");
    }

    #[test]
    fn unknown_tag_falls_through_to_keywords() {
        let rules = vec![kw(1, &["parkside"], "parkside", 10)];
        let resolved = resolve_from_parts(
            Some("[COMMUNITY:atlantis] parkside towers"),
            None,
            None,
            &domain(),
            &rules,
        );
        assert_eq!(resolved, "parkside");
    }

    #[test]
    fn keyword_matches_any_field_case_insensitively() {
        let rules = vec![kw(1, &["PARKSIDE"], "parkside", 0)];
        let resolved =
            resolve_from_parts(None, Some("summer parkside push"), None, &domain(), &rules);
        assert_eq!(resolved, "parkside");
    }

    #[test]
    fn higher_priority_keyword_rule_wins() {
        let rules = vec![
            kw(1, &["tower"], "parkside", 1),
            kw(2, &["tower"], "central", 5),
        ];
        let resolved = resolve_from_parts(Some("tower campaign"), None, None, &domain(), &rules);
        assert_eq!(resolved, "central");
    }

    #[test]
    fn equal_priority_breaks_ties_by_rule_id() {
        let rules = vec![
            kw(9, &["tower"], "central", 3),
            kw(2, &["tower"], "parkside", 3),
        ];
        let resolved = resolve_from_parts(Some("tower campaign"), None, None, &domain(), &rules);
        assert_eq!(resolved, "parkside");
    }

    #[test]
    fn no_match_falls_back_to_first_domain_value() {
        let resolved = resolve_from_parts(Some("no hints here"), None, None, &domain(), &[]);
        assert_eq!(resolved, "riverside");
    }

    #[test]
    fn empty_keyword_never_matches() {
        let rules = vec![kw(1, &[""], "central", 99)];
        let resolved = resolve_from_parts(Some("anything"), None, None, &domain(), &rules);
        assert_eq!(resolved, "riverside");
    }
}
