//! Rule predicate evaluation and rule selection.

use chrono::{Datelike, NaiveDateTime, NaiveTime};

use crate::allocation::types::{AllocationRule, RuleConditions, RuleKind, TimeWindow};
use crate::shared::errors::EngineError;

#[derive(Debug, Clone)]
pub struct MatchContext<'a> {
    pub source: &'a str,
    pub leadtype: Option<&'a str>,
    pub community: &'a str,
    /// Local wall-clock time of the inbound event.
    pub now: NaiveDateTime,
}

fn set_matches(set: &Option<Vec<String>>, value: Option<&str>) -> bool {
    match set {
        Some(values) if !values.is_empty() => match value {
            Some(v) => values.iter().any(|s| s == v),
            None => false,
        },
        _ => true,
    }
}

fn parse_clock(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

fn window_matches(window: &TimeWindow, now: NaiveDateTime) -> bool {
    if let Some(weekdays) = &window.weekdays {
        if !weekdays.is_empty() {
            let today = now.weekday().number_from_monday();
            if !weekdays.contains(&today) {
                return false;
            }
        }
    }
    let time = now.time();
    match (
        window.start.as_deref().and_then(parse_clock),
        window.end.as_deref().and_then(parse_clock),
    ) {
        (Some(start), Some(end)) => {
            if start <= end {
                time >= start && time <= end
            } else {
                // window spans midnight
                time >= start || time <= end
            }
        }
        (Some(start), None) => time >= start,
        (None, Some(end)) => time <= end,
        (None, None) => true,
    }
}

fn conditions_match(conditions: &RuleConditions, ctx: &MatchContext<'_>) -> bool {
    if !set_matches(&conditions.sources, Some(ctx.source)) {
        return false;
    }
    if !set_matches(&conditions.lead_types, ctx.leadtype) {
        return false;
    }
    if !set_matches(&conditions.communities, Some(ctx.community)) {
        return false;
    }
    match &conditions.time_ranges {
        Some(window) => window_matches(window, ctx.now),
        None => true,
    }
}

pub fn rule_matches(rule: &AllocationRule, ctx: &MatchContext<'_>) -> bool {
    match &rule.kind {
        RuleKind::Default => true,
        RuleKind::Conditional(conditions) => conditions_match(conditions, ctx),
    }
}

/// Orders the rule set (priority descending, creation time ascending) and
/// returns the first match. The mandatory fallback rule makes a miss an
/// invariant violation, not a normal outcome.
pub fn select_rule<'a>(
    rules: &'a mut Vec<AllocationRule>,
    ctx: &MatchContext<'_>,
) -> Result<&'a AllocationRule, EngineError> {
    rules.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
    rules
        .iter()
        .find(|rule| rule_matches(rule, ctx))
        .ok_or(EngineError::RuleInvariantViolation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    fn ctx<'a>(source: &'a str, community: &'a str, now: NaiveDateTime) -> MatchContext<'a> {
        MatchContext {
            source,
            leadtype: None,
            community,
            now,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn rule(name: &str, priority: i32, kind: RuleKind, created_secs: i64) -> AllocationRule {
        AllocationRule {
            id: Uuid::new_v4(),
            name: name.to_string(),
            priority,
            kind,
            user_groups: vec![1],
            method: None,
            enable_permission_check: false,
            enable_community_matching: true,
            created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
        }
    }

    fn conditional(sources: &[&str]) -> RuleKind {
        RuleKind::Conditional(RuleConditions {
            sources: Some(sources.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        })
    }

    #[test]
    fn conditional_rule_beats_fallback_when_source_matches() {
        let mut rules = vec![
            rule("fallback", 0, RuleKind::Default, 0),
            rule("douyin", 50, conditional(&["douyin"]), 10),
        ];
        let now = at(2025, 6, 2, 10, 0);
        let selected = select_rule(&mut rules, &ctx("douyin", "riverside", now)).unwrap();
        assert_eq!(selected.name, "douyin");
    }

    #[test]
    fn fallback_matches_when_no_conditional_rule_does() {
        let mut rules = vec![
            rule("fallback", 0, RuleKind::Default, 0),
            rule("douyin", 50, conditional(&["douyin"]), 10),
        ];
        let now = at(2025, 6, 2, 10, 0);
        let selected = select_rule(&mut rules, &ctx("walk_in", "riverside", now)).unwrap();
        assert_eq!(selected.name, "fallback");
    }

    #[test]
    fn missing_fallback_is_an_invariant_violation() {
        let mut rules = vec![rule("douyin", 50, conditional(&["douyin"]), 10)];
        let now = at(2025, 6, 2, 10, 0);
        let err = select_rule(&mut rules, &ctx("walk_in", "riverside", now)).unwrap_err();
        assert!(matches!(err, EngineError::RuleInvariantViolation));
    }

    #[test]
    fn equal_priority_prefers_earlier_creation() {
        let mut rules = vec![
            rule("fallback", 0, RuleKind::Default, 0),
            rule("later", 50, conditional(&["douyin"]), 200),
            rule("earlier", 50, conditional(&["douyin"]), 100),
        ];
        let now = at(2025, 6, 2, 10, 0);
        let selected = select_rule(&mut rules, &ctx("douyin", "riverside", now)).unwrap();
        assert_eq!(selected.name, "earlier");
    }

    #[test]
    fn empty_condition_set_is_a_wildcard() {
        let kind = RuleKind::Conditional(RuleConditions {
            sources: Some(vec![]),
            ..Default::default()
        });
        let r = rule("open", 10, kind, 0);
        let now = at(2025, 6, 2, 10, 0);
        assert!(rule_matches(&r, &ctx("anything", "riverside", now)));
    }

    #[test]
    fn leadtype_condition_requires_a_leadtype() {
        let kind = RuleKind::Conditional(RuleConditions {
            lead_types: Some(vec!["intent".to_string()]),
            ..Default::default()
        });
        let r = rule("typed", 10, kind, 0);
        let now = at(2025, 6, 2, 10, 0);
        let mut c = ctx("douyin", "riverside", now);
        assert!(!rule_matches(&r, &c));
        c.leadtype = Some("intent");
        assert!(rule_matches(&r, &c));
    }

    #[test]
    fn time_window_bounds_are_inclusive() {
        let window = TimeWindow {
            start: Some("09:00".to_string()),
            end: Some("18:00".to_string()),
            weekdays: None,
        };
        assert!(window_matches(&window, at(2025, 6, 2, 9, 0)));
        assert!(window_matches(&window, at(2025, 6, 2, 18, 0)));
        assert!(!window_matches(&window, at(2025, 6, 2, 18, 1)));
        assert!(!window_matches(&window, at(2025, 6, 2, 8, 59)));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let window = TimeWindow {
            start: Some("22:00".to_string()),
            end: Some("02:00".to_string()),
            weekdays: None,
        };
        assert!(window_matches(&window, at(2025, 6, 2, 23, 30)));
        assert!(window_matches(&window, at(2025, 6, 3, 1, 30)));
        assert!(!window_matches(&window, at(2025, 6, 2, 12, 0)));
    }

    #[test]
    fn weekday_set_uses_monday_as_one() {
        let window = TimeWindow {
            start: None,
            end: None,
            weekdays: Some(vec![1, 2, 3, 4, 5]),
        };
        // 2025-06-02 is a Monday, 2025-06-07 a Saturday.
        assert!(window_matches(&window, at(2025, 6, 2, 10, 0)));
        assert!(!window_matches(&window, at(2025, 6, 7, 10, 0)));
    }

    #[test]
    fn repeated_selection_is_stable() {
        let mut rules = vec![
            rule("fallback", 0, RuleKind::Default, 0),
            rule("b", 50, conditional(&["douyin"]), 200),
            rule("a", 50, conditional(&["douyin"]), 100),
            rule("c", 80, conditional(&["walk_in"]), 50),
        ];
        let now = at(2025, 6, 2, 10, 0);
        let first = select_rule(&mut rules, &ctx("douyin", "riverside", now))
            .unwrap()
            .name
            .clone();
        for _ in 0..5 {
            let again = select_rule(&mut rules, &ctx("douyin", "riverside", now))
                .unwrap()
                .name
                .clone();
            assert_eq!(first, again);
        }
    }
}
