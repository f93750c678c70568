//! Candidate pool construction and the three-stage filter pipeline.
//!
//! Stages run in a fixed order (quality control, permission, community
//! priority) and are fault-isolated: an internal stage error degrades the
//! stage to a no-op instead of aborting the pipeline. The runner owns the
//! per-stage empty policy: the first two stages abort the attempt when
//! they empty the set, the community stage can only narrow, never block.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::allocation::orgs;
use crate::allocation::types::{AllocationRule, SalesGroup, UserProfile};
use crate::shared::errors::EngineError;
use crate::shared::schema::{
    allocation_logs, followups, sales_groups, user_permissions, users_profile,
};

pub const ALLOCATION_PERMISSION: &str = "lead_allocation";

const PENDING_STAGES: [&str; 2] = ["pending", "following"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    QualityControl,
    Permission,
    CommunityPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyPolicy {
    /// An empty result ends the attempt with "no eligible candidate".
    Abort,
    /// An empty result keeps the pre-stage candidate set unchanged.
    Keep,
}

impl Stage {
    pub const ALL: [Stage; 3] = [
        Stage::QualityControl,
        Stage::Permission,
        Stage::CommunityPriority,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::QualityControl => "quality_control",
            Stage::Permission => "permission",
            Stage::CommunityPriority => "community_priority",
        }
    }

    pub fn on_empty(&self) -> EmptyPolicy {
        match self {
            Stage::QualityControl | Stage::Permission => EmptyPolicy::Abort,
            Stage::CommunityPriority => EmptyPolicy::Keep,
        }
    }
}

/// One record per executed stage, preserved verbatim in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterTraceEntry {
    pub stage: String,
    pub input: Vec<i64>,
    pub output: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Candidates(Vec<i64>),
    Exhausted { stage: &'static str },
}

/// Ordered candidate list plus the group that first contributed each
/// member; group-level thresholds apply per contributing group.
#[derive(Debug, Clone)]
pub struct CandidatePool {
    pub ordered: Vec<i64>,
    pub group_of: HashMap<i64, i64>,
}

pub fn dedup_members(groups: &[SalesGroup], active: &HashSet<i64>) -> CandidatePool {
    let mut ordered = Vec::new();
    let mut group_of = HashMap::new();
    for group in groups {
        for &member in &group.members {
            if !active.contains(&member) {
                continue;
            }
            if let std::collections::hash_map::Entry::Vacant(slot) = group_of.entry(member) {
                slot.insert(group.id);
                ordered.push(member);
            }
        }
    }
    CandidatePool { ordered, group_of }
}

/// Expands the rule's ordered group references into a deduplicated,
/// active-only candidate list.
pub fn build_candidate_pool(
    conn: &mut PgConnection,
    rule: &AllocationRule,
) -> QueryResult<(CandidatePool, HashMap<i64, SalesGroup>)> {
    let mut loaded: Vec<SalesGroup> = sales_groups::table
        .filter(sales_groups::id.eq_any(&rule.user_groups))
        .load(conn)?;
    // restore the rule's reference order
    loaded.sort_by_key(|g| {
        rule.user_groups
            .iter()
            .position(|id| *id == g.id)
            .unwrap_or(usize::MAX)
    });

    let member_ids: Vec<i64> = loaded.iter().flat_map(|g| g.members.clone()).collect();
    let profiles: Vec<UserProfile> = users_profile::table
        .filter(users_profile::id.eq_any(&member_ids))
        .load(conn)?;
    let active: HashSet<i64> = profiles
        .iter()
        .filter(|p| p.is_active())
        .map(|p| p.id)
        .collect();

    let pool = dedup_members(&loaded, &active);
    let groups = loaded.into_iter().map(|g| (g.id, g)).collect();
    Ok((pool, groups))
}

#[derive(Debug, Clone, Default)]
pub struct QualitySnapshot {
    pub today_count: HashMap<i64, i64>,
    pub pending_count: HashMap<i64, i64>,
    pub won_count: HashMap<i64, i64>,
    pub closed_count: HashMap<i64, i64>,
}

/// Drops candidates whose contributing group's thresholds are currently
/// violated. Candidates of groups without quality control pass through.
pub fn apply_quality_rules(
    pool: &[i64],
    group_of: &HashMap<i64, i64>,
    groups: &HashMap<i64, SalesGroup>,
    snapshot: &QualitySnapshot,
) -> Vec<i64> {
    pool.iter()
        .copied()
        .filter(|candidate| {
            let group = group_of.get(candidate).and_then(|id| groups.get(id));
            let Some(group) = group else {
                return true;
            };
            if !group.enable_quality_control {
                return true;
            }
            if let Some(limit) = group.daily_lead_limit {
                let taken = snapshot.today_count.get(candidate).copied().unwrap_or(0);
                if taken >= i64::from(limit) {
                    return false;
                }
            }
            if let Some(max_pending) = group.max_pending_leads {
                let pending = snapshot.pending_count.get(candidate).copied().unwrap_or(0);
                if pending > i64::from(max_pending) {
                    return false;
                }
            }
            if let Some(required) = group.conversion_rate_requirement {
                let closed = snapshot.closed_count.get(candidate).copied().unwrap_or(0);
                if closed > 0 {
                    let won = snapshot.won_count.get(candidate).copied().unwrap_or(0);
                    let rate = won as f64 / closed as f64;
                    if rate < required {
                        return false;
                    }
                }
            }
            true
        })
        .collect()
}

pub fn apply_permission_rules(pool: &[i64], permitted: &HashSet<i64>) -> Vec<i64> {
    pool.iter()
        .copied()
        .filter(|c| permitted.contains(c))
        .collect()
}

/// Keeps candidates whose ownership chain matches the lead's community.
/// Candidates of groups that do not opt into community matching are
/// exempt and always survive this stage.
pub fn apply_community_priority(
    pool: &[i64],
    group_of: &HashMap<i64, i64>,
    groups: &HashMap<i64, SalesGroup>,
    chain_matched: &HashSet<i64>,
) -> Vec<i64> {
    pool.iter()
        .copied()
        .filter(|candidate| {
            let opted_in = group_of
                .get(candidate)
                .and_then(|id| groups.get(id))
                .map(|g| g.enable_community_matching)
                .unwrap_or(false);
            !opted_in || chain_matched.contains(candidate)
        })
        .collect()
}

fn collect_quality_snapshot(
    conn: &mut PgConnection,
    pool: &[i64],
) -> QueryResult<QualitySnapshot> {
    let today_start = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| DateTime::<Utc>::from_naive_utc_and_offset(midnight, Utc))
        .unwrap_or_else(Utc::now);

    let mut snapshot = QualitySnapshot::default();
    for &candidate in pool {
        let today: i64 = allocation_logs::table
            .filter(allocation_logs::assigned_user_id.eq(candidate))
            .filter(allocation_logs::created_at.ge(today_start))
            .count()
            .get_result(conn)?;
        snapshot.today_count.insert(candidate, today);

        let pending: i64 = followups::table
            .filter(followups::interviewsales_user_id.eq(candidate))
            .filter(followups::followupstage.eq_any(PENDING_STAGES))
            .count()
            .get_result(conn)?;
        snapshot.pending_count.insert(candidate, pending);

        let won: i64 = followups::table
            .filter(followups::interviewsales_user_id.eq(candidate))
            .filter(followups::followupstage.eq("won"))
            .count()
            .get_result(conn)?;
        let invalid: i64 = followups::table
            .filter(followups::interviewsales_user_id.eq(candidate))
            .filter(followups::followupstage.eq("invalid"))
            .count()
            .get_result(conn)?;
        snapshot.won_count.insert(candidate, won);
        snapshot.closed_count.insert(candidate, won + invalid);
    }
    Ok(snapshot)
}

fn load_permitted(conn: &mut PgConnection, pool: &[i64]) -> QueryResult<HashSet<i64>> {
    let ids: Vec<i64> = user_permissions::table
        .filter(user_permissions::user_id.eq_any(pool))
        .filter(user_permissions::permission.eq(ALLOCATION_PERMISSION))
        .select(user_permissions::user_id)
        .load(conn)?;
    Ok(ids.into_iter().collect())
}

fn load_chain_matched(
    conn: &mut PgConnection,
    pool: &[i64],
    community: &str,
) -> QueryResult<HashSet<i64>> {
    let mapped = orgs::load_mapped_org_names(conn, community)?;
    if mapped.is_empty() {
        return Ok(HashSet::new());
    }
    let org_index = orgs::load_org_index(conn)?;
    let profiles: Vec<UserProfile> = users_profile::table
        .filter(users_profile::id.eq_any(pool))
        .load(conn)?;
    Ok(profiles
        .iter()
        .filter(|p| orgs::chain_matches_community(p.organization_id, &org_index, &mapped))
        .map(|p| p.id)
        .collect())
}

pub struct PipelineContext<'a> {
    pub rule: &'a AllocationRule,
    pub groups: &'a HashMap<i64, SalesGroup>,
    pub group_of: &'a HashMap<i64, i64>,
    pub community: &'a str,
}

fn stage_enabled(stage: Stage, ctx: &PipelineContext<'_>) -> bool {
    match stage {
        Stage::QualityControl => ctx.groups.values().any(|g| g.enable_quality_control),
        Stage::Permission => ctx.rule.enable_permission_check,
        Stage::CommunityPriority => {
            ctx.rule.enable_community_matching
                && ctx.groups.values().any(|g| g.enable_community_matching)
        }
    }
}

fn run_stage(
    conn: &mut PgConnection,
    stage: Stage,
    ctx: &PipelineContext<'_>,
    pool: &[i64],
) -> Result<Vec<i64>, EngineError> {
    let fault = |e: diesel::result::Error| EngineError::StageExecutionFault {
        stage: stage.name(),
        detail: e.to_string(),
    };
    match stage {
        Stage::QualityControl => {
            let snapshot = collect_quality_snapshot(conn, pool).map_err(fault)?;
            Ok(apply_quality_rules(pool, ctx.group_of, ctx.groups, &snapshot))
        }
        Stage::Permission => {
            let permitted = load_permitted(conn, pool).map_err(fault)?;
            Ok(apply_permission_rules(pool, &permitted))
        }
        Stage::CommunityPriority => {
            let matched = load_chain_matched(conn, pool, ctx.community).map_err(fault)?;
            Ok(apply_community_priority(
                pool,
                ctx.group_of,
                ctx.groups,
                &matched,
            ))
        }
    }
}

enum StageFold {
    Continue(Vec<i64>),
    Abort,
}

/// Applies one stage result under the stage's policies: a fault degrades
/// to a no-op, an empty result either aborts or keeps the previous set.
fn fold_stage(
    stage: Stage,
    current: &[i64],
    result: Result<Vec<i64>, EngineError>,
    trace: &mut Vec<FilterTraceEntry>,
) -> StageFold {
    match result {
        Err(fault) => {
            log::error!("filter stage degraded to a no-op: {}", fault);
            trace.push(FilterTraceEntry {
                stage: stage.name().to_string(),
                input: current.to_vec(),
                output: current.to_vec(),
                error: Some(fault.to_string()),
            });
            StageFold::Continue(current.to_vec())
        }
        Ok(output) if output.is_empty() => match stage.on_empty() {
            EmptyPolicy::Abort => {
                trace.push(FilterTraceEntry {
                    stage: stage.name().to_string(),
                    input: current.to_vec(),
                    output: Vec::new(),
                    error: None,
                });
                StageFold::Abort
            }
            EmptyPolicy::Keep => {
                trace.push(FilterTraceEntry {
                    stage: stage.name().to_string(),
                    input: current.to_vec(),
                    output: current.to_vec(),
                    error: None,
                });
                StageFold::Continue(current.to_vec())
            }
        },
        Ok(output) => {
            trace.push(FilterTraceEntry {
                stage: stage.name().to_string(),
                input: current.to_vec(),
                output: output.clone(),
                error: None,
            });
            StageFold::Continue(output)
        }
    }
}

pub fn run_pipeline(
    conn: &mut PgConnection,
    ctx: &PipelineContext<'_>,
    pool: Vec<i64>,
    trace: &mut Vec<FilterTraceEntry>,
) -> PipelineOutcome {
    let mut current = pool;
    for stage in Stage::ALL {
        if !stage_enabled(stage, ctx) {
            continue;
        }
        let result = run_stage(conn, stage, ctx, &current);
        match fold_stage(stage, &current, result, trace) {
            StageFold::Continue(next) => current = next,
            StageFold::Abort => return PipelineOutcome::Exhausted { stage: stage.name() },
        }
    }
    PipelineOutcome::Candidates(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn group(id: i64, members: &[i64]) -> SalesGroup {
        SalesGroup {
            id,
            groupname: format!("group-{id}"),
            description: None,
            members: members.to_vec(),
            allocation_method: "round_robin".to_string(),
            enable_quality_control: false,
            daily_lead_limit: None,
            conversion_rate_requirement: None,
            max_pending_leads: None,
            enable_community_matching: false,
            created_at: Utc::now(),
        }
    }

    fn indexed(groups: &[SalesGroup]) -> HashMap<i64, SalesGroup> {
        groups.iter().cloned().map(|g| (g.id, g)).collect()
    }

    #[test]
    fn dedup_preserves_first_seen_order_and_attribution() {
        let groups = vec![group(1, &[10, 20]), group(2, &[20, 30, 10, 40])];
        let active: HashSet<i64> = [10, 20, 30, 40].into_iter().collect();
        let pool = dedup_members(&groups, &active);
        assert_eq!(pool.ordered, vec![10, 20, 30, 40]);
        assert_eq!(pool.group_of[&10], 1);
        assert_eq!(pool.group_of[&20], 1);
        assert_eq!(pool.group_of[&30], 2);
        assert_eq!(pool.group_of[&40], 2);
    }

    #[test]
    fn dedup_drops_inactive_members() {
        let groups = vec![group(1, &[10, 20, 30])];
        let active: HashSet<i64> = [10, 30].into_iter().collect();
        let pool = dedup_members(&groups, &active);
        assert_eq!(pool.ordered, vec![10, 30]);
    }

    #[test]
    fn quality_drops_member_over_daily_cap() {
        let mut g = group(1, &[10, 20, 30]);
        g.enable_quality_control = true;
        g.daily_lead_limit = Some(5);
        let groups = indexed(&[g]);
        let group_of: HashMap<i64, i64> = [(10, 1), (20, 1), (30, 1)].into_iter().collect();
        let mut snapshot = QualitySnapshot::default();
        snapshot.today_count.insert(20, 5);
        let kept = apply_quality_rules(&[10, 20, 30], &group_of, &groups, &snapshot);
        assert_eq!(kept, vec![10, 30]);
    }

    #[test]
    fn quality_drops_member_over_pending_cap() {
        let mut g = group(1, &[10, 20]);
        g.enable_quality_control = true;
        g.max_pending_leads = Some(3);
        let groups = indexed(&[g]);
        let group_of: HashMap<i64, i64> = [(10, 1), (20, 1)].into_iter().collect();
        let mut snapshot = QualitySnapshot::default();
        snapshot.pending_count.insert(10, 4);
        snapshot.pending_count.insert(20, 3);
        let kept = apply_quality_rules(&[10, 20], &group_of, &groups, &snapshot);
        assert_eq!(kept, vec![20]);
    }

    #[test]
    fn quality_enforces_conversion_rate_only_with_history() {
        let mut g = group(1, &[10, 20, 30]);
        g.enable_quality_control = true;
        g.conversion_rate_requirement = Some(0.5);
        let groups = indexed(&[g]);
        let group_of: HashMap<i64, i64> = [(10, 1), (20, 1), (30, 1)].into_iter().collect();
        let mut snapshot = QualitySnapshot::default();
        // 10: 1 of 4 won, below requirement; 20: 3 of 4; 30: no history
        snapshot.won_count.insert(10, 1);
        snapshot.closed_count.insert(10, 4);
        snapshot.won_count.insert(20, 3);
        snapshot.closed_count.insert(20, 4);
        let kept = apply_quality_rules(&[10, 20, 30], &group_of, &groups, &snapshot);
        assert_eq!(kept, vec![20, 30]);
    }

    #[test]
    fn quality_ignores_groups_without_quality_control() {
        let g = group(1, &[10]);
        let groups = indexed(&[g]);
        let group_of: HashMap<i64, i64> = [(10, 1)].into_iter().collect();
        let mut snapshot = QualitySnapshot::default();
        snapshot.today_count.insert(10, 1000);
        let kept = apply_quality_rules(&[10], &group_of, &groups, &snapshot);
        assert_eq!(kept, vec![10]);
    }

    #[test]
    fn quality_is_pure_over_a_fixed_snapshot() {
        let mut g = group(1, &[10, 20]);
        g.enable_quality_control = true;
        g.daily_lead_limit = Some(1);
        let groups = indexed(&[g]);
        let group_of: HashMap<i64, i64> = [(10, 1), (20, 1)].into_iter().collect();
        let mut snapshot = QualitySnapshot::default();
        snapshot.today_count.insert(10, 1);
        let first = apply_quality_rules(&[10, 20], &group_of, &groups, &snapshot);
        for _ in 0..3 {
            assert_eq!(
                first,
                apply_quality_rules(&[10, 20], &group_of, &groups, &snapshot)
            );
        }
    }

    #[test]
    fn permission_keeps_only_authorized_members() {
        let permitted: HashSet<i64> = [20, 30].into_iter().collect();
        assert_eq!(apply_permission_rules(&[10, 20, 30], &permitted), vec![20, 30]);
    }

    #[test]
    fn community_priority_narrows_to_chain_matches() {
        let mut g = group(1, &[10, 20, 30]);
        g.enable_community_matching = true;
        let groups = indexed(&[g]);
        let group_of: HashMap<i64, i64> = [(10, 1), (20, 1), (30, 1)].into_iter().collect();
        let matched: HashSet<i64> = [20].into_iter().collect();
        let kept = apply_community_priority(&[10, 20, 30], &group_of, &groups, &matched);
        assert_eq!(kept, vec![20]);
    }

    #[test]
    fn community_priority_exempts_groups_not_opted_in() {
        let g1 = {
            let mut g = group(1, &[10]);
            g.enable_community_matching = true;
            g
        };
        let g2 = group(2, &[20]);
        let groups = indexed(&[g1, g2]);
        let group_of: HashMap<i64, i64> = [(10, 1), (20, 2)].into_iter().collect();
        let matched: HashSet<i64> = HashSet::new();
        let kept = apply_community_priority(&[10, 20], &group_of, &groups, &matched);
        assert_eq!(kept, vec![20]);
    }

    #[test]
    fn empty_quality_result_aborts_the_attempt() {
        let mut trace = Vec::new();
        let fold = fold_stage(Stage::QualityControl, &[10, 20], Ok(vec![]), &mut trace);
        assert!(matches!(fold, StageFold::Abort));
        assert_eq!(trace.len(), 1);
        assert!(trace[0].output.is_empty());
    }

    #[test]
    fn empty_community_result_keeps_previous_set() {
        let mut trace = Vec::new();
        let fold = fold_stage(Stage::CommunityPriority, &[10, 20], Ok(vec![]), &mut trace);
        match fold {
            StageFold::Continue(kept) => assert_eq!(kept, vec![10, 20]),
            StageFold::Abort => panic!("narrow-only stage must never abort"),
        }
        assert_eq!(trace[0].output, vec![10, 20]);
    }

    #[test]
    fn stage_fault_degrades_to_noop_and_is_traced() {
        let mut trace = Vec::new();
        let fold = fold_stage(
            Stage::Permission,
            &[10, 20],
            Err(EngineError::StageExecutionFault {
                stage: "permission",
                detail: "connection reset".to_string(),
            }),
            &mut trace,
        );
        match fold {
            StageFold::Continue(kept) => assert_eq!(kept, vec![10, 20]),
            StageFold::Abort => panic!("faults must not abort the pipeline"),
        }
        let error = trace[0].error.as_deref().unwrap();
        assert!(error.contains("connection reset"));
    }
}
