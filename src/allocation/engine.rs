//! The allocation orchestrator.
//!
//! Sequences community resolution, rule selection, candidate building,
//! filtering, selection and persistence for one inbound lead. Every
//! failure is recovered here: the caller that created the lead always
//! gets a report, never an error, and the attempt is audit-logged even
//! when no agent could be assigned.

use chrono::Local;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::allocation::community;
use crate::allocation::matcher::{self, MatchContext};
use crate::allocation::pipeline::{self, FilterTraceEntry, PipelineContext, PipelineOutcome};
use crate::allocation::selector;
use crate::allocation::types::{AllocationMethod, AllocationRule, AllocationRuleRow, LeadInput};
use crate::audit;
use crate::shared::errors::EngineError;
use crate::shared::schema::{allocation_rules, followups};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationOutcome {
    Assigned,
    NoEligibleCandidate,
    Duplicate,
    Error,
}

impl AllocationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationOutcome::Assigned => "assigned",
            AllocationOutcome::NoEligibleCandidate => "no_eligible_candidate",
            AllocationOutcome::Duplicate => "duplicate",
            AllocationOutcome::Error => "error",
        }
    }
}

/// Full decision trace for one allocation attempt. This is both the
/// dry-run response payload and the source of the audit row.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationReport {
    pub leadid: String,
    pub outcome: AllocationOutcome,
    pub community: Option<String>,
    pub rule_id: Option<Uuid>,
    pub rule_name: Option<String>,
    pub candidate_pool: Vec<i64>,
    pub filter_trace: Vec<FilterTraceEntry>,
    pub assigned_user_id: Option<i64>,
    pub allocation_method: Option<AllocationMethod>,
    pub failure_stage: Option<String>,
}

impl AllocationReport {
    fn new(leadid: &str) -> Self {
        Self {
            leadid: leadid.to_string(),
            outcome: AllocationOutcome::Error,
            community: None,
            rule_id: None,
            rule_name: None,
            candidate_pool: Vec::new(),
            filter_trace: Vec::new(),
            assigned_user_id: None,
            allocation_method: None,
            failure_stage: None,
        }
    }
}

pub fn load_active_rules(conn: &mut PgConnection) -> QueryResult<Vec<AllocationRule>> {
    let rows: Vec<AllocationRuleRow> = allocation_rules::table
        .filter(allocation_rules::is_active.eq(true))
        .load(conn)?;
    Ok(rows.into_iter().map(AllocationRule::from_row).collect())
}

#[derive(Insertable)]
#[diesel(table_name = followups)]
struct NewFollowup<'a> {
    leadid: &'a str,
    leadtype: Option<&'a str>,
    followupstage: &'a str,
    interviewsales_user_id: Option<i64>,
}

fn create_work_item(
    conn: &mut PgConnection,
    input: &LeadInput,
    assigned_user_id: i64,
) -> Result<(), EngineError> {
    let inserted = diesel::insert_into(followups::table)
        .values(&NewFollowup {
            leadid: &input.leadid,
            leadtype: input.leadtype.as_deref(),
            followupstage: "pending",
            interviewsales_user_id: Some(assigned_user_id),
        })
        .on_conflict(followups::leadid)
        .do_nothing()
        .execute(conn)?;
    if inserted == 0 {
        return Err(EngineError::DuplicateWorkItem {
            leadid: input.leadid.clone(),
        });
    }
    Ok(())
}

fn run_state_machine(
    conn: &mut PgConnection,
    input: &LeadInput,
    dry_run: bool,
    report: &mut AllocationReport,
) -> Result<(), EngineError> {
    // ResolveCommunity
    let community = community::resolve_community(conn, input)?;
    report.community = Some(community.clone());

    // MatchRule
    let mut rules = load_active_rules(conn)?;
    let ctx = MatchContext {
        source: &input.source,
        leadtype: input.leadtype.as_deref(),
        community: &community,
        now: Local::now().naive_local(),
    };
    let rule: AllocationRule = matcher::select_rule(&mut rules, &ctx)?.clone();
    report.rule_id = Some(rule.id);
    report.rule_name = Some(rule.name.clone());

    // BuildCandidates
    let (pool, groups) = pipeline::build_candidate_pool(conn, &rule)?;
    report.candidate_pool = pool.ordered.clone();
    if pool.ordered.is_empty() {
        return Err(EngineError::EmptyCandidatePool {
            stage: "candidate_pool",
        });
    }

    // Filter
    let pipeline_ctx = PipelineContext {
        rule: &rule,
        groups: &groups,
        group_of: &pool.group_of,
        community: &community,
    };
    let candidates =
        match pipeline::run_pipeline(conn, &pipeline_ctx, pool.ordered.clone(), &mut report.filter_trace) {
            PipelineOutcome::Candidates(c) => c,
            PipelineOutcome::Exhausted { stage } => {
                return Err(EngineError::EmptyCandidatePool { stage });
            }
        };

    // Select
    let first_group = rule.user_groups.first().copied();
    let method = rule
        .method
        .or_else(|| {
            first_group
                .and_then(|id| groups.get(&id))
                .map(|g| g.method())
        })
        .unwrap_or(AllocationMethod::RoundRobin);
    report.allocation_method = Some(method);
    let cursor_key = first_group.unwrap_or_default().to_string();
    let selected = selector::select_candidate(
        conn,
        method,
        selector::SCOPE_GROUP,
        &cursor_key,
        &candidates,
        dry_run,
    )?
    .ok_or(EngineError::EmptyCandidatePool { stage: "selector" })?;
    report.assigned_user_id = Some(selected);

    // PersistAssignment
    if !dry_run {
        create_work_item(conn, input, selected)?;
    }

    report.outcome = AllocationOutcome::Assigned;
    Ok(())
}

/// Runs one allocation attempt. Never returns an error: failures are
/// folded into the report's outcome, and the attempt is recorded in the
/// audit log unless this is a dry run.
pub fn allocate_lead(
    conn: &mut PgConnection,
    input: &LeadInput,
    dry_run: bool,
) -> AllocationReport {
    let mut report = AllocationReport::new(&input.leadid);
    match run_state_machine(conn, input, dry_run, &mut report) {
        Ok(()) => {
            log::info!(
                "lead {} assigned to {:?} via rule {:?}",
                input.leadid,
                report.assigned_user_id,
                report.rule_name
            );
        }
        Err(EngineError::EmptyCandidatePool { stage }) => {
            report.outcome = AllocationOutcome::NoEligibleCandidate;
            report.failure_stage = Some(stage.to_string());
            log::warn!(
                "lead {} left unassigned: candidate pool exhausted at {}",
                input.leadid,
                stage
            );
        }
        Err(EngineError::DuplicateWorkItem { .. }) => {
            report.outcome = AllocationOutcome::Duplicate;
            log::info!("lead {} already has a work item, skipping", input.leadid);
        }
        Err(EngineError::RuleInvariantViolation) => {
            report.outcome = AllocationOutcome::Error;
            report.failure_stage = Some("match_rule".to_string());
            log::error!(
                "CRITICAL: no rule matched lead {} despite the mandatory fallback",
                input.leadid
            );
        }
        Err(err) => {
            report.outcome = AllocationOutcome::Error;
            log::error!("allocation for lead {} failed: {}", input.leadid, err);
        }
    }
    if !dry_run {
        audit::record_allocation(conn, &report);
    }
    report
}
