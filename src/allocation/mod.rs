pub mod community;
pub mod engine;
pub mod matcher;
pub mod orgs;
pub mod pipeline;
pub mod selector;
pub mod types;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit;
use crate::shared::schema::{
    allocation_logs, allocation_rules, communities, community_keywords, followups, leads,
    sales_groups,
};
use crate::shared::state::AppState;

use engine::{AllocationReport, allocate_lead};
use types::{AllocationMethod, AllocationRuleRow, CommunityKeywordRule, LeadInput, RuleConditions, SalesGroup};

#[derive(Debug, Deserialize)]
pub struct CreateLeadRequest {
    pub leadid: String,
    pub phone: Option<String>,
    pub wechat: Option<String>,
    pub source: String,
    pub leadtype: Option<String>,
    pub campaignname: Option<String>,
    pub unitname: Option<String>,
    pub remark: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateLeadResponse {
    pub leadid: String,
    pub allocation: AllocationReport,
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub name: String,
    pub description: Option<String>,
    pub priority: i32,
    pub conditions: Option<RuleConditions>,
    pub user_groups: Vec<i64>,
    pub allocation_method: Option<String>,
    pub enable_permission_check: Option<bool>,
    pub enable_community_matching: Option<bool>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize, AsChangeset)]
#[diesel(table_name = allocation_rules)]
pub struct UpdateRuleRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub priority: Option<i32>,
    pub conditions: Option<serde_json::Value>,
    pub user_groups: Option<Vec<i64>>,
    pub allocation_method: Option<String>,
    pub enable_permission_check: Option<bool>,
    pub enable_community_matching: Option<bool>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub groupname: String,
    pub description: Option<String>,
    pub members: Vec<i64>,
    pub allocation_method: Option<String>,
    pub enable_quality_control: Option<bool>,
    pub daily_lead_limit: Option<i32>,
    pub conversion_rate_requirement: Option<f64>,
    pub max_pending_leads: Option<i32>,
    pub enable_community_matching: Option<bool>,
}

#[derive(Debug, Deserialize, AsChangeset)]
#[diesel(table_name = sales_groups)]
pub struct UpdateGroupRequest {
    pub groupname: Option<String>,
    pub description: Option<String>,
    pub members: Option<Vec<i64>>,
    pub allocation_method: Option<String>,
    pub enable_quality_control: Option<bool>,
    pub daily_lead_limit: Option<i32>,
    pub conversion_rate_requirement: Option<f64>,
    pub max_pending_leads: Option<i32>,
    pub enable_community_matching: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateKeywordRequest {
    pub keywords: Vec<String>,
    pub community: String,
    pub priority: Option<i32>,
}

#[derive(Debug, Deserialize, AsChangeset)]
#[diesel(table_name = community_keywords)]
pub struct UpdateKeywordRequest {
    pub keywords: Option<Vec<String>>,
    pub community: Option<String>,
    pub priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct TestAllocationRequest {
    pub source: String,
    pub leadtype: Option<String>,
    pub community: Option<String>,
    pub campaignname: Option<String>,
    pub unitname: Option<String>,
    pub remark: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReassignRequest {
    pub leadid: String,
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct LogListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Queryable)]
pub struct AllocationLogRow {
    pub id: Uuid,
    pub leadid: String,
    pub rule_id: Option<Uuid>,
    pub rule_name: Option<String>,
    pub candidate_pool: serde_json::Value,
    pub filter_trace: serde_json::Value,
    pub assigned_user_id: Option<i64>,
    pub allocation_method: Option<String>,
    pub outcome: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct AllocationStats {
    pub total_attempts: i64,
    pub assigned: i64,
    pub unassigned: i64,
    pub duplicates: i64,
    pub active_rules: i64,
    pub sales_groups: i64,
}

fn db_error(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}"))
}

fn validate_method(method: &Option<String>) -> Result<(), (StatusCode, String)> {
    if let Some(m) = method {
        if AllocationMethod::parse(m).is_none() {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("unknown allocation method: {m}"),
            ));
        }
    }
    Ok(())
}

#[derive(Insertable)]
#[diesel(table_name = leads)]
struct NewLead<'a> {
    leadid: &'a str,
    phone: Option<&'a str>,
    wechat: Option<&'a str>,
    source: &'a str,
    leadtype: Option<&'a str>,
    campaignname: Option<&'a str>,
    unitname: Option<&'a str>,
    remark: Option<&'a str>,
}

/// Inbound lead event: the lead row is written first and must succeed
/// regardless of what the allocation attempt decides.
pub async fn create_lead(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateLeadRequest>,
) -> Result<Json<CreateLeadResponse>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;

    diesel::insert_into(leads::table)
        .values(&NewLead {
            leadid: &req.leadid,
            phone: req.phone.as_deref(),
            wechat: req.wechat.as_deref(),
            source: &req.source,
            leadtype: req.leadtype.as_deref(),
            campaignname: req.campaignname.as_deref(),
            unitname: req.unitname.as_deref(),
            remark: req.remark.as_deref(),
        })
        .on_conflict(leads::leadid)
        .do_nothing()
        .execute(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert error: {e}")))?;

    let input = LeadInput {
        leadid: req.leadid.clone(),
        source: req.source,
        leadtype: req.leadtype,
        campaignname: req.campaignname,
        unitname: req.unitname,
        remark: req.remark,
    };
    let allocation = allocate_lead(&mut conn, &input, false);

    Ok(Json(CreateLeadResponse {
        leadid: req.leadid,
        allocation,
    }))
}

/// Dry run: the identical decision path with persistence and rotation
/// side effects suppressed.
pub async fn test_allocation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TestAllocationRequest>,
) -> Result<Json<AllocationReport>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;

    let remark = match (&req.community, req.remark) {
        (Some(community), Some(remark)) => Some(format!("[COMMUNITY:{community}] {remark}")),
        (Some(community), None) => Some(format!("[COMMUNITY:{community}]")),
        (None, remark) => remark,
    };
    let input = LeadInput {
        leadid: format!("DRYRUN-{}", Uuid::new_v4()),
        source: req.source,
        leadtype: req.leadtype,
        campaignname: req.campaignname,
        unitname: req.unitname,
        remark,
    };
    Ok(Json(allocate_lead(&mut conn, &input, true)))
}

pub async fn list_rules(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<AllocationRuleRow>>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let rules: Vec<AllocationRuleRow> = allocation_rules::table
        .order((
            allocation_rules::priority.desc(),
            allocation_rules::created_at.asc(),
        ))
        .load(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;
    Ok(Json(rules))
}

pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRuleRequest>,
) -> Result<Json<AllocationRuleRow>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;

    if req.priority <= 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            "priority 0 is reserved for the fallback rule".to_string(),
        ));
    }
    validate_method(&req.allocation_method)?;

    let now = Utc::now();
    let conditions = req
        .conditions
        .map(|c| serde_json::to_value(c).unwrap_or_else(|_| serde_json::json!({})))
        .unwrap_or_else(|| serde_json::json!({}));
    let row = AllocationRuleRow {
        id: Uuid::new_v4(),
        name: req.name,
        description: req.description,
        is_active: req.is_active.unwrap_or(true),
        priority: req.priority,
        conditions,
        user_groups: req.user_groups,
        allocation_method: req.allocation_method,
        enable_permission_check: req.enable_permission_check.unwrap_or(false),
        enable_community_matching: req.enable_community_matching.unwrap_or(true),
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(allocation_rules::table)
        .values(&row)
        .execute(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert error: {e}")))?;
    Ok(Json(row))
}

pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateRuleRequest>,
) -> Result<Json<AllocationRuleRow>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;

    let existing: AllocationRuleRow = allocation_rules::table
        .filter(allocation_rules::id.eq(id))
        .first(&mut conn)
        .map_err(|_| (StatusCode::NOT_FOUND, "Rule not found".to_string()))?;

    if existing.priority == 0
        && (req.priority.is_some() || req.conditions.is_some() || req.is_active.is_some())
    {
        return Err((
            StatusCode::CONFLICT,
            "the fallback rule's priority, conditions and active flag are immutable".to_string(),
        ));
    }
    if let Some(priority) = req.priority {
        if priority <= 0 {
            return Err((
                StatusCode::BAD_REQUEST,
                "priority 0 is reserved for the fallback rule".to_string(),
            ));
        }
    }
    validate_method(&req.allocation_method)?;

    let updated: AllocationRuleRow =
        diesel::update(allocation_rules::table.filter(allocation_rules::id.eq(id)))
            .set((&req, allocation_rules::updated_at.eq(Utc::now())))
            .get_result(&mut conn)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Update error: {e}")))?;
    Ok(Json(updated))
}

pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;

    let existing: AllocationRuleRow = allocation_rules::table
        .filter(allocation_rules::id.eq(id))
        .first(&mut conn)
        .map_err(|_| (StatusCode::NOT_FOUND, "Rule not found".to_string()))?;
    if existing.priority == 0 {
        return Err((
            StatusCode::CONFLICT,
            "the fallback rule cannot be deleted".to_string(),
        ));
    }

    diesel::delete(allocation_rules::table.filter(allocation_rules::id.eq(id)))
        .execute(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Delete error: {e}")))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_groups(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SalesGroup>>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let groups: Vec<SalesGroup> = sales_groups::table
        .order(sales_groups::groupname.asc())
        .load(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;
    Ok(Json(groups))
}

#[derive(Insertable)]
#[diesel(table_name = sales_groups)]
struct NewSalesGroup {
    groupname: String,
    description: Option<String>,
    members: Vec<i64>,
    allocation_method: String,
    enable_quality_control: bool,
    daily_lead_limit: Option<i32>,
    conversion_rate_requirement: Option<f64>,
    max_pending_leads: Option<i32>,
    enable_community_matching: bool,
}

pub async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<SalesGroup>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    validate_method(&req.allocation_method)?;

    let group: SalesGroup = diesel::insert_into(sales_groups::table)
        .values(&NewSalesGroup {
            groupname: req.groupname,
            description: req.description,
            members: req.members,
            allocation_method: req
                .allocation_method
                .unwrap_or_else(|| AllocationMethod::RoundRobin.as_str().to_string()),
            enable_quality_control: req.enable_quality_control.unwrap_or(false),
            daily_lead_limit: req.daily_lead_limit,
            conversion_rate_requirement: req.conversion_rate_requirement,
            max_pending_leads: req.max_pending_leads,
            enable_community_matching: req.enable_community_matching.unwrap_or(false),
        })
        .get_result(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert error: {e}")))?;
    Ok(Json(group))
}

pub async fn update_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateGroupRequest>,
) -> Result<Json<SalesGroup>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    validate_method(&req.allocation_method)?;

    let updated: SalesGroup = diesel::update(sales_groups::table.filter(sales_groups::id.eq(id)))
        .set(&req)
        .get_result(&mut conn)
        .map_err(|e| match e {
            diesel::result::Error::NotFound => {
                (StatusCode::NOT_FOUND, "Group not found".to_string())
            }
            other => (StatusCode::INTERNAL_SERVER_ERROR, format!("Update error: {other}")),
        })?;
    Ok(Json(updated))
}

pub async fn delete_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    diesel::delete(sales_groups::table.filter(sales_groups::id.eq(id)))
        .execute(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Delete error: {e}")))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_keywords(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CommunityKeywordRule>>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let rules: Vec<CommunityKeywordRule> = community_keywords::table
        .order(community_keywords::priority.desc())
        .load(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;
    Ok(Json(rules))
}

#[derive(Insertable)]
#[diesel(table_name = community_keywords)]
struct NewKeywordRule {
    keywords: Vec<String>,
    community: String,
    priority: i32,
}

pub async fn create_keyword(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateKeywordRequest>,
) -> Result<Json<CommunityKeywordRule>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let rule: CommunityKeywordRule = diesel::insert_into(community_keywords::table)
        .values(&NewKeywordRule {
            keywords: req.keywords,
            community: req.community,
            priority: req.priority.unwrap_or(0),
        })
        .get_result(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert error: {e}")))?;
    Ok(Json(rule))
}

pub async fn update_keyword(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateKeywordRequest>,
) -> Result<Json<CommunityKeywordRule>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let updated: CommunityKeywordRule =
        diesel::update(community_keywords::table.filter(community_keywords::id.eq(id)))
            .set(&req)
            .get_result(&mut conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => {
                    (StatusCode::NOT_FOUND, "Keyword rule not found".to_string())
                }
                other => (StatusCode::INTERNAL_SERVER_ERROR, format!("Update error: {other}")),
            })?;
    Ok(Json(updated))
}

pub async fn delete_keyword(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    diesel::delete(community_keywords::table.filter(community_keywords::id.eq(id)))
        .execute(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Delete error: {e}")))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogListQuery>,
) -> Result<Json<Vec<AllocationLogRow>>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let logs: Vec<AllocationLogRow> = allocation_logs::table
        .order(allocation_logs::created_at.desc())
        .limit(limit)
        .load(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;
    Ok(Json(logs))
}

pub async fn get_allocation_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AllocationStats>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;

    let total_attempts: i64 = allocation_logs::table
        .count()
        .get_result(&mut conn)
        .unwrap_or(0);
    let assigned: i64 = allocation_logs::table
        .filter(allocation_logs::outcome.eq("assigned"))
        .count()
        .get_result(&mut conn)
        .unwrap_or(0);
    let unassigned: i64 = allocation_logs::table
        .filter(allocation_logs::outcome.eq("no_eligible_candidate"))
        .count()
        .get_result(&mut conn)
        .unwrap_or(0);
    let duplicates: i64 = allocation_logs::table
        .filter(allocation_logs::outcome.eq("duplicate"))
        .count()
        .get_result(&mut conn)
        .unwrap_or(0);
    let active_rules: i64 = allocation_rules::table
        .filter(allocation_rules::is_active.eq(true))
        .count()
        .get_result(&mut conn)
        .unwrap_or(0);
    let groups: i64 = sales_groups::table.count().get_result(&mut conn).unwrap_or(0);

    Ok(Json(AllocationStats {
        total_attempts,
        assigned,
        unassigned,
        duplicates,
        active_rules,
        sales_groups: groups,
    }))
}

/// Manual reassignment of an existing work item to a specific agent.
pub async fn reassign_lead(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReassignRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;

    let updated = diesel::update(followups::table.filter(followups::leadid.eq(&req.leadid)))
        .set((
            followups::interviewsales_user_id.eq(Some(req.user_id)),
            followups::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Update error: {e}")))?;
    if updated == 0 {
        return Err((
            StatusCode::NOT_FOUND,
            format!("no work item for lead {}", req.leadid),
        ));
    }
    audit::record_manual_reassignment(&mut conn, &req.leadid, req.user_id);
    Ok(Json(serde_json::json!({
        "leadid": req.leadid,
        "assigned_user_id": req.user_id,
    })))
}

pub async fn list_communities(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<String>>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let names: Vec<String> = communities::table
        .order((communities::sort_order.asc(), communities::id.asc()))
        .select(communities::name)
        .load(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;
    Ok(Json(names))
}

pub fn configure_allocation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/leads", post(create_lead))
        .route("/api/allocation/rules", get(list_rules).post(create_rule))
        .route(
            "/api/allocation/rules/:id",
            axum::routing::put(update_rule).delete(delete_rule),
        )
        .route("/api/allocation/groups", get(list_groups).post(create_group))
        .route(
            "/api/allocation/groups/:id",
            axum::routing::put(update_group).delete(delete_group),
        )
        .route(
            "/api/allocation/keywords",
            get(list_keywords).post(create_keyword),
        )
        .route(
            "/api/allocation/keywords/:id",
            axum::routing::put(update_keyword).delete(delete_keyword),
        )
        .route("/api/allocation/logs", get(list_logs))
        .route("/api/allocation/test", post(test_allocation))
        .route("/api/allocation/stats", get(get_allocation_stats))
        .route("/api/allocation/reassign", post(reassign_lead))
        .route("/api/communities", get(list_communities))
}
