//! Types for the allocation module
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::schema::{
    allocation_rules, community_keywords, community_organizations, organizations, sales_groups,
    users_profile,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationMethod {
    RoundRobin,
    Random,
    Workload,
}

impl AllocationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMethod::RoundRobin => "round_robin",
            AllocationMethod::Random => "random",
            AllocationMethod::Workload => "workload",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "round_robin" => Some(AllocationMethod::RoundRobin),
            "random" => Some(AllocationMethod::Random),
            "workload" => Some(AllocationMethod::Workload),
            _ => None,
        }
    }
}

/// One optional field per condition dimension; a missing (or empty)
/// dimension is a wildcard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub communities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ranges: Option<TimeWindow>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekdays: Option<Vec<u32>>,
}

/// The mandatory priority-0 rule is its own variant so the matcher never
/// has to special-case a sentinel priority value.
#[derive(Debug, Clone)]
pub enum RuleKind {
    Default,
    Conditional(RuleConditions),
}

#[derive(Debug, Clone)]
pub struct AllocationRule {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub kind: RuleKind,
    pub user_groups: Vec<i64>,
    pub method: Option<AllocationMethod>,
    pub enable_permission_check: bool,
    pub enable_community_matching: bool,
    pub created_at: DateTime<Utc>,
}

impl AllocationRule {
    pub fn from_row(row: AllocationRuleRow) -> Self {
        let kind = if row.priority == 0 {
            RuleKind::Default
        } else {
            let conditions = serde_json::from_value(row.conditions).unwrap_or_else(|e| {
                log::warn!("rule {} has malformed conditions: {}", row.id, e);
                RuleConditions::default()
            });
            RuleKind::Conditional(conditions)
        };
        let method = row.allocation_method.as_deref().and_then(|m| {
            let parsed = AllocationMethod::parse(m);
            if parsed.is_none() {
                log::warn!("rule {} has unknown allocation method {:?}", row.id, m);
            }
            parsed
        });
        Self {
            id: row.id,
            name: row.name,
            priority: row.priority,
            kind,
            user_groups: row.user_groups,
            method,
            enable_permission_check: row.enable_permission_check,
            enable_community_matching: row.enable_community_matching,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = allocation_rules)]
pub struct AllocationRuleRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub priority: i32,
    pub conditions: serde_json::Value,
    pub user_groups: Vec<i64>,
    pub allocation_method: Option<String>,
    pub enable_permission_check: bool,
    pub enable_community_matching: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = sales_groups)]
pub struct SalesGroup {
    pub id: i64,
    pub groupname: String,
    pub description: Option<String>,
    pub members: Vec<i64>,
    pub allocation_method: String,
    pub enable_quality_control: bool,
    pub daily_lead_limit: Option<i32>,
    pub conversion_rate_requirement: Option<f64>,
    pub max_pending_leads: Option<i32>,
    pub enable_community_matching: bool,
    pub created_at: DateTime<Utc>,
}

impl SalesGroup {
    pub fn method(&self) -> AllocationMethod {
        AllocationMethod::parse(&self.allocation_method).unwrap_or(AllocationMethod::RoundRobin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = community_keywords)]
pub struct CommunityKeywordRule {
    pub id: i64,
    pub keywords: Vec<String>,
    pub community: String,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = community_organizations)]
pub struct CommunityOrganization {
    pub id: i64,
    pub community: String,
    pub org_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = organizations)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = users_profile)]
pub struct UserProfile {
    pub id: i64,
    pub nickname: String,
    pub status: String,
    pub organization_id: Option<Uuid>,
}

impl UserProfile {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Attributes of an inbound lead the engine decides on.
#[derive(Debug, Clone)]
pub struct LeadInput {
    pub leadid: String,
    pub source: String,
    pub leadtype: Option<String>,
    pub campaignname: Option<String>,
    pub unitname: Option<String>,
    pub remark: Option<String>,
}
