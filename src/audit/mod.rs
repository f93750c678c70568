//! Append-only audit writers shared by both orchestrators.
//!
//! A failed audit insert is logged and swallowed: the trail must be
//! attempted even when the main assignment step failed, and it must
//! never take the triggering write down with it.

use diesel::prelude::*;

use crate::allocation::engine::AllocationReport;
use crate::shared::schema::{allocation_logs, showings_allocation_logs};
use crate::showings::engine::ShowingReport;

#[derive(Insertable)]
#[diesel(table_name = allocation_logs)]
struct NewAllocationLog<'a> {
    leadid: &'a str,
    rule_id: Option<uuid::Uuid>,
    rule_name: Option<&'a str>,
    candidate_pool: serde_json::Value,
    filter_trace: serde_json::Value,
    assigned_user_id: Option<i64>,
    allocation_method: Option<&'a str>,
    outcome: &'a str,
}

pub fn record_allocation(conn: &mut PgConnection, report: &AllocationReport) {
    let candidate_pool = serde_json::to_value(&report.candidate_pool)
        .unwrap_or_else(|_| serde_json::Value::Array(vec![]));
    let filter_trace = serde_json::to_value(&report.filter_trace)
        .unwrap_or_else(|_| serde_json::Value::Array(vec![]));
    let row = NewAllocationLog {
        leadid: &report.leadid,
        rule_id: report.rule_id,
        rule_name: report.rule_name.as_deref(),
        candidate_pool,
        filter_trace,
        assigned_user_id: report.assigned_user_id,
        allocation_method: report.allocation_method.map(|m| m.as_str()),
        outcome: report.outcome.as_str(),
    };
    if let Err(e) = diesel::insert_into(allocation_logs::table)
        .values(&row)
        .execute(conn)
    {
        log::error!("failed to write allocation log for {}: {}", report.leadid, e);
    }
}

pub fn record_manual_reassignment(conn: &mut PgConnection, leadid: &str, user_id: i64) {
    let row = NewAllocationLog {
        leadid,
        rule_id: None,
        rule_name: None,
        candidate_pool: serde_json::Value::Array(vec![]),
        filter_trace: serde_json::Value::Array(vec![]),
        assigned_user_id: Some(user_id),
        allocation_method: Some("manual"),
        outcome: "assigned",
    };
    if let Err(e) = diesel::insert_into(allocation_logs::table)
        .values(&row)
        .execute(conn)
    {
        log::error!("failed to write reassignment log for {}: {}", leadid, e);
    }
}

#[derive(Insertable)]
#[diesel(table_name = showings_allocation_logs)]
struct NewShowingLog<'a> {
    community: &'a str,
    assigned_user_id: Option<i64>,
    allocation_method: &'a str,
    queue_type: Option<&'a str>,
    consumed_card_ids: serde_json::Value,
    quality_check: bool,
}

pub fn record_showing(conn: &mut PgConnection, report: &ShowingReport) {
    let consumed_card_ids = serde_json::to_value(&report.consumed_cards)
        .unwrap_or_else(|_| serde_json::Value::Array(vec![]));
    let row = NewShowingLog {
        community: &report.community,
        assigned_user_id: report.assigned_user_id,
        allocation_method: report.method.as_str(),
        queue_type: report.queue_type.as_deref(),
        consumed_card_ids,
        quality_check: report.quality_check,
    };
    if let Err(e) = diesel::insert_into(showings_allocation_logs::table)
        .values(&row)
        .execute(conn)
    {
        log::error!(
            "failed to write showing allocation log for {}: {}",
            report.community,
            e
        );
    }
}
