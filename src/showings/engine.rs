//! Visit-request assignment: manual override, direct-pass cards, then
//! the per-community base rotation with skip-card handling.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::allocation::selector::{self, SCOPE_SHOWINGS};
use crate::allocation::types::UserProfile;
use crate::audit;
use crate::shared::errors::EngineError;
use crate::shared::schema::{showings, showings_base_queues, showings_queue_cards, users_profile};

pub const CARD_DIRECT: &str = "direct";
pub const CARD_SKIP: &str = "skip";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShowingMethod {
    Assigned,
    DirectCard,
    Rotation,
    None,
}

impl ShowingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShowingMethod::Assigned => "assigned",
            ShowingMethod::DirectCard => "direct",
            ShowingMethod::Rotation => "rotation",
            ShowingMethod::None => "none",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumedCard {
    pub id: i64,
    pub card_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShowingReport {
    pub community: String,
    pub assigned_user_id: Option<i64>,
    pub method: ShowingMethod,
    pub queue_type: Option<String>,
    pub consumed_cards: Vec<ConsumedCard>,
    pub quality_check: bool,
}

impl ShowingReport {
    fn unassigned(community: &str) -> Self {
        Self {
            community: community.to_string(),
            assigned_user_id: None,
            method: ShowingMethod::None,
            queue_type: None,
            consumed_cards: Vec::new(),
            quality_check: true,
        }
    }
}

/// Marks a card consumed only if it still is unconsumed. A zero row count
/// means a concurrent selection won the race.
fn consume_card(conn: &mut PgConnection, card_id: i64) -> Result<(), EngineError> {
    let updated = diesel::update(
        showings_queue_cards::table
            .filter(showings_queue_cards::id.eq(card_id))
            .filter(showings_queue_cards::consumed.eq(false)),
    )
    .set((
        showings_queue_cards::consumed.eq(true),
        showings_queue_cards::consumed_at.eq(Some(Utc::now())),
    ))
    .execute(conn)?;
    if updated == 0 {
        return Err(EngineError::CardConsumptionConflict { card_id });
    }
    Ok(())
}

fn oldest_unconsumed_card(
    conn: &mut PgConnection,
    community: &str,
    card_type: &str,
    user_id: Option<i64>,
) -> QueryResult<Option<i64>> {
    let mut query = showings_queue_cards::table
        .filter(showings_queue_cards::community.eq(community))
        .filter(showings_queue_cards::card_type.eq(card_type))
        .filter(showings_queue_cards::consumed.eq(false))
        .select(showings_queue_cards::id)
        .into_boxed();
    if let Some(user_id) = user_id {
        query = query.filter(showings_queue_cards::user_id.eq(user_id));
    }
    query
        .order((
            showings_queue_cards::created_at.asc(),
            showings_queue_cards::id.asc(),
        ))
        .first(conn)
        .optional()
}

fn card_holder(conn: &mut PgConnection, card_id: i64) -> QueryResult<i64> {
    showings_queue_cards::table
        .filter(showings_queue_cards::id.eq(card_id))
        .select(showings_queue_cards::user_id)
        .first(conn)
}

fn is_active(conn: &mut PgConnection, user_id: i64) -> QueryResult<bool> {
    let profile: Option<UserProfile> = users_profile::table
        .filter(users_profile::id.eq(user_id))
        .first(conn)
        .optional()?;
    Ok(profile.map(|p| p.is_active()).unwrap_or(false))
}

/// Pure rotation planning over a snapshot: used by dry runs and tests.
/// `skip_cards_by_user` holds each member's unconsumed skip card ids,
/// oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPlan {
    pub assigned: Option<i64>,
    pub consumed_skip_ids: Vec<i64>,
}

pub fn plan_rotation(
    members: &[i64],
    start_position: i64,
    skip_cards_by_user: &HashMap<i64, Vec<i64>>,
    active: &HashSet<i64>,
) -> RotationPlan {
    if members.is_empty() {
        return RotationPlan {
            assigned: None,
            consumed_skip_ids: Vec::new(),
        };
    }
    let mut remaining: HashMap<i64, Vec<i64>> = skip_cards_by_user.clone();
    let skip_total: usize = remaining.values().map(Vec::len).sum();
    let max_steps = members.len() + skip_total;
    let mut consumed = Vec::new();
    let mut position = start_position;
    for _ in 0..max_steps {
        let candidate = members[(position.rem_euclid(members.len() as i64)) as usize];
        position += 1;
        if !active.contains(&candidate) {
            continue;
        }
        match remaining.get_mut(&candidate).and_then(|cards| {
            if cards.is_empty() {
                None
            } else {
                Some(cards.remove(0))
            }
        }) {
            Some(card_id) => consumed.push(card_id),
            None => {
                return RotationPlan {
                    assigned: Some(candidate),
                    consumed_skip_ids: consumed,
                };
            }
        }
    }
    RotationPlan {
        assigned: None,
        consumed_skip_ids: consumed,
    }
}

fn rotation_snapshot(
    conn: &mut PgConnection,
    community: &str,
    members: &[i64],
) -> QueryResult<(HashMap<i64, Vec<i64>>, HashSet<i64>)> {
    let cards: Vec<(i64, i64)> = showings_queue_cards::table
        .filter(showings_queue_cards::community.eq(community))
        .filter(showings_queue_cards::card_type.eq(CARD_SKIP))
        .filter(showings_queue_cards::consumed.eq(false))
        .order((
            showings_queue_cards::created_at.asc(),
            showings_queue_cards::id.asc(),
        ))
        .select((showings_queue_cards::id, showings_queue_cards::user_id))
        .load(conn)?;
    let mut by_user: HashMap<i64, Vec<i64>> = HashMap::new();
    for (id, user_id) in cards {
        by_user.entry(user_id).or_default().push(id);
    }
    let profiles: Vec<UserProfile> = users_profile::table
        .filter(users_profile::id.eq_any(members))
        .load(conn)?;
    let active = profiles
        .iter()
        .filter(|p| p.is_active())
        .map(|p| p.id)
        .collect();
    Ok((by_user, active))
}

fn base_queue_members(conn: &mut PgConnection, community: &str) -> QueryResult<Vec<i64>> {
    let members: Option<Vec<i64>> = showings_base_queues::table
        .filter(showings_base_queues::community.eq(community))
        .select(showings_base_queues::members)
        .first(conn)
        .optional()?;
    Ok(members.unwrap_or_default())
}

/// Walks the base rotation, consuming skip cards as it passes their
/// holders, until a member without one comes up. A lost consume race
/// re-evaluates the same member instead of failing.
fn rotate(
    conn: &mut PgConnection,
    community: &str,
    report: &mut ShowingReport,
    dry_run: bool,
) -> Result<(), EngineError> {
    let members = base_queue_members(conn, community)?;
    if members.is_empty() {
        log::warn!("no base showing queue configured for {}", community);
        return Ok(());
    }
    let (skip_cards, active) = rotation_snapshot(conn, community, &members)?;

    if dry_run {
        let start = selector::peek_rotation(conn, SCOPE_SHOWINGS, community)?;
        let plan = plan_rotation(&members, start, &skip_cards, &active);
        report.assigned_user_id = plan.assigned;
        if plan.assigned.is_some() {
            report.method = ShowingMethod::Rotation;
        }
        report.consumed_cards = plan
            .consumed_skip_ids
            .into_iter()
            .map(|id| ConsumedCard {
                id,
                card_type: CARD_SKIP.to_string(),
            })
            .collect();
        return Ok(());
    }

    let skip_total: usize = skip_cards.values().map(Vec::len).sum();
    let max_steps = members.len() + skip_total;
    for _ in 0..max_steps {
        let position = selector::advance_rotation(conn, SCOPE_SHOWINGS, community)?;
        let candidate = members[(position.rem_euclid(members.len() as i64)) as usize];
        if !active.contains(&candidate) {
            continue;
        }
        loop {
            match oldest_unconsumed_card(conn, community, CARD_SKIP, Some(candidate))? {
                None => {
                    report.assigned_user_id = Some(candidate);
                    report.method = ShowingMethod::Rotation;
                    return Ok(());
                }
                Some(card_id) => match consume_card(conn, card_id) {
                    Ok(()) => {
                        report.consumed_cards.push(ConsumedCard {
                            id: card_id,
                            card_type: CARD_SKIP.to_string(),
                        });
                        break; // advance past this member
                    }
                    Err(EngineError::CardConsumptionConflict { .. }) => {
                        // lost the race, re-check this member's cards
                        log::info!("skip card {} consumed concurrently, re-checking", card_id);
                    }
                    Err(e) => return Err(e),
                },
            }
        }
    }
    log::warn!("showing rotation for {} exhausted without a candidate", community);
    Ok(())
}

#[derive(Insertable)]
#[diesel(table_name = showings)]
struct NewShowing<'a> {
    leadid: Option<&'a str>,
    community: &'a str,
    showingsales: Option<i64>,
}

fn decide(
    conn: &mut PgConnection,
    community: &str,
    manual_user_id: Option<i64>,
    leadid: Option<&str>,
    dry_run: bool,
) -> Result<ShowingReport, EngineError> {
    let mut report = ShowingReport::unassigned(community);

    if let Some(user_id) = manual_user_id {
        // an explicitly assigned agent wins outright
        report.assigned_user_id = Some(user_id);
        report.method = ShowingMethod::Assigned;
        report.quality_check = is_active(conn, user_id)?;
    } else {
        loop {
            match oldest_unconsumed_card(conn, community, CARD_DIRECT, None)? {
                None => {
                    rotate(conn, community, &mut report, dry_run)?;
                    break;
                }
                Some(card_id) => {
                    let holder = card_holder(conn, card_id)?;
                    if !dry_run {
                        match consume_card(conn, card_id) {
                            Ok(()) => {}
                            Err(EngineError::CardConsumptionConflict { .. }) => {
                                log::info!(
                                    "direct card {} consumed concurrently, re-checking",
                                    card_id
                                );
                                continue;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    report.assigned_user_id = Some(holder);
                    report.method = ShowingMethod::DirectCard;
                    report.queue_type = Some(CARD_DIRECT.to_string());
                    report.consumed_cards.push(ConsumedCard {
                        id: card_id,
                        card_type: CARD_DIRECT.to_string(),
                    });
                    report.quality_check = is_active(conn, holder)?;
                    break;
                }
            }
        }
    }

    if !dry_run {
        diesel::insert_into(showings::table)
            .values(&NewShowing {
                leadid,
                community,
                showingsales: report.assigned_user_id,
            })
            .execute(conn)?;
    }
    Ok(report)
}

/// Resolves one visit request. Card consumption and the showing insert
/// commit atomically; any internal failure degrades to an unassigned
/// showing, and the attempt is audit-logged either way.
pub fn assign_showing(
    conn: &mut PgConnection,
    community: &str,
    manual_user_id: Option<i64>,
    leadid: Option<&str>,
    dry_run: bool,
) -> ShowingReport {
    let decision =
        conn.transaction(|conn| decide(conn, community, manual_user_id, leadid, dry_run));
    let report = match decision {
        Ok(report) => report,
        Err(e) => {
            log::error!("showing assignment for {} failed: {}", community, e);
            // the rolled-back transaction took the visit record with it;
            // the triggering write must still land, just unassigned
            if !dry_run {
                if let Err(e) = diesel::insert_into(showings::table)
                    .values(&NewShowing {
                        leadid,
                        community,
                        showingsales: None,
                    })
                    .execute(conn)
                {
                    log::error!("failed to persist unassigned showing for {}: {}", community, e);
                }
            }
            ShowingReport::unassigned(community)
        }
    };
    if !dry_run {
        audit::record_showing(conn, &report);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(members: &[i64]) -> HashSet<i64> {
        members.iter().copied().collect()
    }

    #[test]
    fn rotation_assigns_next_member_in_order() {
        let members = vec![10, 20, 30];
        let plan = plan_rotation(&members, 1, &HashMap::new(), &active(&members));
        assert_eq!(plan.assigned, Some(20));
        assert!(plan.consumed_skip_ids.is_empty());
    }

    #[test]
    fn skip_card_advances_past_holder_and_is_consumed() {
        let members = vec![10, 20, 30];
        let mut skips = HashMap::new();
        skips.insert(20, vec![77]);
        let plan = plan_rotation(&members, 1, &skips, &active(&members));
        assert_eq!(plan.assigned, Some(30));
        assert_eq!(plan.consumed_skip_ids, vec![77]);
    }

    #[test]
    fn one_skip_card_defers_exactly_one_turn() {
        let members = vec![10, 20];
        let mut skips = HashMap::new();
        skips.insert(10, vec![5]);
        // first pass over 10 burns the card
        let first = plan_rotation(&members, 0, &skips, &active(&members));
        assert_eq!(first.assigned, Some(20));
        assert_eq!(first.consumed_skip_ids, vec![5]);
        // with the card gone, 10 is selectable again
        let second = plan_rotation(&members, 0, &HashMap::new(), &active(&members));
        assert_eq!(second.assigned, Some(10));
    }

    #[test]
    fn consecutive_skip_holders_are_all_passed() {
        let members = vec![10, 20, 30];
        let mut skips = HashMap::new();
        skips.insert(10, vec![1]);
        skips.insert(20, vec![2]);
        let plan = plan_rotation(&members, 0, &skips, &active(&members));
        assert_eq!(plan.assigned, Some(30));
        assert_eq!(plan.consumed_skip_ids, vec![1, 2]);
    }

    #[test]
    fn inactive_members_are_passed_without_consuming_cards() {
        let members = vec![10, 20, 30];
        let mut skips = HashMap::new();
        skips.insert(10, vec![1]);
        let mut act = active(&members);
        act.remove(&10);
        let plan = plan_rotation(&members, 0, &skips, &act);
        assert_eq!(plan.assigned, Some(20));
        assert!(plan.consumed_skip_ids.is_empty());
    }

    #[test]
    fn rotation_drains_all_skip_cards_then_assigns() {
        let members = vec![10, 20];
        let mut skips = HashMap::new();
        skips.insert(10, vec![1, 3]);
        skips.insert(20, vec![2, 4]);
        let plan = plan_rotation(&members, 0, &skips, &active(&members));
        // cards burn in rotation order until the wheel comes back around
        assert_eq!(plan.consumed_skip_ids, vec![1, 2, 3, 4]);
        assert_eq!(plan.assigned, Some(10));
    }

    #[test]
    fn all_members_inactive_means_no_assignment() {
        let members = vec![10, 20];
        let plan = plan_rotation(&members, 0, &HashMap::new(), &HashSet::new());
        assert_eq!(plan.assigned, None);
        assert!(plan.consumed_skip_ids.is_empty());
    }

    #[test]
    fn empty_queue_yields_no_assignment() {
        let plan = plan_rotation(&[], 0, &HashMap::new(), &HashSet::new());
        assert_eq!(plan.assigned, None);
    }
}
