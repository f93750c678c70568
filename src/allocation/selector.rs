//! Fair selection over a filtered candidate list.
//!
//! Round-robin state lives in the `rotation_cursors` table, one row per
//! scope/key, and is only ever advanced through a single atomic
//! upsert-increment statement so concurrent events cannot observe the
//! same slot.

use std::collections::HashMap;

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use rand::Rng;

use crate::allocation::types::AllocationMethod;
use crate::shared::schema::{followups, rotation_cursors};

pub const SCOPE_GROUP: &str = "group";
pub const SCOPE_SHOWINGS: &str = "showings";

const OPEN_STAGES: [&str; 2] = ["pending", "following"];

#[derive(QueryableByName)]
struct CursorPosition {
    #[diesel(sql_type = BigInt)]
    position: i64,
}

/// Increment-and-fetch on the keyed cursor. Serialized per key by the
/// row lock the statement takes.
pub fn advance_rotation(conn: &mut PgConnection, scope: &str, key: &str) -> QueryResult<i64> {
    let row: CursorPosition = diesel::sql_query(
        "INSERT INTO rotation_cursors (scope, scope_key, position, updated_at) \
         VALUES ($1, $2, 0, NOW()) \
         ON CONFLICT (scope, scope_key) \
         DO UPDATE SET position = rotation_cursors.position + 1, updated_at = NOW() \
         RETURNING position",
    )
    .bind::<Text, _>(scope)
    .bind::<Text, _>(key)
    .get_result(conn)?;
    Ok(row.position)
}

/// The position `advance_rotation` would return, without writing. Used by
/// dry runs, which must not move the rotation.
pub fn peek_rotation(conn: &mut PgConnection, scope: &str, key: &str) -> QueryResult<i64> {
    let current: Option<i64> = rotation_cursors::table
        .filter(rotation_cursors::scope.eq(scope))
        .filter(rotation_cursors::scope_key.eq(key))
        .select(rotation_cursors::position)
        .first(conn)
        .optional()?;
    Ok(current.map(|p| p + 1).unwrap_or(0))
}

pub fn pick_round_robin(position: i64, candidates: &[i64]) -> Option<i64> {
    if candidates.is_empty() {
        return None;
    }
    let index = (position.rem_euclid(candidates.len() as i64)) as usize;
    Some(candidates[index])
}

/// Fewest open items wins; ties break by ascending agent id so repeated
/// runs over the same workload are reproducible.
pub fn pick_least_loaded(candidates: &[i64], open_counts: &HashMap<i64, i64>) -> Option<i64> {
    candidates
        .iter()
        .copied()
        .min_by_key(|c| (open_counts.get(c).copied().unwrap_or(0), *c))
}

fn count_open_items(conn: &mut PgConnection, candidates: &[i64]) -> QueryResult<HashMap<i64, i64>> {
    let mut counts = HashMap::new();
    for &candidate in candidates {
        let open: i64 = followups::table
            .filter(followups::interviewsales_user_id.eq(candidate))
            .filter(followups::followupstage.eq_any(OPEN_STAGES))
            .count()
            .get_result(conn)?;
        counts.insert(candidate, open);
    }
    Ok(counts)
}

/// Picks one agent from the filtered candidate list. `cursor_key` scopes
/// the round-robin rotation; dry runs peek at the cursor instead of
/// advancing it.
pub fn select_candidate(
    conn: &mut PgConnection,
    method: AllocationMethod,
    scope: &str,
    cursor_key: &str,
    candidates: &[i64],
    dry_run: bool,
) -> QueryResult<Option<i64>> {
    if candidates.is_empty() {
        return Ok(None);
    }
    match method {
        AllocationMethod::RoundRobin => {
            let position = if dry_run {
                peek_rotation(conn, scope, cursor_key)?
            } else {
                advance_rotation(conn, scope, cursor_key)?
            };
            Ok(pick_round_robin(position, candidates))
        }
        AllocationMethod::Random => {
            let index = rand::thread_rng().gen_range(0..candidates.len());
            Ok(Some(candidates[index]))
        }
        AllocationMethod::Workload => {
            let counts = count_open_items(conn, candidates)?;
            Ok(pick_least_loaded(candidates, &counts))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_wraps_over_the_candidate_list() {
        let candidates = vec![10, 20, 30];
        assert_eq!(pick_round_robin(0, &candidates), Some(10));
        assert_eq!(pick_round_robin(1, &candidates), Some(20));
        assert_eq!(pick_round_robin(2, &candidates), Some(30));
        assert_eq!(pick_round_robin(3, &candidates), Some(10));
    }

    #[test]
    fn round_robin_distributes_evenly() {
        let candidates = vec![10, 20, 30];
        let n = 20;
        let mut counts: HashMap<i64, i64> = HashMap::new();
        for position in 0..n {
            let picked = pick_round_robin(position, &candidates).unwrap();
            *counts.entry(picked).or_default() += 1;
        }
        let floor = n / candidates.len() as i64;
        let ceil = (n + candidates.len() as i64 - 1) / candidates.len() as i64;
        for member in &candidates {
            let share = counts[member];
            assert!(share == floor || share == ceil, "uneven share {share}");
        }
    }

    #[test]
    fn round_robin_never_picks_a_filtered_member() {
        // group [A, B, C] with B excluded upstream
        let candidates = vec![10, 30];
        for position in 0..12 {
            let picked = pick_round_robin(position, &candidates).unwrap();
            assert_ne!(picked, 20);
        }
    }

    #[test]
    fn round_robin_on_empty_list_yields_none() {
        assert_eq!(pick_round_robin(5, &[]), None);
    }

    #[test]
    fn least_loaded_prefers_fewest_open_items() {
        let counts: HashMap<i64, i64> = [(10, 4), (20, 1), (30, 2)].into_iter().collect();
        assert_eq!(pick_least_loaded(&[10, 20, 30], &counts), Some(20));
    }

    #[test]
    fn least_loaded_breaks_ties_by_ascending_id() {
        let counts: HashMap<i64, i64> = [(30, 2), (10, 2), (20, 2)].into_iter().collect();
        assert_eq!(pick_least_loaded(&[30, 10, 20], &counts), Some(10));
    }

    #[test]
    fn least_loaded_treats_missing_counts_as_zero() {
        let counts: HashMap<i64, i64> = [(10, 1)].into_iter().collect();
        assert_eq!(pick_least_loaded(&[10, 20], &counts), Some(20));
    }
}
