pub mod engine;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::schema::{
    showings, showings_allocation_logs, showings_base_queues, showings_queue_cards,
};
use crate::shared::state::AppState;

use engine::{assign_showing, ShowingReport, CARD_DIRECT, CARD_SKIP};

#[derive(Debug, Deserialize)]
pub struct CreateShowingRequest {
    pub community: String,
    pub leadid: Option<String>,
    pub assigned_user_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCardRequest {
    pub user_id: i64,
    pub community: String,
    pub card_type: String,
    pub remark: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CardListQuery {
    pub card_type: Option<String>,
    pub community: Option<String>,
    pub consumed: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateQueueRequest {
    pub community: String,
    pub members: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateQueueRequest {
    pub members: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LogListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = showings_queue_cards)]
pub struct ShowingQueueCard {
    pub id: i64,
    pub user_id: i64,
    pub community: String,
    pub card_type: String,
    pub consumed: bool,
    pub consumed_at: Option<DateTime<Utc>>,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable)]
#[diesel(table_name = showings_base_queues)]
pub struct BaseShowingQueue {
    pub id: i64,
    pub community: String,
    pub members: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Queryable)]
pub struct ShowingAllocationLogRow {
    pub id: Uuid,
    pub community: String,
    pub assigned_user_id: Option<i64>,
    pub allocation_method: String,
    pub queue_type: Option<String>,
    pub consumed_card_ids: serde_json::Value,
    pub quality_check: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ShowingsStats {
    pub unconsumed_direct_cards: i64,
    pub unconsumed_skip_cards: i64,
    pub total_showings: i64,
}

fn db_error(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}"))
}

/// Inbound visit-request event. The showing record is created inline and
/// the response carries the assignment decision.
pub async fn create_showing(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateShowingRequest>,
) -> Result<Json<ShowingReport>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let report = assign_showing(
        &mut conn,
        &req.community,
        req.assigned_user_id,
        req.leadid.as_deref(),
        false,
    );
    Ok(Json(report))
}

pub async fn test_showing(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateShowingRequest>,
) -> Result<Json<ShowingReport>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let report = assign_showing(
        &mut conn,
        &req.community,
        req.assigned_user_id,
        req.leadid.as_deref(),
        true,
    );
    Ok(Json(report))
}

pub async fn list_cards(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CardListQuery>,
) -> Result<Json<Vec<ShowingQueueCard>>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;

    let mut q = showings_queue_cards::table.into_boxed();
    if let Some(card_type) = query.card_type {
        q = q.filter(showings_queue_cards::card_type.eq(card_type));
    }
    if let Some(community) = query.community {
        q = q.filter(showings_queue_cards::community.eq(community));
    }
    if let Some(consumed) = query.consumed {
        q = q.filter(showings_queue_cards::consumed.eq(consumed));
    }

    let cards: Vec<ShowingQueueCard> = q
        .order(showings_queue_cards::created_at.desc())
        .load(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;
    Ok(Json(cards))
}

#[derive(Insertable)]
#[diesel(table_name = showings_queue_cards)]
struct NewQueueCard {
    user_id: i64,
    community: String,
    card_type: String,
    remark: Option<String>,
}

pub async fn create_card(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCardRequest>,
) -> Result<Json<ShowingQueueCard>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;

    if req.card_type != CARD_DIRECT && req.card_type != CARD_SKIP {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("unknown card type: {}", req.card_type),
        ));
    }

    let card: ShowingQueueCard = diesel::insert_into(showings_queue_cards::table)
        .values(&NewQueueCard {
            user_id: req.user_id,
            community: req.community,
            card_type: req.card_type,
            remark: req.remark,
        })
        .get_result(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert error: {e}")))?;
    Ok(Json(card))
}

pub async fn delete_card(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;

    let deleted = diesel::delete(
        showings_queue_cards::table
            .filter(showings_queue_cards::id.eq(id))
            .filter(showings_queue_cards::consumed.eq(false)),
    )
    .execute(&mut conn)
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Delete error: {e}")))?;
    if deleted == 0 {
        return Err((
            StatusCode::CONFLICT,
            "card does not exist or was already consumed".to_string(),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_queues(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BaseShowingQueue>>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let queues: Vec<BaseShowingQueue> = showings_base_queues::table
        .order(showings_base_queues::community.asc())
        .load(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;
    Ok(Json(queues))
}

#[derive(Insertable)]
#[diesel(table_name = showings_base_queues)]
struct NewBaseQueue {
    community: String,
    members: Vec<i64>,
}

pub async fn create_queue(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateQueueRequest>,
) -> Result<Json<BaseShowingQueue>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let queue: BaseShowingQueue = diesel::insert_into(showings_base_queues::table)
        .values(&NewBaseQueue {
            community: req.community,
            members: req.members,
        })
        .get_result(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert error: {e}")))?;
    Ok(Json(queue))
}

pub async fn update_queue(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateQueueRequest>,
) -> Result<Json<BaseShowingQueue>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let updated: BaseShowingQueue =
        diesel::update(showings_base_queues::table.filter(showings_base_queues::id.eq(id)))
            .set(showings_base_queues::members.eq(req.members))
            .get_result(&mut conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => {
                    (StatusCode::NOT_FOUND, "Queue not found".to_string())
                }
                other => (StatusCode::INTERNAL_SERVER_ERROR, format!("Update error: {other}")),
            })?;
    Ok(Json(updated))
}

pub async fn list_showing_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogListQuery>,
) -> Result<Json<Vec<ShowingAllocationLogRow>>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let logs: Vec<ShowingAllocationLogRow> = showings_allocation_logs::table
        .order(showings_allocation_logs::created_at.desc())
        .limit(limit)
        .load(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;
    Ok(Json(logs))
}

pub async fn get_showings_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ShowingsStats>, (StatusCode, String)> {
    let mut conn = state.conn.get().map_err(db_error)?;

    let unconsumed_direct_cards: i64 = showings_queue_cards::table
        .filter(showings_queue_cards::card_type.eq(CARD_DIRECT))
        .filter(showings_queue_cards::consumed.eq(false))
        .count()
        .get_result(&mut conn)
        .unwrap_or(0);
    let unconsumed_skip_cards: i64 = showings_queue_cards::table
        .filter(showings_queue_cards::card_type.eq(CARD_SKIP))
        .filter(showings_queue_cards::consumed.eq(false))
        .count()
        .get_result(&mut conn)
        .unwrap_or(0);
    let total_showings: i64 = showings::table.count().get_result(&mut conn).unwrap_or(0);

    Ok(Json(ShowingsStats {
        unconsumed_direct_cards,
        unconsumed_skip_cards,
        total_showings,
    }))
}

pub fn configure_showings_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/showings", post(create_showing))
        .route("/api/showings/test", post(test_showing))
        .route("/api/showings/cards", get(list_cards).post(create_card))
        .route("/api/showings/cards/:id", delete(delete_card))
        .route("/api/showings/queues", get(list_queues).post(create_queue))
        .route("/api/showings/queues/:id", axum::routing::put(update_queue))
        .route("/api/showings/logs", get(list_showing_logs))
        .route("/api/showings/stats", get(get_showings_stats))
}
