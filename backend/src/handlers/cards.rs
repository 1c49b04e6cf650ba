use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use laneflow_shared::{Card, Connection, Contact, Conversation};

use crate::automation::EntityResolver;
use crate::error::{ApiResult, AppError};
use crate::services::{CardCreate, CardUpdate};
use crate::AppState;

/// A card with its resolved related aggregates
#[derive(Serialize)]
pub struct CardDetail {
    #[serde(flatten)]
    pub card: Card,
    pub contact: Option<Contact>,
    pub conversation: Option<Conversation>,
    pub connection: Option<Connection>,
}

#[derive(Serialize, Deserialize)]
pub struct CardQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub pipeline_id: Option<Uuid>,
    pub column_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    pub status: Option<String>,
    pub search: Option<String>,
}

pub fn card_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_cards).post(create_card))
        .route("/:id", get(get_card).put(update_card).delete(delete_card))
}

async fn list_cards(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CardQuery>,
) -> ApiResult<Json<Vec<Card>>> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut where_clauses: Vec<String> = Vec::new();
    let mut param_count = 0;

    if params.pipeline_id.is_some() {
        param_count += 1;
        where_clauses.push(format!("pipeline_id = ${}", param_count));
    }
    if params.column_id.is_some() {
        param_count += 1;
        where_clauses.push(format!("column_id = ${}", param_count));
    }
    if params.contact_id.is_some() {
        param_count += 1;
        where_clauses.push(format!("contact_id = ${}", param_count));
    }
    if params.assigned_to.is_some() {
        param_count += 1;
        where_clauses.push(format!("assigned_to = ${}", param_count));
    }
    if params.status.is_some() {
        param_count += 1;
        where_clauses.push(format!("status = ${}", param_count));
    }
    if params.search.is_some() {
        param_count += 1;
        where_clauses.push(format!("title ILIKE ${}", param_count));
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", where_clauses.join(" AND "))
    };

    let query = format!(
        "SELECT * FROM cards{} ORDER BY created_at DESC LIMIT {} OFFSET {}",
        where_sql, limit, offset
    );

    let mut q = sqlx::query_as::<_, Card>(&query);
    if let Some(pipeline_id) = params.pipeline_id {
        q = q.bind(pipeline_id);
    }
    if let Some(column_id) = params.column_id {
        q = q.bind(column_id);
    }
    if let Some(contact_id) = params.contact_id {
        q = q.bind(contact_id);
    }
    if let Some(assigned_to) = params.assigned_to {
        q = q.bind(assigned_to);
    }
    if let Some(status) = params.status {
        q = q.bind(status);
    }
    if let Some(search) = params.search {
        q = q.bind(format!("%{}%", search));
    }

    let cards = q.fetch_all(&state.db_pool).await?;

    Ok(Json(cards))
}

async fn create_card(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CardCreate>,
) -> ApiResult<Json<CardDetail>> {
    let card = state.cards.create_card(payload).await?;
    with_relations(&state, card).await.map(Json)
}

async fn get_card(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CardDetail>> {
    let card = sqlx::query_as::<_, Card>("SELECT * FROM cards WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db_pool)
        .await?
        .ok_or_else(|| AppError::not_found("Card"))?;

    with_relations(&state, card).await.map(Json)
}

async fn update_card(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CardUpdate>,
) -> ApiResult<Json<CardDetail>> {
    let card = state.cards.update_card(id, payload).await?;
    with_relations(&state, card).await.map(Json)
}

async fn with_relations(state: &Arc<AppState>, card: Card) -> ApiResult<CardDetail> {
    let context = EntityResolver::new(state.db_pool.clone()).resolve(&card).await?;

    Ok(CardDetail {
        card,
        contact: context.contact,
        conversation: context.conversation,
        connection: context.connection,
    })
}

async fn delete_card(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let result = sqlx::query("DELETE FROM cards WHERE id = $1")
        .bind(id)
        .execute(&state.db_pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Card"));
    }

    Ok(Json(serde_json::json!({ "deleted": true })))
}
