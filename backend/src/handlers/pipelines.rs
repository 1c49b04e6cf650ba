use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use laneflow_shared::{Pipeline, PipelineColumn};

use crate::error::{ApiResult, AppError};
use crate::validation;
use crate::AppState;

#[derive(Serialize, Deserialize)]
pub struct PipelineCreate {
    pub workspace_id: Uuid,
    pub name: String,
}

#[derive(Serialize, Deserialize)]
pub struct PipelineUpdate {
    pub name: Option<String>,
    pub active: Option<bool>,
}

#[derive(Serialize, Deserialize)]
pub struct ColumnCreate {
    pub name: String,
    pub position: Option<i32>,
    pub color: Option<String>,
    pub icon: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct ColumnUpdate {
    pub name: Option<String>,
    pub position: Option<i32>,
    pub color: Option<String>,
    pub icon: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct PipelineQuery {
    pub workspace_id: Option<Uuid>,
}

pub fn pipeline_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_pipelines).post(create_pipeline))
        .route(
            "/:id",
            get(get_pipeline).put(update_pipeline).delete(delete_pipeline),
        )
        .route("/:id/columns", get(list_columns).post(create_column))
        .route("/columns/:id", put(update_column).delete(delete_column))
}

async fn list_pipelines(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PipelineQuery>,
) -> ApiResult<Json<Vec<Pipeline>>> {
    let pipelines = match params.workspace_id {
        Some(workspace_id) => {
            sqlx::query_as::<_, Pipeline>(
                "SELECT * FROM pipelines WHERE workspace_id = $1 ORDER BY created_at ASC",
            )
            .bind(workspace_id)
            .fetch_all(&state.db_pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines ORDER BY created_at ASC")
                .fetch_all(&state.db_pool)
                .await?
        }
    };

    Ok(Json(pipelines))
}

async fn create_pipeline(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PipelineCreate>,
) -> ApiResult<Json<Pipeline>> {
    let name = validation::string::required_max(&payload.name, "name", 120)?;

    let pipeline = sqlx::query_as::<_, Pipeline>(
        "INSERT INTO pipelines (id, workspace_id, name, active, created_at)
         VALUES ($1, $2, $3, true, NOW())
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(payload.workspace_id)
    .bind(&name)
    .fetch_one(&state.db_pool)
    .await?;

    Ok(Json(pipeline))
}

async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Pipeline>> {
    let pipeline = sqlx::query_as::<_, Pipeline>("SELECT * FROM pipelines WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db_pool)
        .await?
        .ok_or_else(|| AppError::not_found("Pipeline"))?;

    Ok(Json(pipeline))
}

async fn update_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<PipelineUpdate>,
) -> ApiResult<Json<Pipeline>> {
    let name = match &payload.name {
        Some(name) => Some(validation::string::required_max(name, "name", 120)?),
        None => None,
    };

    let pipeline = sqlx::query_as::<_, Pipeline>(
        "UPDATE pipelines SET
             name = COALESCE($2, name),
             active = COALESCE($3, active),
             updated_at = NOW()
         WHERE id = $1
         RETURNING *",
    )
    .bind(id)
    .bind(name)
    .bind(payload.active)
    .fetch_optional(&state.db_pool)
    .await?
    .ok_or_else(|| AppError::not_found("Pipeline"))?;

    Ok(Json(pipeline))
}

async fn delete_pipeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let card_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cards WHERE pipeline_id = $1")
        .bind(id)
        .fetch_one(&state.db_pool)
        .await?;

    if card_count > 0 {
        return Err(AppError::conflict(format!(
            "pipeline still has {} cards",
            card_count
        )));
    }

    let result = sqlx::query("DELETE FROM pipelines WHERE id = $1")
        .bind(id)
        .execute(&state.db_pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Pipeline"));
    }

    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn list_columns(
    State(state): State<Arc<AppState>>,
    Path(pipeline_id): Path<Uuid>,
) -> ApiResult<Json<Vec<PipelineColumn>>> {
    let columns = sqlx::query_as::<_, PipelineColumn>(
        "SELECT * FROM pipeline_columns WHERE pipeline_id = $1 ORDER BY position ASC",
    )
    .bind(pipeline_id)
    .fetch_all(&state.db_pool)
    .await?;

    Ok(Json(columns))
}

async fn create_column(
    State(state): State<Arc<AppState>>,
    Path(pipeline_id): Path<Uuid>,
    Json(payload): Json<ColumnCreate>,
) -> ApiResult<Json<PipelineColumn>> {
    let name = validation::string::required_max(&payload.name, "name", 120)?;

    let pipeline_exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pipelines WHERE id = $1)")
            .bind(pipeline_id)
            .fetch_one(&state.db_pool)
            .await?;
    if !pipeline_exists {
        return Err(AppError::not_found("Pipeline"));
    }

    // Default to the end of the board.
    let position = match payload.position {
        Some(position) => validation::number::non_negative(position, "position")?,
        None => {
            let max: Option<i32> = sqlx::query_scalar(
                "SELECT MAX(position) FROM pipeline_columns WHERE pipeline_id = $1",
            )
            .bind(pipeline_id)
            .fetch_one(&state.db_pool)
            .await?;
            max.map(|p| p + 1).unwrap_or(0)
        }
    };

    let column = sqlx::query_as::<_, PipelineColumn>(
        "INSERT INTO pipeline_columns (id, pipeline_id, name, position, color, icon, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, NOW())
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(pipeline_id)
    .bind(&name)
    .bind(position)
    .bind(&payload.color)
    .bind(&payload.icon)
    .fetch_one(&state.db_pool)
    .await?;

    Ok(Json(column))
}

async fn update_column(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ColumnUpdate>,
) -> ApiResult<Json<PipelineColumn>> {
    let name = match &payload.name {
        Some(name) => Some(validation::string::required_max(name, "name", 120)?),
        None => None,
    };

    let column = sqlx::query_as::<_, PipelineColumn>(
        "UPDATE pipeline_columns SET
             name = COALESCE($2, name),
             position = COALESCE($3, position),
             color = COALESCE($4, color),
             icon = COALESCE($5, icon),
             updated_at = NOW()
         WHERE id = $1
         RETURNING *",
    )
    .bind(id)
    .bind(name)
    .bind(payload.position)
    .bind(&payload.color)
    .bind(&payload.icon)
    .fetch_optional(&state.db_pool)
    .await?
    .ok_or_else(|| AppError::not_found("Column"))?;

    Ok(Json(column))
}

async fn delete_column(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    // A column with cards cannot be deleted; the cards must be moved first.
    let card_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cards WHERE column_id = $1")
        .bind(id)
        .fetch_one(&state.db_pool)
        .await?;

    if card_count > 0 {
        return Err(AppError::conflict(format!(
            "column still has {} cards",
            card_count
        )));
    }

    let result = sqlx::query("DELETE FROM pipeline_columns WHERE id = $1")
        .bind(id)
        .execute(&state.db_pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Column"));
    }

    Ok(Json(serde_json::json!({ "deleted": true })))
}
