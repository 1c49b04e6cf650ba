use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use laneflow_shared::{Funnel, FunnelStep};

use crate::error::{ApiResult, AppError, ValidationBuilder};
use crate::validation;
use crate::AppState;

const STEP_KINDS: &[&str] = &["message", "audio", "media", "document"];

#[derive(Serialize, Deserialize)]
pub struct StepInput {
    pub kind: String,
    pub content: Option<String>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    #[serde(default)]
    pub delay_seconds: i32,
}

#[derive(Serialize, Deserialize)]
pub struct FunnelCreate {
    pub workspace_id: Uuid,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub steps: Vec<StepInput>,
}

fn default_active() -> bool {
    true
}

#[derive(Serialize, Deserialize)]
pub struct FunnelUpdate {
    pub name: Option<String>,
    pub active: Option<bool>,
    /// When present, replaces the step sequence wholesale.
    pub steps: Option<Vec<StepInput>>,
}

#[derive(Serialize)]
pub struct FunnelWithSteps {
    #[serde(flatten)]
    pub funnel: Funnel,
    pub steps: Vec<FunnelStep>,
}

#[derive(Serialize, Deserialize)]
pub struct FunnelQuery {
    pub workspace_id: Option<Uuid>,
}

pub fn funnel_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_funnels).post(create_funnel))
        .route("/:id", get(get_funnel).put(update_funnel).delete(delete_funnel))
}

fn validate_steps(steps: &[StepInput]) -> ApiResult<()> {
    let mut errors = ValidationBuilder::new();

    for (index, step) in steps.iter().enumerate() {
        let field = format!("steps[{}]", index);

        if !STEP_KINDS.contains(&step.kind.as_str()) {
            errors = errors.error(&field, &format!("unknown step kind '{}'", step.kind));
            continue;
        }
        if step.delay_seconds < 0 {
            errors = errors.error(&field, "delay_seconds must not be negative");
        }
        if step.kind == "message" && step.content.as_deref().unwrap_or("").trim().is_empty() {
            errors = errors.error(&field, "message steps require content");
        }
        if step.kind != "message" && step.file_url.as_deref().unwrap_or("").trim().is_empty() {
            errors = errors.error(&field, "file-backed steps require a file url");
        }
    }

    match errors.build() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

async fn list_funnels(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FunnelQuery>,
) -> ApiResult<Json<Vec<Funnel>>> {
    let funnels = match params.workspace_id {
        Some(workspace_id) => {
            sqlx::query_as::<_, Funnel>(
                "SELECT * FROM funnels WHERE workspace_id = $1 ORDER BY created_at ASC",
            )
            .bind(workspace_id)
            .fetch_all(&state.db_pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Funnel>("SELECT * FROM funnels ORDER BY created_at ASC")
                .fetch_all(&state.db_pool)
                .await?
        }
    };

    Ok(Json(funnels))
}

async fn create_funnel(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<FunnelCreate>,
) -> ApiResult<Json<FunnelWithSteps>> {
    let name = validation::string::required_max(&payload.name, "name", 120)?;
    validate_steps(&payload.steps)?;

    let funnel_id = Uuid::new_v4();

    let mut tx = state.db_pool.begin().await?;

    sqlx::query(
        "INSERT INTO funnels (id, workspace_id, name, active, created_at)
         VALUES ($1, $2, $3, $4, NOW())",
    )
    .bind(funnel_id)
    .bind(payload.workspace_id)
    .bind(&name)
    .bind(payload.active)
    .execute(&mut *tx)
    .await?;

    insert_steps(&mut tx, funnel_id, &payload.steps).await?;

    tx.commit().await?;

    load_funnel(&state, funnel_id).await.map(Json)
}

async fn get_funnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<FunnelWithSteps>> {
    load_funnel(&state, id).await.map(Json)
}

async fn update_funnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<FunnelUpdate>,
) -> ApiResult<Json<FunnelWithSteps>> {
    let name = match &payload.name {
        Some(name) => Some(validation::string::required_max(name, "name", 120)?),
        None => None,
    };
    if let Some(steps) = &payload.steps {
        validate_steps(steps)?;
    }

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM funnels WHERE id = $1)")
        .bind(id)
        .fetch_one(&state.db_pool)
        .await?;
    if !exists {
        return Err(AppError::not_found("Funnel"));
    }

    let mut tx = state.db_pool.begin().await?;

    sqlx::query(
        "UPDATE funnels SET
             name = COALESCE($2, name),
             active = COALESCE($3, active),
             updated_at = NOW()
         WHERE id = $1",
    )
    .bind(id)
    .bind(name)
    .bind(payload.active)
    .execute(&mut *tx)
    .await?;

    if let Some(steps) = &payload.steps {
        sqlx::query("DELETE FROM funnel_steps WHERE funnel_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        insert_steps(&mut tx, id, steps).await?;
    }

    tx.commit().await?;

    load_funnel(&state, id).await.map(Json)
}

async fn delete_funnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let result = sqlx::query("DELETE FROM funnels WHERE id = $1")
        .bind(id)
        .execute(&state.db_pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Funnel"));
    }

    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn insert_steps(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    funnel_id: Uuid,
    steps: &[StepInput],
) -> Result<(), sqlx::Error> {
    for (index, step) in steps.iter().enumerate() {
        sqlx::query(
            "INSERT INTO funnel_steps
                 (id, funnel_id, step_order, kind, content, file_url, file_name, delay_seconds, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(funnel_id)
        .bind(index as i32)
        .bind(&step.kind)
        .bind(&step.content)
        .bind(&step.file_url)
        .bind(&step.file_name)
        .bind(step.delay_seconds)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn load_funnel(state: &Arc<AppState>, id: Uuid) -> ApiResult<FunnelWithSteps> {
    let funnel = sqlx::query_as::<_, Funnel>("SELECT * FROM funnels WHERE id = $1")
        .bind(id)
        .fetch_optional(&state.db_pool)
        .await?
        .ok_or_else(|| AppError::not_found("Funnel"))?;

    let steps = sqlx::query_as::<_, FunnelStep>(
        "SELECT * FROM funnel_steps WHERE funnel_id = $1 ORDER BY step_order ASC",
    )
    .bind(id)
    .fetch_all(&state.db_pool)
    .await?;

    Ok(FunnelWithSteps { funnel, steps })
}
