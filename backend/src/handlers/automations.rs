use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::automation::{ActionKind, Automation, DurationUnit, TriggerKind};
use crate::error::{ApiResult, AppError};
use crate::validation;
use crate::AppState;

#[derive(Serialize, Deserialize)]
pub struct TriggerInput {
    pub kind: TriggerKind,
    pub time_value: Option<i32>,
    pub time_unit: Option<DurationUnit>,
}

#[derive(Serialize, Deserialize)]
pub struct ActionInput {
    pub kind: ActionKind,
    pub order: i32,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
pub struct AutomationCreate {
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub triggers: Vec<TriggerInput>,
    pub actions: Vec<ActionInput>,
}

fn default_active() -> bool {
    true
}

#[derive(Serialize, Deserialize)]
pub struct AutomationUpdate {
    pub name: Option<String>,
    pub active: Option<bool>,
    /// Triggers and actions are child collections of the automation; when
    /// present they replace the existing ones wholesale.
    pub triggers: Option<Vec<TriggerInput>>,
    pub actions: Option<Vec<ActionInput>>,
}

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/columns/:column_id",
            get(list_for_column).post(create_automation),
        )
        .route(
            "/:id",
            get(get_automation)
                .put(update_automation)
                .delete(delete_automation),
        )
}

fn validate_triggers(triggers: &[TriggerInput]) -> ApiResult<()> {
    for trigger in triggers {
        if trigger.kind == TriggerKind::TimeInColumn {
            validation::number::positive(trigger.time_value.unwrap_or(0), "time_value")?;
        }
    }
    Ok(())
}

async fn list_for_column(
    State(state): State<Arc<AppState>>,
    Path(column_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Automation>>> {
    // All automations on the column, regardless of active state or trigger
    // kinds; this is the configuration surface, not the matcher.
    let ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM automations WHERE column_id = $1 ORDER BY created_at ASC",
    )
    .bind(column_id)
    .fetch_all(&state.db_pool)
    .await?;

    let mut automations = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(automation) = state.engine.automation_by_id(id).await? {
            automations.push(automation);
        }
    }

    Ok(Json(automations))
}

async fn create_automation(
    State(state): State<Arc<AppState>>,
    Path(column_id): Path<Uuid>,
    Json(payload): Json<AutomationCreate>,
) -> ApiResult<Json<Automation>> {
    let name = validation::string::required_max(&payload.name, "name", 120)?;
    validate_triggers(&payload.triggers)?;

    let column_exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pipeline_columns WHERE id = $1)")
            .bind(column_id)
            .fetch_one(&state.db_pool)
            .await?;
    if !column_exists {
        return Err(AppError::not_found("Column"));
    }

    let automation_id = Uuid::new_v4();

    let mut tx = state.db_pool.begin().await?;

    sqlx::query(
        "INSERT INTO automations (id, column_id, name, active, created_at)
         VALUES ($1, $2, $3, $4, NOW())",
    )
    .bind(automation_id)
    .bind(column_id)
    .bind(&name)
    .bind(payload.active)
    .execute(&mut *tx)
    .await?;

    insert_children(&mut tx, automation_id, &payload.triggers, &payload.actions).await?;

    tx.commit().await?;

    let automation = state
        .engine
        .automation_by_id(automation_id)
        .await?
        .ok_or_else(|| AppError::not_found("Automation"))?;

    Ok(Json(automation))
}

async fn get_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Automation>> {
    let automation = state
        .engine
        .automation_by_id(id)
        .await?
        .ok_or_else(|| AppError::not_found("Automation"))?;

    Ok(Json(automation))
}

async fn update_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AutomationUpdate>,
) -> ApiResult<Json<Automation>> {
    let name = match &payload.name {
        Some(name) => Some(validation::string::required_max(name, "name", 120)?),
        None => None,
    };
    if let Some(triggers) = &payload.triggers {
        validate_triggers(triggers)?;
    }

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM automations WHERE id = $1)")
        .bind(id)
        .fetch_one(&state.db_pool)
        .await?;
    if !exists {
        return Err(AppError::not_found("Automation"));
    }

    let mut tx = state.db_pool.begin().await?;

    sqlx::query(
        "UPDATE automations SET
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

    if let Some(triggers) = &payload.triggers {
        sqlx::query("DELETE FROM automation_triggers WHERE automation_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        insert_triggers(&mut tx, id, triggers).await?;
    }

    if let Some(actions) = &payload.actions {
        sqlx::query("DELETE FROM automation_actions WHERE automation_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        insert_actions(&mut tx, id, actions).await?;
    }

    tx.commit().await?;

    let automation = state
        .engine
        .automation_by_id(id)
        .await?
        .ok_or_else(|| AppError::not_found("Automation"))?;

    Ok(Json(automation))
}

async fn delete_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let result = sqlx::query("DELETE FROM automations WHERE id = $1")
        .bind(id)
        .execute(&state.db_pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::not_found("Automation"));
    }

    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn insert_children(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    automation_id: Uuid,
    triggers: &[TriggerInput],
    actions: &[ActionInput],
) -> Result<(), sqlx::Error> {
    insert_triggers(tx, automation_id, triggers).await?;
    insert_actions(tx, automation_id, actions).await?;
    Ok(())
}

async fn insert_triggers(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    automation_id: Uuid,
    triggers: &[TriggerInput],
) -> Result<(), sqlx::Error> {
    for trigger in triggers {
        sqlx::query(
            "INSERT INTO automation_triggers (id, automation_id, kind, time_value, time_unit, created_at)
             VALUES ($1, $2, $3, $4, $5, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(automation_id)
        .bind(trigger.kind.as_str())
        .bind(trigger.time_value)
        .bind(trigger.time_unit.map(|u| u.as_str()))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_actions(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    automation_id: Uuid,
    actions: &[ActionInput],
) -> Result<(), sqlx::Error> {
    for action in actions {
        sqlx::query(
            "INSERT INTO automation_actions (id, automation_id, kind, action_order, config, created_at)
             VALUES ($1, $2, $3, $4, $5, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(automation_id)
        .bind(action.kind.as_str())
        .bind(action.order)
        .bind(&action.config)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}
