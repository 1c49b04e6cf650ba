use axum::{extract::State, response::Json};
use serde_json::json;
use std::sync::Arc;

use crate::AppState;

pub mod automations;
pub mod cards;
pub mod funnels;
pub mod pipelines;

pub use automations::automation_routes;
pub use cards::card_routes;
pub use funnels::funnel_routes;
pub use pipelines::pipeline_routes;

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let db_healthy = crate::database::health_check(&state.db_pool).await;

    Json(json!({
        "status": if db_healthy { "ok" } else { "degraded" },
        "database": db_healthy,
        "websocket_connections": state.ws_manager.connection_count().await,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
