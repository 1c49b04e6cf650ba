use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod automation;
mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod services;
mod validation;
mod websocket;

pub use error::{ApiError, ApiResult, AppError};

pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub ws_manager: websocket::WsManager,
    pub engine: automation::AutomationEngine,
    pub cards: services::CardService,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let ws_manager = websocket::WsManager::new();
    let dispatcher = services::MessageDispatcher::new(&config.transport);
    let engine =
        automation::AutomationEngine::new(db_pool.clone(), dispatcher, ws_manager.clone());
    let cards = services::CardService::new(db_pool.clone(), engine.clone(), ws_manager.clone());

    let mut scheduler =
        jobs::JobScheduler::new(db_pool.clone(), engine.clone(), jobs::JobConfig::from_env())
            .await?;
    scheduler.start().await?;

    let app_state = Arc::new(AppState {
        db_pool,
        ws_manager,
        engine,
        cards,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Laneflow CRM API v1.0.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/pipelines", handlers::pipeline_routes())
        .nest("/api/v1/cards", handlers::card_routes())
        .nest("/api/v1/automations", handlers::automation_routes())
        .nest("/api/v1/funnels", handlers::funnel_routes())
        .route("/ws", get(websocket::websocket_handler))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app).await?;

    scheduler.shutdown().await?;

    Ok(())
}
