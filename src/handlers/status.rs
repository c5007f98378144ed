use axum::{Json, Router, extract::State, routing::get};
use tower_http::trace::TraceLayer;

use crate::AppState;
use crate::scrapers::monitor::MonitorStatus;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/monitors", get(get_monitors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

// Phase of every configured monitor and when it entered that phase
async fn get_monitors(State(state): State<AppState>) -> Json<Vec<MonitorStatus>> {
    Json(state.fleet.statuses())
}
