use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::AppState;

pub mod dashboard;
pub mod error_logs;
pub mod system;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(error_logs::router(&state))
        .merge(system::router(&state))
        .merge(dashboard::router(&state));

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
