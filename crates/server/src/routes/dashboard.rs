use axum::{
    Json, Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::get,
};
use serde::Serialize;
use services::services::{
    dashboard::{ChartConfig, ChartGrid},
    error_boundary::{ErrorBoundary, ErrorPanel, View},
};
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

/// A dashboard as drawn: the charts, or the panel shown in their place
#[derive(Debug, Serialize, TS)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum DashboardView {
    Charts { charts: Vec<ChartConfig> },
    Loading,
    Failed { panel: ErrorPanel },
}

impl From<View<Vec<ChartConfig>>> for DashboardView {
    fn from(view: View<Vec<ChartConfig>>) -> Self {
        match view {
            View::Content(charts) | View::Fallback(charts) => Self::Charts { charts },
            View::Loading => Self::Loading,
            View::Panel(panel) => Self::Failed { panel },
        }
    }
}

/// Stored layout for a user, or the default charts
pub async fn get_dashboard(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<ChartConfig>>>, ApiError> {
    let charts = state.dashboard().load(user_id).await?;
    Ok(ResponseJson(ApiResponse::success(charts)))
}

/// Render the layout inside an error boundary, so a broken layout yields the
/// error panel instead of a failed request.
pub async fn get_dashboard_view(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<DashboardView>>, ApiError> {
    let charts = state.dashboard().load(user_id).await?;
    let boundary = ErrorBoundary::new(ChartGrid::new(charts), state.boundary_services());
    let view = boundary.render().await;
    Ok(ResponseJson(ApiResponse::success(view.into())))
}

pub async fn save_dashboard(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(charts): Json<Vec<ChartConfig>>,
) -> Result<ResponseJson<ApiResponse<Vec<ChartConfig>>>, ApiError> {
    let charts = state.dashboard().save(user_id, charts).await?;
    Ok(ResponseJson(ApiResponse::success(charts)))
}

pub fn router(_state: &AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/users/{user_id}/dashboard",
            get(get_dashboard).put(save_dashboard),
        )
        .route("/users/{user_id}/dashboard/view", get(get_dashboard_view))
}
