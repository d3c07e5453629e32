use axum::{Json, Router, extract::State, response::Json as ResponseJson, routing::{get, post}};
use serde::{Deserialize, Serialize};
use services::services::{
    app_shell::AppShell,
    database::DbAction,
    error_boundary::Navigation,
    system_reload::ReloadPhase,
};
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError, routes::error_logs::ClientError};

#[derive(Debug, Serialize, TS)]
pub struct ReloadStatus {
    pub phase: ReloadPhase,
    pub reloading: bool,
    pub error_count: u32,
    pub button_label: String,
}

impl ReloadStatus {
    fn of(shell: &AppShell) -> Self {
        let reloader = shell.reloader();
        Self {
            phase: *reloader.phase().borrow(),
            reloading: reloader.is_reloading(),
            error_count: reloader.error_count(),
            button_label: shell.reload_button_label(),
        }
    }
}

/// A failed client-side route transition
#[derive(Debug, Deserialize, TS)]
pub struct RouteErrorReport {
    pub path: String,
    pub error: ClientError,
}

#[derive(Debug, Serialize, TS)]
pub struct RouteErrorResponse {
    /// Where the client should navigate; absent once the shell is unmounted.
    pub redirect: Option<String>,
}

pub async fn get_reload_status(
    State(state): State<AppState>,
) -> ResponseJson<ApiResponse<ReloadStatus>> {
    ResponseJson(ApiResponse::success(ReloadStatus::of(state.shell())))
}

/// Start a soft reload chain. Returns immediately; progress is visible
/// through the reload status.
pub async fn trigger_reload(State(state): State<AppState>) -> ResponseJson<ApiResponse<ReloadStatus>> {
    state.shell().reload();
    ResponseJson(ApiResponse::success(ReloadStatus::of(state.shell())))
}

pub async fn report_route_error(
    State(state): State<AppState>,
    Json(report): Json<RouteErrorReport>,
) -> Result<ResponseJson<ApiResponse<RouteErrorResponse>>, ApiError> {
    if report.path.trim().is_empty() {
        return Err(ApiError::BadRequest("path must not be empty".to_string()));
    }
    let redirect = state
        .shell()
        .handle_unhandled_rejection(report.error.into(), &report.path)
        .await
        .and_then(|navigation| match navigation {
            Navigation::To(path) | Navigation::Home(path) => Some(path),
            Navigation::Reload | Navigation::Back => None,
        });
    Ok(ResponseJson(ApiResponse::success(RouteErrorResponse { redirect })))
}

pub async fn health(State(state): State<AppState>) -> Result<ResponseJson<ApiResponse<()>>, ApiError> {
    state
        .database()
        .run("Health", DbAction::FindFirst, |pool| async move {
            sqlx::query("SELECT 1").execute(&pool).await
        })
        .await?;
    Ok(ResponseJson(ApiResponse::success(())))
}

pub fn router(_state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/system/reload", get(get_reload_status).post(trigger_reload))
        .route("/system/route-errors", post(report_route_error))
}
