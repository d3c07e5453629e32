use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use services::services::{dashboard::DashboardError, database::DatabaseError};
use thiserror::Error;
use tracing::error;
use utils::response::ApiResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Dashboard(#[from] DashboardError),
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Database(DatabaseError::Timeout(_))
            | ApiError::Dashboard(DashboardError::Database(DatabaseError::Timeout(_))) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ApiError::Database(DatabaseError::Sqlx(_))
            | ApiError::Dashboard(DashboardError::Database(DatabaseError::Sqlx(_))) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Dashboard(DashboardError::Json(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, status = status.as_u16(), "Request failed");
        }
        let body = ApiResponse::<()>::error(&self.to_string());
        (status, Json(body)).into_response()
    }
}
