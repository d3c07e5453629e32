//! Error log reporting and inspection.

use axum::{
    Json, Router,
    extract::{Query, State},
    response::Json as ResponseJson,
    routing::get,
};
use chrono::{DateTime, Utc};
use db::models::error_log::{ErrorCategory, ErrorLog, ErrorLogFilter, ErrorSeverity};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use services::services::error_logger::{ErrorAggregation, LogEntry, LogOutcome, ReportedError};
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{AppState, error::ApiError};

#[derive(Debug, Default, Deserialize, TS)]
pub struct ErrorLogQuery {
    pub severity: Option<ErrorSeverity>,
    pub category: Option<ErrorCategory>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize, TS)]
pub struct DateRangeQuery {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Error details as sent by a client
#[derive(Debug, Deserialize, TS)]
pub struct ClientError {
    pub name: Option<String>,
    pub message: String,
    pub stack: Option<String>,
}

impl From<ClientError> for ReportedError {
    fn from(error: ClientError) -> Self {
        let reported = match error.name {
            Some(name) => ReportedError::named(name, error.message),
            None => ReportedError::new(error.message),
        };
        match error.stack {
            Some(stack) => reported.with_stack(stack),
            None => reported,
        }
    }
}

#[derive(Debug, Deserialize, TS)]
pub struct ClientErrorReport {
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default)]
    pub error: Option<ClientError>,
    #[serde(default)]
    #[ts(type = "Record<string, unknown>")]
    pub metadata: Map<String, Value>,
}

impl From<ClientErrorReport> for LogEntry {
    fn from(report: ClientErrorReport) -> Self {
        let mut entry = LogEntry::new(report.severity, report.category, report.message)
            .with_metadata_map(report.metadata);
        if let Some(error) = report.error {
            entry = entry.with_error(error.into());
        }
        entry
    }
}

#[derive(Debug, Serialize, TS)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReportOutcome {
    Ignored,
    RateLimited,
    Deduplicated { occurrences: u32 },
    Persisted { log: ErrorLog },
    PersistFailed,
}

impl From<LogOutcome> for ReportOutcome {
    fn from(outcome: LogOutcome) -> Self {
        match outcome {
            LogOutcome::Ignored => Self::Ignored,
            LogOutcome::RateLimited => Self::RateLimited,
            LogOutcome::Deduplicated { occurrences } => Self::Deduplicated { occurrences },
            LogOutcome::Persisted(log) => Self::Persisted { log },
            LogOutcome::PersistFailed => Self::PersistFailed,
        }
    }
}

pub async fn list_error_logs(
    State(state): State<AppState>,
    Query(query): Query<ErrorLogQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<ErrorLog>>>, ApiError> {
    if query.limit.is_some_and(|limit| limit <= 0) {
        return Err(ApiError::BadRequest("limit must be positive".to_string()));
    }
    let filter = ErrorLogFilter {
        severity: query.severity,
        category: query.category,
        start_date: query.start_date,
        end_date: query.end_date,
    };
    let logs = state.logger().get_error_logs(&filter, query.limit).await;
    Ok(ResponseJson(ApiResponse::success(logs)))
}

/// Client-side errors enter the same logging policy as server-side ones.
pub async fn report_error(
    State(state): State<AppState>,
    Json(report): Json<ClientErrorReport>,
) -> Result<ResponseJson<ApiResponse<ReportOutcome>>, ApiError> {
    if report.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }
    let outcome = state.logger().log_error(report.into()).await;
    Ok(ResponseJson(ApiResponse::success(outcome.into())))
}

pub async fn get_aggregation(
    State(state): State<AppState>,
    Query(range): Query<DateRangeQuery>,
) -> Result<ResponseJson<ApiResponse<ErrorAggregation>>, ApiError> {
    let aggregation = state
        .logger()
        .get_error_aggregation(range.start_date, range.end_date)
        .await;
    Ok(ResponseJson(ApiResponse::success(aggregation)))
}

pub fn router(_state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/error-logs", get(list_error_logs).post(report_error))
        .route("/error-logs/aggregation", get(get_aggregation))
}
