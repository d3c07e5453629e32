use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool, Type, types::Json};
use strum_macros::{Display, EnumIter, EnumString};
use ts_rs::TS;
use uuid::Uuid;

/// How loudly an event should be surfaced
#[derive(
    Debug,
    Clone,
    Copy,
    Type,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    TS,
    EnumString,
    EnumIter,
    Display,
)]
#[sqlx(type_name = "error_severity", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorSeverity {
    /// ERROR and CRITICAL events are shown to the user.
    pub fn is_user_visible(self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }
}

/// Area of the application an event originated from
#[derive(
    Debug,
    Clone,
    Copy,
    Type,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    TS,
    EnumString,
    EnumIter,
    Display,
)]
#[sqlx(type_name = "error_category", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ErrorCategory {
    Api,
    Database,
    Ui,
    Auth,
}

/// Persisted error/warning record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct ErrorLog {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub message: String,
    pub stack: Option<String>,
    #[ts(type = "Record<string, unknown>")]
    pub metadata: Json<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateErrorLog {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub message: String,
    pub stack: Option<String>,
    #[ts(type = "Record<string, unknown>")]
    pub metadata: Value,
}

/// Optional criteria for querying error logs. Date bounds are inclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct ErrorLogFilter {
    pub severity: Option<ErrorSeverity>,
    pub category: Option<ErrorCategory>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl ErrorLogFilter {
    pub fn between(start_date: Option<DateTime<Utc>>, end_date: Option<DateTime<Utc>>) -> Self {
        Self {
            start_date,
            end_date,
            ..Default::default()
        }
    }

    fn push_where(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        let mut separator = " WHERE ";
        if let Some(severity) = self.severity {
            builder.push(separator).push("severity = ").push_bind(severity);
            separator = " AND ";
        }
        if let Some(category) = self.category {
            builder.push(separator).push("category = ").push_bind(category);
            separator = " AND ";
        }
        if let Some(start) = self.start_date {
            builder.push(separator).push("timestamp >= ").push_bind(start);
            separator = " AND ";
        }
        if let Some(end) = self.end_date {
            builder.push(separator).push("timestamp <= ").push_bind(end);
        }
    }
}

/// Count of persisted events for one {category, severity} pair
#[derive(Debug, Clone, FromRow, PartialEq)]
pub struct ErrorLogCount {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub count: i64,
}

const SELECT_COLUMNS: &str =
    "SELECT id, timestamp, severity, category, message, stack, metadata FROM error_logs";

impl ErrorLog {
    pub async fn create(pool: &SqlitePool, data: &CreateErrorLog) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, ErrorLog>(
            r#"INSERT INTO error_logs (id, timestamp, severity, category, message, stack, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, timestamp, severity, category, message, stack, metadata"#,
        )
        .bind(data.id)
        .bind(data.timestamp)
        .bind(data.severity)
        .bind(data.category)
        .bind(&data.message)
        .bind(&data.stack)
        .bind(Json(&data.metadata))
        .fetch_one(pool)
        .await
    }

    /// Newest first, at most `limit` rows
    pub async fn find_many(
        pool: &SqlitePool,
        filter: &ErrorLogFilter,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        filter.push_where(&mut builder);
        builder
            .push(" ORDER BY timestamp DESC LIMIT ")
            .push_bind(limit);

        builder.build_query_as::<ErrorLog>().fetch_all(pool).await
    }

    pub async fn count_by_category_and_severity(
        pool: &SqlitePool,
        filter: &ErrorLogFilter,
    ) -> Result<Vec<ErrorLogCount>, sqlx::Error> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT category, severity, COUNT(*) AS count FROM error_logs");
        filter.push_where(&mut builder);
        builder.push(" GROUP BY category, severity");

        builder.build_query_as::<ErrorLogCount>().fetch_all(pool).await
    }

    pub async fn delete_older_than(
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM error_logs WHERE timestamp < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::DBService;

    fn record(
        severity: ErrorSeverity,
        category: ErrorCategory,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> CreateErrorLog {
        CreateErrorLog {
            id: Uuid::new_v4(),
            timestamp,
            severity,
            category,
            message: message.to_string(),
            stack: None,
            metadata: json!({ "occurrences": 1 }),
        }
    }

    async fn seeded() -> (DBService, DateTime<Utc>) {
        let db = DBService::new_in_memory().await.unwrap();
        let base = Utc::now() - Duration::hours(1);
        let pool = db.pool();
        let rows = [
            (ErrorSeverity::Error, ErrorCategory::Api, "api down", 0),
            (ErrorSeverity::Error, ErrorCategory::Api, "api slow", 10),
            (ErrorSeverity::Warning, ErrorCategory::Database, "db slow", 20),
            (ErrorSeverity::Critical, ErrorCategory::Auth, "auth broken", 30),
            (ErrorSeverity::Info, ErrorCategory::Ui, "ui reload", 40),
        ];
        for (severity, category, message, offset) in rows {
            ErrorLog::create(
                &pool,
                &record(severity, category, message, base + Duration::seconds(offset)),
            )
            .await
            .unwrap();
        }
        (db, base)
    }

    #[tokio::test]
    async fn create_round_trips_metadata() {
        let db = DBService::new_in_memory().await.unwrap();
        let data = CreateErrorLog {
            stack: Some("at render\nat main".to_string()),
            ..record(ErrorSeverity::Error, ErrorCategory::Ui, "boom", Utc::now())
        };

        let stored = ErrorLog::create(&db.pool(), &data).await.unwrap();

        assert_eq!(stored.id, data.id);
        assert_eq!(stored.severity, ErrorSeverity::Error);
        assert_eq!(stored.stack.as_deref(), Some("at render\nat main"));
        assert_eq!(stored.metadata.0["occurrences"], 1);
    }

    #[tokio::test]
    async fn find_many_is_newest_first_and_limited() {
        let (db, _) = seeded().await;

        let logs = ErrorLog::find_many(&db.pool(), &ErrorLogFilter::default(), 3)
            .await
            .unwrap();

        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["ui reload", "auth broken", "db slow"]);
    }

    #[tokio::test]
    async fn find_many_applies_every_filter() {
        let (db, base) = seeded().await;
        let filter = ErrorLogFilter {
            severity: Some(ErrorSeverity::Error),
            category: Some(ErrorCategory::Api),
            start_date: Some(base + Duration::seconds(5)),
            end_date: Some(base + Duration::seconds(10)),
        };

        let logs = ErrorLog::find_many(&db.pool(), &filter, 100).await.unwrap();

        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "api slow");
    }

    #[tokio::test]
    async fn counts_group_by_category_and_severity() {
        let (db, _) = seeded().await;

        let mut counts = ErrorLog::count_by_category_and_severity(&db.pool(), &ErrorLogFilter::default())
            .await
            .unwrap();
        counts.sort_by_key(|c| (c.category, c.severity));

        assert_eq!(counts.len(), 4);
        assert_eq!(
            counts[0],
            ErrorLogCount {
                category: ErrorCategory::Api,
                severity: ErrorSeverity::Error,
                count: 2,
            }
        );
    }

    #[tokio::test]
    async fn delete_older_than_removes_only_expired_rows() {
        let db = DBService::new_in_memory().await.unwrap();
        let pool = db.pool();
        let now = Utc::now();
        ErrorLog::create(
            &pool,
            &record(ErrorSeverity::Error, ErrorCategory::Api, "old", now - Duration::days(8)),
        )
        .await
        .unwrap();
        ErrorLog::create(
            &pool,
            &record(ErrorSeverity::Error, ErrorCategory::Api, "fresh", now - Duration::days(1)),
        )
        .await
        .unwrap();

        let deleted = ErrorLog::delete_older_than(&pool, now - Duration::days(7))
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        let remaining = ErrorLog::find_many(&pool, &ErrorLogFilter::default(), 100)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message, "fresh");
    }
}
